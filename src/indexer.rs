//! Chunk-level indexing and provider-side mirroring.
//!
//! [`reindex_document`] is the delete-then-insert path: prior chunks for the
//! document are removed and a freshly chunked, freshly embedded set is
//! written in one transaction. Running it twice on the same extraction is
//! safe and yields an identical sequence.
//!
//! [`mirror_to_provider`] uploads the full extracted text as one provider
//! file and attaches it to the case's vector store, creating the store on
//! first use. This index is independent of the chunk table and backs
//! tool-based retrieval.

use sqlx::SqlitePool;

use crate::chunker::chunk_pages;
use crate::config::ChunkingConfig;
use crate::db::StorageMode;
use crate::embedding::{vec_to_blob, EmbeddingClient};
use crate::error::{PipelineError, Result};
use crate::extract::PageText;
use crate::llm::GenAiClient;
use crate::models::{new_id, now_ts};

pub struct IndexOutcome {
    pub chunk_count: usize,
}

/// External handles for a mirrored document.
pub struct ProviderHandles {
    pub file_id: String,
    pub vector_store_id: String,
}

/// Replace a document's chunks with a newly chunked and embedded set.
///
/// Embedding happens before the transaction opens; the delete and all
/// inserts commit atomically, so readers never observe a half-indexed
/// document. In vector mode every chunk row gets a sibling BLOB row written
/// from the same values.
pub async fn reindex_document(
    pool: &SqlitePool,
    mode: StorageMode,
    embedder: Option<&EmbeddingClient>,
    chunking: &ChunkingConfig,
    case_id: &str,
    document_id: &str,
    pages: &[PageText],
) -> Result<IndexOutcome> {
    let pieces = chunk_pages(pages, chunking.size, chunking.overlap);

    let embeddings: Option<Vec<Vec<f32>>> = match embedder {
        Some(client) if !pieces.is_empty() => {
            let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
            Some(client.embed_texts(&texts).await?)
        }
        _ => None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    let created_at = now_ts();
    for (i, piece) in pieces.iter().enumerate() {
        let chunk_id = new_id();
        let embedding_json = match &embeddings {
            Some(vectors) => Some(serde_json::to_string(&vectors[i]).map_err(|e| {
                PipelineError::Validation(format!("embedding serialization failed: {e}"))
            })?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO chunks (id, case_id, document_id, page_number, chunk_index, text, embedding_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(case_id)
        .bind(document_id)
        .bind(piece.page_number)
        .bind(piece.chunk_index)
        .bind(&piece.text)
        .bind(&embedding_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        if mode.is_vector() {
            if let Some(vectors) = &embeddings {
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, case_id, document_id, embedding) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&chunk_id)
                .bind(case_id)
                .bind(document_id)
                .bind(vec_to_blob(&vectors[i]))
                .execute(&mut *tx)
                .await?;
            }
        }
    }
    tx.commit().await?;

    Ok(IndexOutcome {
        chunk_count: pieces.len(),
    })
}

/// Return the case's vector-store handle, creating one on first use. The
/// handle is persisted before this returns so a later failure cannot orphan
/// the store.
pub async fn ensure_case_vector_store(
    pool: &SqlitePool,
    llm: &GenAiClient,
    case_id: &str,
) -> Result<String> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT vector_store_id FROM cases WHERE id = ?")
            .bind(case_id)
            .fetch_one(pool)
            .await?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let store_id = llm.create_vector_store(&format!("case-{case_id}")).await?;
    sqlx::query("UPDATE cases SET vector_store_id = ? WHERE id = ?")
        .bind(&store_id)
        .bind(case_id)
        .execute(pool)
        .await?;
    Ok(store_id)
}

/// Upload the full extracted text as a provider file and attach it to the
/// case's vector store.
pub async fn mirror_to_provider(
    pool: &SqlitePool,
    llm: &GenAiClient,
    case_id: &str,
    document_title: &str,
    full_text: &str,
) -> Result<ProviderHandles> {
    let filename = format!("{}.txt", crate::blob::sanitize_name(document_title));
    let file_id = llm
        .upload_file(&filename, full_text.as_bytes().to_vec())
        .await?;
    let vector_store_id = ensure_case_vector_store(pool, llm, case_id).await?;
    llm.attach_file_to_vector_store(&vector_store_id, &file_id)
        .await?;
    Ok(ProviderHandles {
        file_id,
        vector_store_id,
    })
}
