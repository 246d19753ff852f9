//! Chunk retrieval for answer grounding.
//!
//! Two strategies run per query and merge by chunk identity: a lexical
//! substring pass over chunk text (most recent first) and, when the store
//! holds vectors, a cosine-ranked pass over the embedded chunks. Vector hits
//! order first in the merge; the first occurrence of a chunk wins.
//!
//! Domain filters then shape the merged set: a query that names the
//! separation agreement narrows to that document's chunks (never to zero),
//! and parenting-focused queries drop chunks that read like financial
//! sections.
//!
//! An alternative path, [`tool_search`], asks the provider's own retrieval
//! tool against the case's mirrored files instead of the chunk table. An
//! answer cycle uses one path or the other, never both.

use std::collections::HashSet;

use sqlx::{FromRow, SqlitePool};

use crate::app::App;
use crate::embedding::{blob_to_vec, cosine_similarity, EmbeddingClient};
use crate::error::Result;
use crate::llm::ToolPassage;

/// One retrieved chunk joined with its document's labeling fields.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkHit {
    pub id: String,
    pub document_id: String,
    pub document_title: String,
    pub document_type: Option<String>,
    pub page_number: Option<i64>,
    pub chunk_index: i64,
    pub text: String,
}

const STOPWORDS: &[&str] = &[
    "when", "what", "who", "whom", "whose", "where", "why", "how", "which", "did", "does", "do",
    "is", "are", "was", "were", "will", "would", "should", "could", "can", "may", "might", "must",
    "have", "has", "had", "been", "being", "the", "a", "an", "in", "on", "at", "to", "of", "for",
    "it", "its", "and", "or", "not", "no", "if", "then", "than", "that", "this", "these", "those",
    "there", "here", "about", "with", "from", "into", "over", "under", "our", "my", "your",
    "their", "his", "her", "we", "they", "you", "me", "us", "them", "any", "all", "some", "say",
    "says", "said", "tell", "show", "give", "please",
];

const PARENTING_TERMS: &[&str] = &[
    "parenting",
    "custody",
    "visitation",
    "holiday",
    "pick-up",
    "pickup",
    "drop-off",
    "dropoff",
    "school week",
    "overnight",
];

const FINANCIAL_TERMS: &[&str] = &[
    "mortgage",
    "equity",
    "tax",
    "asset",
    "valuation",
    "refinanc",
    "pension",
    "401(k)",
    "retirement account",
    "brokerage",
];

/// Combined lexical + vector search over a case's chunks, capped at the
/// configured final limit.
pub async fn search(app: &App, case_id: &str, query: &str) -> Result<Vec<ChunkHit>> {
    let lexical = lexical_search(
        &app.pool,
        case_id,
        query,
        app.config.retrieval.lexical_limit,
    )
    .await?;

    let vector = match &app.embedder {
        Some(embedder) if app.storage_mode.is_vector() => {
            match vector_search(
                &app.pool,
                embedder,
                case_id,
                query,
                app.config.retrieval.vector_limit,
            )
            .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    // A failed vector pass degrades to lexical-only.
                    tracing::warn!(case = case_id, "vector search failed: {e}");
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    };

    tracing::debug!(
        case = case_id,
        lexical = lexical.len(),
        vector = vector.len(),
        "retrieval passes complete"
    );

    let merged = merge_hits(vector, lexical, app.config.retrieval.final_limit);
    let narrowed = narrow_to_named_agreement(query, merged);
    Ok(suppress_financial_sections(query, narrowed))
}

/// Provider-side retrieval: one forced file-search turn against the case's
/// vector store. `None` means the case has no store yet and the tool path is
/// not available.
pub async fn tool_search(
    app: &App,
    case_id: &str,
    query: &str,
) -> Result<Option<Vec<ToolPassage>>> {
    let store: Option<String> = sqlx::query_scalar("SELECT vector_store_id FROM cases WHERE id = ?")
        .bind(case_id)
        .fetch_optional(&app.pool)
        .await?
        .flatten();
    let Some(store) = store else {
        return Ok(None);
    };
    let passages = app
        .llm
        .generate_with_file_search(TOOL_SEARCH_INSTRUCTIONS, query, &store, true)
        .await?;
    Ok(Some(passages))
}

const TOOL_SEARCH_INSTRUCTIONS: &str =
    "Search the attached case files for passages relevant to the user's question. \
     Always call the file search tool. Return the passages the search surfaces; \
     do not answer the question yourself.";

/// Lowercased query terms worth searching for: tokens of length >= 3 that are
/// not stopwords, deduplicated in order. Falls back to the whole trimmed
/// query when nothing survives.
fn lexical_needles(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in query.split(|c: char| !c.is_ascii_alphanumeric()) {
        let token = token.to_ascii_lowercase();
        if token.len() < 3 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    if out.is_empty() {
        let whole = query.trim().to_string();
        if !whole.is_empty() {
            out.push(whole);
        }
    }
    out
}

async fn lexical_search(
    pool: &SqlitePool,
    case_id: &str,
    query: &str,
    limit: i64,
) -> Result<Vec<ChunkHit>> {
    let needles = lexical_needles(query);
    if needles.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT c.id, c.document_id, d.title AS document_title, d.document_type, \
                c.page_number, c.chunk_index, c.text \
         FROM chunks c JOIN documents d ON d.id = c.document_id \
         WHERE c.case_id = ? AND (",
    );
    for i in 0..needles.len() {
        if i > 0 {
            sql.push_str(" OR ");
        }
        sql.push_str("c.text LIKE ? ESCAPE '\\'");
    }
    sql.push_str(") ORDER BY c.created_at DESC, c.document_id ASC, c.chunk_index ASC LIMIT ?");

    let mut query = sqlx::query_as::<_, ChunkHit>(&sql).bind(case_id);
    for needle in &needles {
        query = query.bind(format!("%{}%", escape_like(needle)));
    }
    Ok(query.bind(limit).fetch_all(pool).await?)
}

fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

async fn vector_search(
    pool: &SqlitePool,
    embedder: &EmbeddingClient,
    case_id: &str,
    query: &str,
    limit: i64,
) -> Result<Vec<ChunkHit>> {
    let query_vec = embedder.embed_query(query).await?;

    type Row = (
        String,
        String,
        String,
        Option<String>,
        Option<i64>,
        i64,
        String,
        Vec<u8>,
    );
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT c.id, c.document_id, d.title, d.document_type, \
                c.page_number, c.chunk_index, c.text, v.embedding \
         FROM chunks c \
         JOIN chunk_vectors v ON v.chunk_id = c.id \
         JOIN documents d ON d.id = c.document_id \
         WHERE c.case_id = ?",
    )
    .bind(case_id)
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<(f32, ChunkHit)> = rows
        .into_iter()
        .map(|(id, document_id, title, doc_type, page, index, text, blob)| {
            let score = cosine_similarity(&query_vec, &blob_to_vec(&blob));
            (
                score,
                ChunkHit {
                    id,
                    document_id,
                    document_title: title,
                    document_type: doc_type,
                    page_number: page,
                    chunk_index: index,
                    text,
                },
            )
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit.max(0) as usize);
    Ok(scored.into_iter().map(|(_, hit)| hit).collect())
}

/// Vector hits first, then lexical; first occurrence of a chunk id wins.
fn merge_hits(vector: Vec<ChunkHit>, lexical: Vec<ChunkHit>, cap: usize) -> Vec<ChunkHit> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for hit in vector.into_iter().chain(lexical) {
        if out.len() >= cap {
            break;
        }
        if seen.insert(hit.id.clone()) {
            out.push(hit);
        }
    }
    out
}

/// When the query names the separation agreement and one is among the hits,
/// keep only that document's chunks. Skipped entirely when it would empty
/// the result set.
fn narrow_to_named_agreement(query: &str, hits: Vec<ChunkHit>) -> Vec<ChunkHit> {
    if !query.to_lowercase().contains("separation agreement") {
        return hits;
    }
    let narrowed: Vec<ChunkHit> = hits
        .iter()
        .filter(|hit| is_agreement_document(hit))
        .cloned()
        .collect();
    if narrowed.is_empty() {
        hits
    } else {
        narrowed
    }
}

fn is_agreement_document(hit: &ChunkHit) -> bool {
    let title = hit.document_title.to_lowercase();
    let doc_type = hit
        .document_type
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    title.contains("separation agreement") || doc_type.contains("separation")
}

/// For parenting-focused queries, drop chunks that look like financial
/// sections (two or more distinct asset/mortgage/tax/equity terms).
fn suppress_financial_sections(query: &str, hits: Vec<ChunkHit>) -> Vec<ChunkHit> {
    let q = query.to_lowercase();
    if !PARENTING_TERMS.iter().any(|t| q.contains(t)) {
        return hits;
    }
    hits.into_iter()
        .filter(|hit| !looks_financial(&hit.text))
        .collect()
}

fn looks_financial(text: &str) -> bool {
    let t = text.to_lowercase();
    FINANCIAL_TERMS.iter().filter(|k| t.contains(*k)).count() >= 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{new_id, now_ts};

    fn hit(id: &str, document_id: &str, title: &str, text: &str) -> ChunkHit {
        ChunkHit {
            id: id.to_string(),
            document_id: document_id.to_string(),
            document_title: title.to_string(),
            document_type: None,
            page_number: None,
            chunk_index: 0,
            text: text.to_string(),
        }
    }

    #[test]
    fn needles_drop_stopwords_and_dedupe() {
        let needles = lexical_needles("What is the holiday schedule for the holiday?");
        assert_eq!(needles, vec!["holiday", "schedule"]);
    }

    #[test]
    fn needles_fall_back_to_whole_query() {
        assert_eq!(lexical_needles("is it on?"), vec!["is it on?"]);
        assert!(lexical_needles("   ").is_empty());
    }

    #[test]
    fn escape_like_neutralizes_wildcards() {
        assert_eq!(escape_like("50%_a\\b"), "50\\%\\_a\\\\b");
    }

    #[test]
    fn merge_keeps_vector_priority_and_caps() {
        let vector = vec![hit("a", "d1", "t", "va"), hit("b", "d1", "t", "vb")];
        let lexical = vec![
            hit("b", "d1", "t", "lb"),
            hit("c", "d1", "t", "lc"),
            hit("d", "d1", "t", "ld"),
        ];
        let merged = merge_hits(vector, lexical, 3);
        let ids: Vec<&str> = merged.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(merged[1].text, "vb");
    }

    #[test]
    fn agreement_query_narrows_to_agreement_document() {
        let hits = vec![
            hit("a", "d1", "Separation Agreement 2023", "custody of the children"),
            hit("b", "d2", "school email", "pickup times"),
        ];
        let narrowed =
            narrow_to_named_agreement("what does the separation agreement say about custody", hits);
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].document_id, "d1");
    }

    #[test]
    fn agreement_narrowing_never_empties_results() {
        let hits = vec![hit("a", "d2", "school email", "pickup times")];
        let kept = narrow_to_named_agreement("separation agreement terms?", hits.clone());
        assert_eq!(kept.len(), hits.len());
    }

    #[test]
    fn parenting_query_drops_financial_chunks() {
        let hits = vec![
            hit("a", "d1", "agreement", "The mortgage and home equity are divided evenly."),
            hit("b", "d1", "agreement", "Weekend visitation alternates between parents."),
        ];
        let kept = suppress_financial_sections("what is the custody arrangement?", hits.clone());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "b");

        let unchanged = suppress_financial_sections("how is the mortgage split?", hits);
        assert_eq!(unchanged.len(), 2);
    }

    #[test]
    fn single_financial_term_is_not_suppressed() {
        let hits = vec![hit(
            "a",
            "d1",
            "agreement",
            "The tax dependency claim for the child alternates each year.",
        )];
        let kept = suppress_financial_sections("custody of the child", hits);
        assert_eq!(kept.len(), 1);
    }

    async fn test_app(dir: &tempfile::TempDir) -> App {
        let mut config = Config::minimal();
        config.db.path = dir.path().join("test.db");
        config.blobs.root = Some(dir.path().join("blobs"));
        App::connect(config).await.unwrap()
    }

    async fn seed_chunk(
        pool: &SqlitePool,
        case_id: &str,
        document_id: &str,
        text: &str,
        created_at: i64,
    ) -> String {
        let id = new_id();
        sqlx::query(
            "INSERT INTO chunks (id, case_id, document_id, page_number, chunk_index, text, created_at) \
             VALUES (?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(&id)
        .bind(case_id)
        .bind(document_id)
        .bind(created_at)
        .bind(text)
        .bind(created_at)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn lexical_search_is_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_id();
        sqlx::query("INSERT INTO cases (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&case_id)
            .bind("Search test")
            .bind(now_ts())
            .execute(&app.pool)
            .await
            .unwrap();
        let document_id = new_id();
        sqlx::query(
            "INSERT INTO documents (id, case_id, title, blob_url, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&document_id)
        .bind(&case_id)
        .bind("plan.txt")
        .bind("local://x/plan.txt")
        .bind(now_ts())
        .execute(&app.pool)
        .await
        .unwrap();

        let older =
            seed_chunk(&app.pool, &case_id, &document_id, "holiday schedule draft", 100).await;
        let newer =
            seed_chunk(&app.pool, &case_id, &document_id, "holiday schedule final", 200).await;

        let hits = search(&app, &case_id, "what is the holiday schedule?")
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, newer);
        assert_eq!(hits[1].id, older);
        assert_eq!(hits[0].document_title, "plan.txt");
    }

    #[tokio::test]
    async fn search_caps_at_final_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = test_app(&dir).await;
        app.config.retrieval.lexical_limit = 20;
        let case_id = new_id();
        sqlx::query("INSERT INTO cases (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&case_id)
            .bind("Cap test")
            .bind(now_ts())
            .execute(&app.pool)
            .await
            .unwrap();
        let document_id = new_id();
        sqlx::query(
            "INSERT INTO documents (id, case_id, title, blob_url, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&document_id)
        .bind(&case_id)
        .bind("plan.txt")
        .bind("local://x/plan.txt")
        .bind(now_ts())
        .execute(&app.pool)
        .await
        .unwrap();
        for i in 0..10 {
            seed_chunk(&app.pool, &case_id, &document_id, "visitation paragraph", i).await;
        }

        let hits = search(&app, &case_id, "visitation").await.unwrap();
        assert_eq!(hits.len(), app.config.retrieval.final_limit);
    }
}
