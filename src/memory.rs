//! Case memory extraction: typed entities, facts, timeline events, and
//! obligations derived from a document's chunks.
//!
//! Memory is replaced per document, never merged: a rebuild deletes the
//! document's existing rows and inserts what the current extraction run
//! produced, in one transaction. Batches whose model output fails schema
//! validation are dropped with a warning; losing a batch is preferred over
//! writing malformed records.
//!
//! At most one rebuild runs per case, enforced by an atomic conditional
//! update on the case row. A second caller gets `RebuildInProgress` instead
//! of waiting. The holder heartbeats the lock once per batch; a lock whose
//! heartbeat has gone stale belonged to a dead process and is reclaimed by
//! the next caller.

use sqlx::SqlitePool;

use crate::app::App;
use crate::error::{PipelineError, Result};
use crate::llm::first_json_object;
use crate::models::{
    new_id, now_ts, Chunk, Confidence, EntityKind, FactKind, ObligationKind, SourceRef,
};

const MEMORY_INSTRUCTIONS: &str = "You extract structured case memory from excerpts of a legal case file. \
     Respond with a single JSON object and nothing else, using this shape:\n\
     {\n\
       \"entities\": [{\"kind\", \"name\", \"detail\"?, \"confidence\", \"citations\"}],\n\
       \"facts\": [{\"kind\", \"statement\", \"confidence\", \"citations\"}],\n\
       \"timeline_events\": [{\"date\"?, \"title\", \"summary\"?, \"confidence\", \"citations\"}],\n\
       \"obligations\": [{\"kind\", \"description\", \"due_date\"?, \"recurrence\"?, \"confidence\", \"citations\"}],\n\
       \"document_type\"?: string\n\
     }\n\
     entity kind must be one of: person, child, lawyer, court, organization, asset.\n\
     fact kind must be one of: custody_arrangement, parenting_schedule, holiday_schedule, \
     support_amount, income, asset_division, debt, residence, communication_rule, travel_rule, \
     education, health, other.\n\
     obligation kind must be one of: payment, exchange, communication, filing, other.\n\
     confidence must be one of: high, medium, low.\n\
     Every item must carry at least one citation: \
     {\"ref_type\": \"document\", \"document_id\": <the id given below>, \
     \"locator\": {\"label\", \"pages\"?, \"section\"?, \"quote\"?}, \"confidence\"}. \
     Quotes are short excerpts of at most two sentences, never whole passages. \
     Dates use YYYY-MM-DD when known, a partial date otherwise. \
     Only extract what the excerpts actually state. Omit empty arrays rather than inventing items.";

/// Per-batch model output. Unknown enum values fail the parse, which drops
/// the whole batch.
#[derive(Debug, serde::Deserialize)]
pub struct MemoryExtraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub facts: Vec<ExtractedFact>,
    #[serde(default)]
    pub timeline_events: Vec<ExtractedEvent>,
    #[serde(default)]
    pub obligations: Vec<ExtractedObligation>,
    #[serde(default)]
    pub document_type: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ExtractedEntity {
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub confidence: Confidence,
    pub citations: Vec<SourceRef>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ExtractedFact {
    pub kind: FactKind,
    pub statement: String,
    pub confidence: Confidence,
    pub citations: Vec<SourceRef>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ExtractedEvent {
    #[serde(default)]
    pub date: Option<String>,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub confidence: Confidence,
    pub citations: Vec<SourceRef>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ExtractedObligation {
    pub kind: ObligationKind,
    pub description: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub recurrence: Option<String>,
    pub confidence: Confidence,
    pub citations: Vec<SourceRef>,
}

#[derive(Debug, Default)]
pub struct RebuildOutcome {
    pub documents_processed: usize,
    pub entities: usize,
    pub facts: usize,
    pub timeline_events: usize,
    pub obligations: usize,
    pub batches_dropped: usize,
}

/// Atomic conditional acquire; returns false if another rebuild holds it.
/// A held lock whose heartbeat is at or before `stale_cutoff` counts as
/// abandoned and is taken over.
pub async fn acquire_rebuild_lock(
    pool: &SqlitePool,
    case_id: &str,
    stale_cutoff: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE cases SET memory_rebuild_lock = 1, memory_rebuild_started_at = ? \
         WHERE id = ? AND (memory_rebuild_lock = 0 \
         OR memory_rebuild_started_at IS NULL OR memory_rebuild_started_at <= ?)",
    )
    .bind(now_ts())
    .bind(case_id)
    .bind(stale_cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Heartbeat for a held lock. A live rebuild refreshes this at least once
/// per batch, which keeps it ahead of any cutoff derived from the per-batch
/// timeout.
async fn touch_rebuild_lock(pool: &SqlitePool, case_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE cases SET memory_rebuild_started_at = ? WHERE id = ? AND memory_rebuild_lock = 1",
    )
    .bind(now_ts())
    .bind(case_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn release_rebuild_lock(pool: &SqlitePool, case_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE cases SET memory_rebuild_lock = 0, memory_rebuild_started_at = NULL WHERE id = ?",
    )
    .bind(case_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Rebuild case memory for all documents of a case, or a restricted subset,
/// oldest first. Returns `RebuildInProgress` without doing work if another
/// rebuild holds the case lock; a lock abandoned by a dead process is
/// reclaimed instead.
pub async fn rebuild_case_memory(
    app: &App,
    case_id: &str,
    document_ids: Option<Vec<String>>,
) -> Result<RebuildOutcome> {
    // A heartbeat older than two batch timeouts cannot belong to a live
    // rebuild.
    let stale_cutoff = now_ts() - 2 * app.config.memory.extraction_timeout_secs as i64;
    if !acquire_rebuild_lock(&app.pool, case_id, stale_cutoff).await? {
        return Err(PipelineError::RebuildInProgress);
    }
    // Lock must clear on every exit path, including errors.
    let result = rebuild_locked(app, case_id, document_ids).await;
    if let Err(e) = release_rebuild_lock(&app.pool, case_id).await {
        tracing::error!(case = case_id, "failed to release memory rebuild lock: {e}");
    }
    result
}

async fn rebuild_locked(
    app: &App,
    case_id: &str,
    document_ids: Option<Vec<String>>,
) -> Result<RebuildOutcome> {
    let documents: Vec<(String, String)> = match &document_ids {
        Some(ids) => {
            let mut rows = Vec::new();
            for id in ids {
                let row: Option<(String, String, i64)> = sqlx::query_as(
                    "SELECT id, title, created_at FROM documents WHERE id = ? AND case_id = ?",
                )
                .bind(id)
                .bind(case_id)
                .fetch_optional(&app.pool)
                .await?;
                if let Some(row) = row {
                    rows.push(row);
                }
            }
            rows.sort_by_key(|(_, _, created)| *created);
            rows.into_iter().map(|(id, title, _)| (id, title)).collect()
        }
        None => sqlx::query_as(
            "SELECT id, title FROM documents WHERE case_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(case_id)
        .fetch_all(&app.pool)
        .await?,
    };

    let mut outcome = RebuildOutcome::default();
    for (document_id, title) in documents {
        let chunks: Vec<Chunk> = sqlx::query_as(
            "SELECT * FROM chunks WHERE document_id = ? ORDER BY page_number ASC, chunk_index ASC",
        )
        .bind(&document_id)
        .fetch_all(&app.pool)
        .await?;
        if chunks.is_empty() {
            // Not yet indexed; nothing to extract from.
            continue;
        }
        let dropped = extract_document(app, case_id, &document_id, &title, &chunks, &mut outcome)
            .await?;
        outcome.batches_dropped += dropped;
        outcome.documents_processed += 1;
    }
    Ok(outcome)
}

/// Run batched extraction for one document and commit the accumulated items
/// in a single delete-then-insert transaction. Returns the number of
/// dropped batches.
async fn extract_document(
    app: &App,
    case_id: &str,
    document_id: &str,
    title: &str,
    chunks: &[Chunk],
    outcome: &mut RebuildOutcome,
) -> Result<usize> {
    let batch_size = app.config.memory.batch_size.max(1);
    let timeout = std::time::Duration::from_secs(app.config.memory.extraction_timeout_secs);

    let mut entities: Vec<ExtractedEntity> = Vec::new();
    let mut facts: Vec<ExtractedFact> = Vec::new();
    let mut events: Vec<ExtractedEvent> = Vec::new();
    let mut obligations: Vec<ExtractedObligation> = Vec::new();
    let mut document_type: Option<String> = None;
    let mut dropped = 0usize;

    for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
        touch_rebuild_lock(&app.pool, case_id).await?;
        let input = batch_context(title, document_id, batch);
        let response = match tokio::time::timeout(
            timeout,
            app.llm.generate(MEMORY_INSTRUCTIONS, &input),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e @ PipelineError::Timeout { .. })) => {
                tracing::warn!(document = document_id, batch = batch_no, "memory batch timed out: {e}");
                dropped += 1;
                continue;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(
                    document = document_id,
                    batch = batch_no,
                    "memory batch timed out after {}s",
                    app.config.memory.extraction_timeout_secs
                );
                dropped += 1;
                continue;
            }
        };

        match parse_extraction(&response) {
            Ok(extraction) => {
                if document_type.is_none() {
                    if let Some(dt) = extraction
                        .document_type
                        .as_deref()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                    {
                        document_type = Some(dt.to_string());
                    }
                }
                entities.extend(extraction.entities);
                facts.extend(extraction.facts);
                events.extend(extraction.timeline_events);
                obligations.extend(extraction.obligations);
            }
            Err(e) => {
                tracing::warn!(
                    document = document_id,
                    batch = batch_no,
                    "memory batch failed validation, dropped: {e}"
                );
                dropped += 1;
            }
        }
    }

    commit_document_memory(
        &app.pool,
        case_id,
        document_id,
        &entities,
        &facts,
        &events,
        &obligations,
        document_type.as_deref(),
    )
    .await?;

    outcome.entities += entities.len();
    outcome.facts += facts.len();
    outcome.timeline_events += events.len();
    outcome.obligations += obligations.len();
    Ok(dropped)
}

/// Page-labeled context for one batch of chunks.
fn batch_context(title: &str, document_id: &str, chunks: &[Chunk]) -> String {
    let mut out = format!("Document: {title}\nDocument id: {document_id}\n");
    let mut last_page: Option<Option<i64>> = None;
    for chunk in chunks {
        if last_page != Some(chunk.page_number) {
            match chunk.page_number {
                Some(p) => out.push_str(&format!("\n[page {p}]\n")),
                None => out.push_str("\n[unpaged]\n"),
            }
            last_page = Some(chunk.page_number);
        }
        out.push_str(&chunk.text);
        out.push('\n');
    }
    out
}

/// Tolerant parse + schema validation for one batch response.
pub fn parse_extraction(response: &str) -> Result<MemoryExtraction> {
    let json = first_json_object(response)
        .ok_or_else(|| PipelineError::Validation("no JSON object in response".to_string()))?;
    let extraction: MemoryExtraction = serde_json::from_str(json)
        .map_err(|e| PipelineError::Validation(format!("memory schema violation: {e}")))?;
    validate_extraction(&extraction)?;
    Ok(extraction)
}

fn validate_extraction(extraction: &MemoryExtraction) -> Result<()> {
    let all_citations = extraction
        .entities
        .iter()
        .map(|e| (&e.citations, "entity"))
        .chain(extraction.facts.iter().map(|f| (&f.citations, "fact")))
        .chain(
            extraction
                .timeline_events
                .iter()
                .map(|e| (&e.citations, "timeline event")),
        )
        .chain(
            extraction
                .obligations
                .iter()
                .map(|o| (&o.citations, "obligation")),
        );
    for (citations, what) in all_citations {
        if citations.is_empty() {
            return Err(PipelineError::Validation(format!(
                "{what} without citations"
            )));
        }
        for citation in citations {
            citation.validate()?;
        }
    }
    for entity in &extraction.entities {
        if entity.name.trim().is_empty() {
            return Err(PipelineError::Validation("entity with empty name".to_string()));
        }
    }
    for fact in &extraction.facts {
        if fact.statement.trim().is_empty() {
            return Err(PipelineError::Validation(
                "fact with empty statement".to_string(),
            ));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn commit_document_memory(
    pool: &SqlitePool,
    case_id: &str,
    document_id: &str,
    entities: &[ExtractedEntity],
    facts: &[ExtractedFact],
    events: &[ExtractedEvent],
    obligations: &[ExtractedObligation],
    document_type: Option<&str>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in [
        "case_entities",
        "case_facts",
        "timeline_events",
        "obligations",
    ] {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE case_id = ? AND document_id = ?"
        ))
        .bind(case_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    }

    let ts = now_ts();
    for entity in entities {
        sqlx::query(
            "INSERT INTO case_entities (id, case_id, document_id, kind, name, detail, confidence, citations_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(case_id)
        .bind(document_id)
        .bind(entity.kind.as_str())
        .bind(&entity.name)
        .bind(&entity.detail)
        .bind(entity.confidence.as_str())
        .bind(citations_json(&entity.citations)?)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
    }
    for fact in facts {
        sqlx::query(
            "INSERT INTO case_facts (id, case_id, document_id, kind, statement, confidence, citations_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(case_id)
        .bind(document_id)
        .bind(fact.kind.as_str())
        .bind(&fact.statement)
        .bind(fact.confidence.as_str())
        .bind(citations_json(&fact.citations)?)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
    }
    for event in events {
        sqlx::query(
            "INSERT INTO timeline_events (id, case_id, document_id, event_date, title, summary, confidence, citations_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(case_id)
        .bind(document_id)
        .bind(&event.date)
        .bind(&event.title)
        .bind(&event.summary)
        .bind(event.confidence.as_str())
        .bind(citations_json(&event.citations)?)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
    }
    for obligation in obligations {
        sqlx::query(
            "INSERT INTO obligations (id, case_id, document_id, kind, description, due_date, recurrence, confidence, citations_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(case_id)
        .bind(document_id)
        .bind(obligation.kind.as_str())
        .bind(&obligation.description)
        .bind(&obligation.due_date)
        .bind(&obligation.recurrence)
        .bind(obligation.confidence.as_str())
        .bind(citations_json(&obligation.citations)?)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
    }

    if let Some(dt) = document_type {
        sqlx::query("UPDATE documents SET document_type = ? WHERE id = ?")
            .bind(dt)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn citations_json(citations: &[SourceRef]) -> Result<String> {
    serde_json::to_string(citations)
        .map_err(|e| PipelineError::Validation(format!("citation serialization failed: {e}")))
}
