//! Ingest job state machine and batch driver.
//!
//! Every uploaded artifact gets one `ingest_jobs` row. `process_*` drives
//! each job through `queued/uploaded → extracting → ready_to_index →
//! indexing → done`, with `error` reachable from any non-terminal state.
//! Batch selection picks jobs in the retry-eligible status set, plus
//! in-flight jobs that outlived the per-job budget (a crashed process
//! leaves those behind). `done` jobs are never reprocessed unless retried
//! by explicit id.
//!
//! The status column is the durable step cursor. A job that already stored
//! its extraction artifact resumes at indexing instead of re-extracting;
//! anything earlier re-runs the whole pipeline.
//!
//! Archives fan out: each non-directory entry becomes its own Document and
//! child job in `queued`, and the parent goes straight to `done`. Children
//! re-enter the same state machine on the next processing pass. Re-running
//! a parent skips entries that already have a child job.

use std::io::Read;
use std::time::Duration;

use futures::future::join_all;
use sqlx::SqlitePool;

use crate::app::App;
use crate::error::{PipelineError, Result};
use crate::extract::{self, Extraction};
use crate::indexer;
use crate::memory;
use crate::models::{new_id, now_ts, IngestJob, JobStatus};

/// Per-entry decompression bound for archive fan-out.
const MAX_ARCHIVE_ENTRY_BYTES: u64 = 100 * 1024 * 1024;

/// Result of one processing invocation.
#[derive(Debug)]
pub struct ProcessSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<JobOutcome>,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub error: Option<String>,
    /// True when retrying the same input reproduces the failure, so the
    /// caller can say "fix the file" instead of "try again".
    pub terminal: bool,
}

/// Store an uploaded file and enqueue its ingest job (`uploaded` state).
pub async fn enqueue_upload(
    app: &App,
    case_id: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<IngestJob> {
    let exists: Option<String> = sqlx::query_scalar("SELECT id FROM cases WHERE id = ?")
        .bind(case_id)
        .fetch_optional(&app.pool)
        .await?;
    if exists.is_none() {
        return Err(PipelineError::Validation(format!("case {case_id} not found")));
    }

    let mime = mime_for_extension(filename);
    let size = bytes.len() as i64;
    let blob_url = app.blobs.put(filename, &bytes, mime).await?;

    let job_id = new_id();
    let ts = now_ts();
    sqlx::query(
        "INSERT INTO ingest_jobs (id, case_id, filename, mime_type, size_bytes, blob_url, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job_id)
    .bind(case_id)
    .bind(filename)
    .bind(mime)
    .bind(size)
    .bind(&blob_url)
    .bind(JobStatus::Uploaded.as_str())
    .bind(ts)
    .bind(ts)
    .execute(&app.pool)
    .await?;

    fetch_job(&app.pool, &job_id).await
}

/// Process a case's pending jobs in creation order, capped at the
/// configured batch limit. Beyond the always-selectable statuses this
/// reclaims jobs parked in an in-flight status for longer than the per-job
/// budget; no live run can still hold such a job, because `process_one`
/// enforces the same budget as a hard timeout.
pub async fn process_case(app: &App, case_id: &str) -> Result<ProcessSummary> {
    let stalled_cutoff = now_ts() - app.config.llm.request_budget_secs as i64;
    let mut query = sqlx::query_as::<_, IngestJob>(
        "SELECT * FROM ingest_jobs WHERE case_id = ? AND (status IN (?, ?, ?, ?) \
         OR (status IN (?, ?) AND updated_at <= ?)) \
         ORDER BY created_at ASC, id ASC LIMIT ?",
    )
    .bind(case_id);
    for status in JobStatus::SELECTABLE {
        query = query.bind(status.as_str());
    }
    for status in JobStatus::IN_FLIGHT {
        query = query.bind(status.as_str());
    }
    let jobs = query
        .bind(stalled_cutoff)
        .bind(app.config.ingest.batch_limit)
        .fetch_all(&app.pool)
        .await?;

    Ok(drive_jobs(app, jobs).await)
}

/// Process an explicit job-id subset, scoped to one case. Ids from other
/// cases report the same "job not found" outcome as unknown ids and the
/// foreign rows stay untouched. Unlike batch selection this will re-run
/// `done` jobs, which is safe: chunking and memory extraction are
/// delete-then-insert, and archive re-expansion skips existing children.
pub async fn process_jobs(app: &App, case_id: &str, job_ids: &[String]) -> Result<ProcessSummary> {
    let mut jobs = Vec::with_capacity(job_ids.len());
    let mut outcomes = Vec::new();
    for id in job_ids {
        let job: Option<IngestJob> =
            sqlx::query_as("SELECT * FROM ingest_jobs WHERE id = ? AND case_id = ?")
                .bind(id)
                .bind(case_id)
                .fetch_optional(&app.pool)
                .await?;
        match job {
            Some(job) => jobs.push(job),
            None => outcomes.push(JobOutcome {
                job_id: id.clone(),
                filename: String::new(),
                status: JobStatus::Error,
                error: Some("job not found".to_string()),
                terminal: true,
            }),
        }
    }
    jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    let mut summary = drive_jobs(app, jobs).await;
    summary.processed += outcomes.len();
    summary.failed += outcomes.len();
    summary.outcomes.extend(outcomes);
    Ok(summary)
}

/// Newest-first job listing for the polling surface.
pub async fn list_jobs(pool: &SqlitePool, case_id: &str) -> Result<Vec<IngestJob>> {
    let jobs = sqlx::query_as(
        "SELECT * FROM ingest_jobs WHERE case_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(case_id)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

/// Run jobs in bounded concurrent groups; each job's steps stay sequential.
async fn drive_jobs(app: &App, jobs: Vec<IngestJob>) -> ProcessSummary {
    let mut outcomes = Vec::with_capacity(jobs.len());
    for group in jobs.chunks(app.config.ingest.max_concurrent.max(1)) {
        let batch = join_all(group.iter().map(|job| process_one(app, job.clone()))).await;
        outcomes.extend(batch);
    }
    let succeeded = outcomes
        .iter()
        .filter(|o| o.status == JobStatus::Done)
        .count();
    ProcessSummary {
        processed: outcomes.len(),
        succeeded,
        failed: outcomes.len() - succeeded,
        outcomes,
    }
}

async fn process_one(app: &App, job: IngestJob) -> JobOutcome {
    let budget = Duration::from_secs(app.config.llm.request_budget_secs);
    let result = match tokio::time::timeout(budget, run_job(app, &job)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::timed_out(
            "ingest job",
            app.config.llm.request_budget_secs,
        )),
    };
    match result {
        Ok(indexed_document) => {
            // Memory extraction runs after the job is done and outside the
            // job budget; a failure here is logged and never flips a
            // finished job back to error.
            if let Some(document_id) = indexed_document {
                extract_memory_for(app, &job.case_id, document_id).await;
            }
            JobOutcome {
                job_id: job.id.clone(),
                filename: job.filename.clone(),
                status: JobStatus::Done,
                error: None,
                terminal: false,
            }
        }
        Err(e) => {
            let terminal = e.is_terminal();
            let message = e.to_string();
            tracing::warn!(job = %job.id, file = %job.filename, terminal, "ingest failed: {message}");
            match record_job_error(&app.pool, &job.id, &message).await {
                Ok(true) => {}
                Ok(false) => {
                    // The budget expired after the final status write had
                    // already committed; the job finished.
                    return JobOutcome {
                        job_id: job.id.clone(),
                        filename: job.filename.clone(),
                        status: JobStatus::Done,
                        error: None,
                        terminal: false,
                    };
                }
                Err(db_err) => {
                    tracing::error!(job = %job.id, "failed to record job error: {db_err}");
                }
            }
            JobOutcome {
                job_id: job.id.clone(),
                filename: job.filename.clone(),
                status: JobStatus::Error,
                error: Some(message),
                terminal,
            }
        }
    }
}

/// Post-done memory extraction. Runs outside the per-job budget; the budget
/// must never cancel a rebuild while the case lock is held.
async fn extract_memory_for(app: &App, case_id: &str, document_id: String) {
    if !app.llm.is_enabled() {
        return;
    }
    match memory::rebuild_case_memory(app, case_id, Some(vec![document_id])).await {
        Ok(_) => {}
        Err(PipelineError::RebuildInProgress) => {
            tracing::debug!(case = %case_id, "memory rebuild already running, skipped");
        }
        Err(e) => {
            tracing::warn!(case = %case_id, "memory extraction failed: {e}");
        }
    }
}

/// The per-job pipeline. Any error propagating out of here marks the job
/// `error` with the message; the job stays selectable for retry. Returns
/// the indexed document id, or `None` when the job expanded an archive
/// instead of indexing a document.
async fn run_job(app: &App, job: &IngestJob) -> Result<Option<String>> {
    let document_id = resolve_document(app, job).await?;

    let extraction = match resumable_extraction(app, job).await {
        Some(extraction) => {
            tracing::info!(job = %job.id, "resuming at indexing from stored extraction");
            extraction
        }
        None => {
            set_status(&app.pool, &job.id, JobStatus::Extracting, None).await?;

            let bytes = app.blobs.fetch(&job.blob_url).await?;

            let ext = extract::file_extension(&job.filename).unwrap_or_default();
            if extract::is_archive(&ext) {
                let created = expand_archive(app, job, &bytes).await?;
                tracing::info!(job = %job.id, children = created, "archive expanded");
                finish_job(&app.pool, &job.id, &document_id, None).await?;
                return Ok(None);
            }

            let extraction =
                extract::extract(&bytes, &job.filename, &job.mime_type, &job.blob_url, &app.llm)
                    .await?;
            store_extraction(app, job, &extraction).await?;
            extraction
        }
    };
    let full_text = extraction.full_text();

    set_status(&app.pool, &job.id, JobStatus::Indexing, None).await?;
    let outcome = indexer::reindex_document(
        &app.pool,
        app.storage_mode,
        app.embedder.as_ref(),
        &app.config.chunking,
        &job.case_id,
        &document_id,
        &extraction.pages,
    )
    .await?;
    tracing::debug!(job = %job.id, chunks = outcome.chunk_count, "document indexed");

    let mut provider_file_id = None;
    if app.llm.is_enabled() {
        let handles =
            indexer::mirror_to_provider(&app.pool, &app.llm, &job.case_id, &job.filename, &full_text)
                .await?;
        sqlx::query("UPDATE documents SET provider_file_id = ?, vector_store_id = ? WHERE id = ?")
            .bind(&handles.file_id)
            .bind(&handles.vector_store_id)
            .bind(&document_id)
            .execute(&app.pool)
            .await?;
        provider_file_id = Some(handles.file_id);
    }

    finish_job(&app.pool, &job.id, &document_id, provider_file_id.as_deref()).await?;

    Ok(Some(document_id))
}

/// Extraction stored by an earlier pass, present when the job already got
/// past the extracting step. Anything unreadable or unparseable falls back
/// to a fresh extraction run.
async fn resumable_extraction(app: &App, job: &IngestJob) -> Option<Extraction> {
    match job.status() {
        Ok(JobStatus::ReadyToIndex) | Ok(JobStatus::Indexing) => {}
        _ => return None,
    }
    let url = job.extracted_text_url.as_deref()?;
    let bytes = match app.blobs.fetch(url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(job = %job.id, "stored extraction unreadable, re-extracting: {e}");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(extraction) => Some(extraction),
        Err(e) => {
            tracing::warn!(job = %job.id, "stored extraction invalid, re-extracting: {e}");
            None
        }
    }
}

/// Persist the page-structured extraction to the byte store and advance the
/// job to `ready_to_index`. The artifact keeps page boundaries rather than
/// flattened text so a reclaimed job can resume without losing page numbers.
async fn store_extraction(app: &App, job: &IngestJob, extraction: &Extraction) -> Result<()> {
    let body = serde_json::to_vec(extraction)
        .map_err(|e| PipelineError::Extract(format!("encoding extraction artifact: {e}")))?;
    let url = app
        .blobs
        .put(
            &format!("{}.extraction.json", job.filename),
            &body,
            "application/json",
        )
        .await?;
    sqlx::query(
        "UPDATE ingest_jobs SET extracted_text_url = ?, status = ?, error = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(&url)
    .bind(JobStatus::ReadyToIndex.as_str())
    .bind(now_ts())
    .bind(&job.id)
    .execute(&app.pool)
    .await?;
    Ok(())
}

/// Reuse the job's linked Document or create one from the job's metadata.
async fn resolve_document(app: &App, job: &IngestJob) -> Result<String> {
    if let Some(existing) = &job.document_id {
        return Ok(existing.clone());
    }
    let document_id = create_document(
        &app.pool,
        &job.case_id,
        &job.filename,
        &job.blob_url,
        &job.mime_type,
        job.size_bytes,
    )
    .await?;
    sqlx::query("UPDATE ingest_jobs SET document_id = ?, updated_at = ? WHERE id = ?")
        .bind(&document_id)
        .bind(now_ts())
        .bind(&job.id)
        .execute(&app.pool)
        .await?;
    Ok(document_id)
}

async fn create_document(
    pool: &SqlitePool,
    case_id: &str,
    title: &str,
    blob_url: &str,
    mime_type: &str,
    size_bytes: i64,
) -> Result<String> {
    let document_id = new_id();
    sqlx::query(
        "INSERT INTO documents (id, case_id, title, blob_url, mime_type, size_bytes, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&document_id)
    .bind(case_id)
    .bind(title)
    .bind(blob_url)
    .bind(mime_type)
    .bind(size_bytes)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(document_id)
}

/// Expand a ZIP upload: one Document + one queued child job per entry.
/// Entries that already have a child job in the case (same name and size)
/// are skipped, so re-running a parent never duplicates its fan-out. All
/// rows land in one transaction; a crash mid-expansion leaves no partial
/// children behind, only orphan blobs.
/// Nested archives are not recursed here; a child that is itself a zip
/// expands when its own job runs.
async fn expand_archive(app: &App, parent: &IngestJob, bytes: &[u8]) -> Result<usize> {
    let entries = read_archive_entries(bytes, MAX_ARCHIVE_ENTRY_BYTES)?;

    let mut pending = Vec::new();
    for (name, data) in entries {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM ingest_jobs WHERE case_id = ? AND filename = ? AND size_bytes = ? AND id != ? LIMIT 1",
        )
        .bind(&parent.case_id)
        .bind(&name)
        .bind(data.len() as i64)
        .bind(&parent.id)
        .fetch_optional(&app.pool)
        .await?;
        if existing.is_some() {
            tracing::debug!(job = %parent.id, entry = %name, "archive entry already has a job, skipped");
            continue;
        }
        let mime = mime_for_extension(&name);
        let blob_url = app.blobs.put(&name, &data, mime).await?;
        pending.push((name, blob_url, mime, data.len() as i64));
    }

    let created = pending.len();
    let mut tx = app.pool.begin().await?;
    let ts = now_ts();
    for (name, blob_url, mime, size) in pending {
        let document_id = new_id();
        sqlx::query(
            "INSERT INTO documents (id, case_id, title, blob_url, mime_type, size_bytes, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&document_id)
        .bind(&parent.case_id)
        .bind(&name)
        .bind(&blob_url)
        .bind(mime)
        .bind(size)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO ingest_jobs (id, case_id, filename, mime_type, size_bytes, blob_url, status, document_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(&parent.case_id)
        .bind(&name)
        .bind(mime)
        .bind(size)
        .bind(&blob_url)
        .bind(JobStatus::Queued.as_str())
        .bind(&document_id)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(created)
}

fn read_archive_entries(bytes: &[u8], max_entry_bytes: u64) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::Extract(format!("ZIP open failed: {e}")))?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::Extract(format!("ZIP entry read failed: {e}")))?;
        if entry.is_dir() || entry.name().starts_with("__MACOSX") {
            continue;
        }
        let name = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|f| f.to_string_lossy().into_owned()))
            .unwrap_or_else(|| format!("entry-{i}"));
        if name == ".DS_Store" || name.starts_with("._") {
            continue;
        }
        // Cap the inflated bytes directly; the size declared in the entry
        // header is not trusted.
        let mut data = Vec::new();
        entry
            .take(max_entry_bytes)
            .read_to_end(&mut data)
            .map_err(|e| PipelineError::Extract(format!("ZIP entry {name}: {e}")))?;
        if data.len() as u64 >= max_entry_bytes {
            return Err(PipelineError::Extract(format!(
                "ZIP entry {name} exceeds size limit ({max_entry_bytes} bytes)"
            )));
        }
        entries.push((name, data));
    }
    Ok(entries)
}

async fn set_status(
    pool: &SqlitePool,
    job_id: &str,
    status: JobStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE ingest_jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(now_ts())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a failure without downgrading a finished job: the budget can
/// expire while the final status write is already committed. Returns false
/// when the job turned out to be `done`.
async fn record_job_error(pool: &SqlitePool, job_id: &str, message: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE ingest_jobs SET status = ?, error = ?, updated_at = ? WHERE id = ? AND status != ?",
    )
    .bind(JobStatus::Error.as_str())
    .bind(message)
    .bind(now_ts())
    .bind(job_id)
    .bind(JobStatus::Done.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn finish_job(
    pool: &SqlitePool,
    job_id: &str,
    document_id: &str,
    provider_file_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE ingest_jobs SET status = ?, error = NULL, document_id = ?, provider_file_id = ?, updated_at = ? WHERE id = ?",
    )
    .bind(JobStatus::Done.as_str())
    .bind(document_id)
    .bind(provider_file_id)
    .bind(now_ts())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn fetch_job(pool: &SqlitePool, job_id: &str) -> Result<IngestJob> {
    let job = sqlx::query_as("SELECT * FROM ingest_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    Ok(job)
}

pub fn mime_for_extension(filename: &str) -> &'static str {
    match extract::file_extension(filename).as_deref() {
        Some(".pdf") => "application/pdf",
        Some(".docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some(".txt") => "text/plain",
        Some(".md") | Some(".markdown") => "text/markdown",
        Some(".rtf") => "application/rtf",
        Some(".csv") => "text/csv",
        Some(".html") | Some(".htm") => "text/html",
        Some(".eml") => "message/rfc822",
        Some(".msg") => "application/vnd.ms-outlook",
        Some(".png") => "image/png",
        Some(".jpg") | Some(".jpeg") => "image/jpeg",
        Some(".gif") => "image/gif",
        Some(".webp") => "image/webp",
        Some(".zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write;

    async fn test_app(dir: &tempfile::TempDir) -> App {
        let mut config = Config::minimal();
        config.db.path = dir.path().join("docket.db");
        config.blobs.root = Some(dir.path().join("blobs"));
        App::connect(config).await.unwrap()
    }

    async fn new_case(app: &App, name: &str) -> String {
        let id = new_id();
        sqlx::query("INSERT INTO cases (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(now_ts())
            .execute(&app.pool)
            .await
            .unwrap();
        id
    }

    async fn chunk_count(pool: &SqlitePool, case_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE case_id = ?")
            .bind(case_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn zip_with_entries(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.add_directory("docs/", zip::write::SimpleFileOptions::default())
                .unwrap();
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn text_upload_reaches_done_with_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Custody matter").await;

        let body = "The father has parenting time every other weekend. ".repeat(40);
        let job = enqueue_upload(&app, &case_id, "agreement.txt", body.into_bytes())
            .await
            .unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Uploaded);

        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);

        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Done);
        assert!(job.document_id.is_some());
        assert!(job.extracted_text_url.is_some());
        assert!(chunk_count(&app.pool, &case_id).await > 1);
    }

    #[tokio::test]
    async fn unsupported_extension_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Archive case").await;

        let job = enqueue_upload(&app, &case_id, "archive.rar", b"not really rar".to_vec())
            .await
            .unwrap();

        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(summary.outcomes[0].terminal);

        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Error);
        assert_eq!(
            job.error.as_deref(),
            Some("Unsupported file type: .rar")
        );
        assert_eq!(chunk_count(&app.pool, &case_id).await, 0);

        // Retrying reproduces the same terminal error.
        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.failed, 1);
        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(
            job.error.as_deref(),
            Some("Unsupported file type: .rar")
        );
    }

    #[tokio::test]
    async fn zip_upload_fans_out_children() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Batch upload").await;

        let zip_bytes = zip_with_entries(&[
            ("docs/plan.txt", "Holiday schedule alternates each year."),
            ("docs/notes.md", "# Exchange notes\nPickup at school."),
        ]);
        let parent = enqueue_upload(&app, &case_id, "batch.zip", zip_bytes)
            .await
            .unwrap();

        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);

        let parent = fetch_job(&app.pool, &parent.id).await.unwrap();
        assert_eq!(parent.status().unwrap(), JobStatus::Done);

        let children: Vec<IngestJob> = sqlx::query_as(
            "SELECT * FROM ingest_jobs WHERE case_id = ? AND id != ? ORDER BY filename",
        )
        .bind(&case_id)
        .bind(&parent.id)
        .fetch_all(&app.pool)
        .await
        .unwrap();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(child.status().unwrap(), JobStatus::Queued);
            assert!(child.document_id.is_some());
        }
        assert_eq!(children[0].filename, "notes.md");
        assert_eq!(children[1].filename, "plan.txt");

        // Next pass picks up the queued children.
        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.succeeded, 2);
        assert!(chunk_count(&app.pool, &case_id).await >= 2);
    }

    #[tokio::test]
    async fn done_jobs_are_not_reselected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Idle case").await;

        enqueue_upload(&app, &case_id, "note.txt", b"Short note body.".to_vec())
            .await
            .unwrap();
        let first = process_case(&app, &case_id).await.unwrap();
        assert_eq!(first.processed, 1);

        let second = process_case(&app, &case_id).await.unwrap();
        assert_eq!(second.processed, 0);
    }

    #[tokio::test]
    async fn explicit_retry_reprocesses_done_job() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Retry case").await;

        let job = enqueue_upload(
            &app,
            &case_id,
            "order.txt",
            "Support is due on the first of each month. ".repeat(30).into_bytes(),
        )
        .await
        .unwrap();
        process_case(&app, &case_id).await.unwrap();
        let before = chunk_count(&app.pool, &case_id).await;

        let summary = process_jobs(&app, &case_id, &[job.id.clone()]).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(chunk_count(&app.pool, &case_id).await, before);
    }

    /// Filesystem path behind a `local://` blob URL in a [`test_app`] store.
    fn blob_path(dir: &tempfile::TempDir, url: &str) -> std::path::PathBuf {
        dir.path()
            .join("blobs")
            .join(url.strip_prefix("local://").unwrap())
    }

    async fn park_job(app: &App, job_id: &str, status: JobStatus, updated_at: i64) {
        sqlx::query("UPDATE ingest_jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(updated_at)
            .bind(job_id)
            .execute(&app.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stalled_in_flight_jobs_reclaim_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Stalled case").await;

        let job = enqueue_upload(
            &app,
            &case_id,
            "motion.txt",
            b"Motion to modify the schedule.".to_vec(),
        )
        .await
        .unwrap();

        // Looks like another process is still extracting it.
        park_job(&app, &job.id, JobStatus::Extracting, now_ts()).await;
        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.processed, 0);

        // Once it outlives the budget it is a crash leftover and re-runs.
        park_job(&app, &job.id, JobStatus::Extracting, now_ts() - 10_000).await;
        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);
        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Done);
    }

    #[tokio::test]
    async fn reclaimed_job_resumes_from_stored_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Crash recovery").await;

        let body = "Exchanges happen at the school on Fridays. ".repeat(40);
        let job = enqueue_upload(&app, &case_id, "order.txt", body.into_bytes())
            .await
            .unwrap();
        process_case(&app, &case_id).await.unwrap();
        let done = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(done.status().unwrap(), JobStatus::Done);
        let chunks_before = chunk_count(&app.pool, &case_id).await;

        // Simulate a crash mid-indexing, then delete the source blob so any
        // attempt to re-extract would fail. Only the resume path can finish.
        park_job(&app, &job.id, JobStatus::Indexing, now_ts() - 10_000).await;
        std::fs::remove_file(blob_path(&dir, &done.blob_url)).unwrap();

        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);
        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Done);
        assert_eq!(chunk_count(&app.pool, &case_id).await, chunks_before);
    }

    #[tokio::test]
    async fn corrupt_stored_extraction_falls_back_to_reextraction() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Fallback case").await;

        let body = "Support payments are due monthly. ".repeat(40);
        let job = enqueue_upload(&app, &case_id, "support.txt", body.into_bytes())
            .await
            .unwrap();
        process_case(&app, &case_id).await.unwrap();
        let done = fetch_job(&app.pool, &job.id).await.unwrap();
        let chunks_before = chunk_count(&app.pool, &case_id).await;

        let artifact = blob_path(&dir, done.extracted_text_url.as_deref().unwrap());
        std::fs::write(&artifact, b"not json").unwrap();
        park_job(&app, &job.id, JobStatus::ReadyToIndex, now_ts()).await;

        let summary = process_case(&app, &case_id).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Done);
        assert_eq!(chunk_count(&app.pool, &case_id).await, chunks_before);
    }

    #[tokio::test]
    async fn reexpanding_archive_skips_existing_children() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Bundle retry").await;

        let zip_bytes = zip_with_entries(&[
            ("docs/plan.txt", "Holiday schedule alternates each year."),
            ("docs/notes.md", "# Exchange notes\nPickup at school."),
        ]);
        let parent = enqueue_upload(&app, &case_id, "batch.zip", zip_bytes)
            .await
            .unwrap();
        process_case(&app, &case_id).await.unwrap();
        process_case(&app, &case_id).await.unwrap();

        let summary = process_jobs(&app, &case_id, &[parent.id.clone()]).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_jobs WHERE case_id = ?")
            .bind(&case_id)
            .fetch_one(&app.pool)
            .await
            .unwrap();
        assert_eq!(jobs, 3);
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE case_id = ?")
            .bind(&case_id)
            .fetch_one(&app.pool)
            .await
            .unwrap();
        assert_eq!(documents, 3);
    }

    #[tokio::test]
    async fn jobs_from_another_case_are_not_processed() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let mine = new_case(&app, "Mine").await;
        let theirs = new_case(&app, "Theirs").await;

        let foreign = enqueue_upload(&app, &theirs, "private.txt", b"Their document.".to_vec())
            .await
            .unwrap();

        let summary = process_jobs(&app, &mine, &[foreign.id.clone()]).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.outcomes[0].error.as_deref(), Some("job not found"));
        assert!(summary.outcomes[0].terminal);

        // The foreign job is untouched and still runs under its own case.
        let job = fetch_job(&app.pool, &foreign.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Uploaded);
        let summary = process_jobs(&app, &theirs, &[foreign.id.clone()])
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn recorded_error_never_downgrades_a_finished_job() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        let case_id = new_case(&app, "Race case").await;

        let job = enqueue_upload(&app, &case_id, "note.txt", b"Short note body.".to_vec())
            .await
            .unwrap();
        process_case(&app, &case_id).await.unwrap();

        // A budget expiry that lost the race against completion is a no-op.
        let landed = record_job_error(&app.pool, &job.id, "ingest job timed out after 120s")
            .await
            .unwrap();
        assert!(!landed);
        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Done);
        assert_eq!(job.error, None);

        // Against an in-flight job the error lands normally.
        park_job(&app, &job.id, JobStatus::Indexing, now_ts()).await;
        let landed = record_job_error(&app.pool, &job.id, "provider closed the connection")
            .await
            .unwrap();
        assert!(landed);
        let job = fetch_job(&app.pool, &job.id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("provider closed the connection"));
    }

    /// Stored-entry zip whose central directory declares `declared` bytes
    /// no matter how large the payload actually is.
    fn stored_zip_with_declared_size(name: &str, body: &[u8], declared: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let stored = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            zip.start_file(name, stored).unwrap();
            zip.write_all(body).unwrap();
            zip.finish().unwrap();
        }
        let header = buf.windows(4).position(|w| w == b"PK\x01\x02").unwrap();
        buf[header + 24..header + 28].copy_from_slice(&declared.to_le_bytes());
        buf
    }

    #[test]
    fn archive_entry_read_is_bounded() {
        let body = "a".repeat(4096);
        let zip = zip_with_entries(&[("docs/big.txt", body.as_str())]);
        let err = read_archive_entries(&zip, 256).unwrap_err();
        assert!(err.to_string().contains("exceeds size limit"));

        let entries = read_archive_entries(&zip, MAX_ARCHIVE_ENTRY_BYTES).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.len(), 4096);
    }

    #[test]
    fn forged_entry_size_does_not_evade_the_cap() {
        // The declared size comes from the archive and can lie; the cap has
        // to bound the bytes actually inflated.
        let body = vec![b'a'; 4096];
        let zip = stored_zip_with_declared_size("big.txt", &body, 10);
        let err = read_archive_entries(&zip, 1024).unwrap_err();
        assert!(err.to_string().contains("exceeds size limit"));
    }

    #[test]
    fn mime_mapping_covers_supported_formats() {
        assert_eq!(mime_for_extension("a.pdf"), "application/pdf");
        assert_eq!(mime_for_extension("a.txt"), "text/plain");
        assert_eq!(mime_for_extension("a.eml"), "message/rfc822");
        assert_eq!(mime_for_extension("a.unknown"), "application/octet-stream");
    }
}
