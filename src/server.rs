//! HTTP server for the ingest and ask workflow.
//!
//! Exposes the job-polling surface consumed by the (out-of-tree) UI: create
//! cases, upload-adjacent job listing, synchronous processing, and the
//! structured-answer ask endpoint. Processing requests block until their
//! batch finishes or times out; there is no background worker.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/cases` | Create a case |
//! | `GET`  | `/cases/{id}/jobs` | List ingest jobs for a case, newest first |
//! | `POST` | `/cases/{id}/process` | Process pending jobs, or an explicit job-id subset |
//! | `POST` | `/cases/{id}/ask` | Ask a question; returns the structured answer |
//!
//! # Error Contract
//!
//! All error responses share one JSON shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "case name is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `provider` (502), `internal` (500). Ask-pipeline failures do not use this
//! envelope: they come back as a low-confidence structured answer with HTTP
//! 200, so the caller always has one answer shape to render.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::StructuredAnswer;
use crate::app::App;
use crate::chat;
use crate::error::PipelineError;
use crate::ingest;
use crate::models::{new_id, now_ts, IngestJob};

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

/// Starts the HTTP server on the address configured in `[server].bind` and
/// runs until the process is terminated.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let state = AppState { app: Arc::new(app) };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/health", get(handle_health))
        .route("/cases", post(handle_create_case))
        .route("/cases/{id}/jobs", get(handle_list_jobs))
        .route("/cases/{id}/process", post(handle_process))
        .route("/cases/{id}/ask", post(handle_ask))
        .layer(cors)
        .with_state(state);

    println!("docket server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

// ============ Error response ============

/// Wire shape of every error: `{"error": {"code", "message"}}`.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Handler-side error carrying the status and envelope fields.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("request failed: {}", self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::REQUEST_TIMEOUT, "timeout", message)
}

fn provider_error(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_GATEWAY, "provider", message)
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Maps pipeline errors to the most appropriate HTTP status code, so
/// handlers can bubble a typed error without hand-picking statuses.
fn classify_pipeline_error(err: PipelineError) -> AppError {
    match err {
        PipelineError::Validation(message) => bad_request(message),
        e @ PipelineError::Timeout { .. } => timeout_error(e.to_string()),
        PipelineError::Provider(message) => provider_error(message),
        other => internal_error(other.to_string()),
    }
}

async fn require_case(state: &AppState, case_id: &str) -> Result<(), AppError> {
    let exists: Option<String> = sqlx::query_scalar("SELECT id FROM cases WHERE id = ?")
        .bind(case_id)
        .fetch_optional(&state.app.pool)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    match exists {
        Some(_) => Ok(()),
        None => Err(not_found(format!("case not found: {case_id}"))),
    }
}

// ============ GET /health ============

/// Liveness payload: a fixed status plus the crate version.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /cases ============

#[derive(Deserialize)]
struct CreateCaseRequest {
    name: String,
}

#[derive(Serialize)]
struct CaseResponse {
    id: String,
    name: String,
    created_at: i64,
}

async fn handle_create_case(
    State(state): State<AppState>,
    Json(req): Json<CreateCaseRequest>,
) -> Result<(StatusCode, Json<CaseResponse>), AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(bad_request("case name is empty"));
    }
    let id = new_id();
    let created_at = now_ts();
    sqlx::query("INSERT INTO cases (id, name, created_at) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(name)
        .bind(created_at)
        .execute(&state.app.pool)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(CaseResponse {
            id,
            name: name.to_string(),
            created_at,
        }),
    ))
}

// ============ GET /cases/{id}/jobs ============

/// One ingest job in the polling surface.
#[derive(Serialize)]
struct JobResponse {
    id: String,
    filename: String,
    status: String,
    error: Option<String>,
    document_id: Option<String>,
    provider_file_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<IngestJob> for JobResponse {
    fn from(job: IngestJob) -> Self {
        JobResponse {
            id: job.id,
            filename: job.filename,
            status: job.status,
            error: job.error,
            document_id: job.document_id,
            provider_file_id: job.provider_file_id,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    require_case(&state, &case_id).await?;
    let jobs = ingest::list_jobs(&state.app.pool, &case_id)
        .await
        .map_err(classify_pipeline_error)?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

// ============ POST /cases/{id}/process ============

#[derive(Deserialize, Default)]
struct ProcessRequest {
    /// Explicit jobs to (re)process. Empty means "all pending for the case".
    #[serde(default)]
    job_ids: Vec<String>,
}

#[derive(Serialize)]
struct ProcessResponse {
    processed: usize,
    succeeded: usize,
    failed: usize,
    outcomes: Vec<OutcomeResponse>,
}

#[derive(Serialize)]
struct OutcomeResponse {
    job_id: String,
    filename: String,
    status: String,
    error: Option<String>,
    /// True when retrying the same input cannot succeed.
    terminal: bool,
}

async fn handle_process(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    body: Option<Json<ProcessRequest>>,
) -> Result<Json<ProcessResponse>, AppError> {
    require_case(&state, &case_id).await?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let summary = if req.job_ids.is_empty() {
        ingest::process_case(&state.app, &case_id).await
    } else {
        ingest::process_jobs(&state.app, &case_id, &req.job_ids).await
    }
    .map_err(classify_pipeline_error)?;

    Ok(Json(ProcessResponse {
        processed: summary.processed,
        succeeded: summary.succeeded,
        failed: summary.failed,
        outcomes: summary
            .outcomes
            .into_iter()
            .map(|o| OutcomeResponse {
                job_id: o.job_id,
                filename: o.filename,
                status: o.status.as_str().to_string(),
                error: o.error,
                terminal: o.terminal,
            })
            .collect(),
    }))
}

// ============ POST /cases/{id}/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    /// Continue an existing thread; absent starts a new one.
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Serialize)]
struct AskResponse {
    thread_id: String,
    answer: StructuredAnswer,
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    require_case(&state, &case_id).await?;
    let outcome = chat::ask(
        &state.app,
        &case_id,
        req.thread_id.as_deref(),
        &req.question,
    )
    .await
    .map_err(classify_pipeline_error)?;
    Ok(Json(AskResponse {
        thread_id: outcome.thread_id,
        answer: outcome.answer,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_map_to_statuses() {
        let e = classify_pipeline_error(PipelineError::Validation("bad input".to_string()));
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "bad_request");

        let e = classify_pipeline_error(PipelineError::timed_out("chunk search", 20));
        assert_eq!(e.status, StatusCode::REQUEST_TIMEOUT);
        assert!(e.message.contains("timed out"));

        let e = classify_pipeline_error(PipelineError::Provider("503 from upstream".to_string()));
        assert_eq!(e.status, StatusCode::BAD_GATEWAY);
        assert_eq!(e.code, "provider");

        let e = classify_pipeline_error(PipelineError::RebuildInProgress);
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.code, "internal");
    }

    #[test]
    fn error_body_serializes_to_envelope() {
        let e = not_found("case not found: x");
        let body = ErrorBody {
            error: ErrorDetail {
                code: e.code.to_string(),
                message: e.message,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["code"], "not_found");
        assert_eq!(json["error"]["message"], "case not found: x");
    }
}
