//! Core data models used throughout docket.
//!
//! These types mirror the relational schema (see `migrate.rs`) plus the
//! `SourceRef` value type that citation-bearing answers and case memory both
//! use. Closed enumerations carry `as_str`/`parse` pairs so their database
//! representation stays explicit.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::PipelineError;

/// Fresh string id for any row.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as epoch seconds, the storage format for all timestamps.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

// ============ Cases & documents ============

#[derive(Debug, Clone, FromRow)]
pub struct Case {
    pub id: String,
    pub name: String,
    pub vector_store_id: Option<String>,
    pub memory_rebuild_lock: i64,
    pub memory_rebuild_started_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Document {
    pub id: String,
    pub case_id: String,
    pub title: String,
    pub blob_url: String,
    pub provider_file_id: Option<String>,
    pub vector_store_id: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    /// Populated lazily by memory extraction; first non-empty value wins.
    pub document_type: Option<String>,
    pub created_at: i64,
}

// ============ Ingest jobs ============

/// Lifecycle of one uploaded artifact. `Queued` and `Uploaded` are both
/// "not yet started"; the distinction records how the artifact arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Uploaded,
    Extracting,
    ReadyToIndex,
    Indexing,
    Done,
    Error,
}

impl JobStatus {
    /// Statuses the batch driver always selects for processing. `Done` is
    /// absent: completed jobs only re-run via explicit job-id retry.
    pub const SELECTABLE: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Uploaded,
        JobStatus::ReadyToIndex,
        JobStatus::Error,
    ];

    /// In-flight markers. A crashed process leaves jobs parked in one of
    /// these; the batch driver reclaims them once they outlive the per-job
    /// time budget.
    pub const IN_FLIGHT: [JobStatus; 2] = [JobStatus::Extracting, JobStatus::Indexing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Uploaded => "uploaded",
            JobStatus::Extracting => "extracting",
            JobStatus::ReadyToIndex => "ready_to_index",
            JobStatus::Indexing => "indexing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "uploaded" => Ok(JobStatus::Uploaded),
            "extracting" => Ok(JobStatus::Extracting),
            "ready_to_index" => Ok(JobStatus::ReadyToIndex),
            "indexing" => Ok(JobStatus::Indexing),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(PipelineError::Validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct IngestJob {
    pub id: String,
    pub case_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub blob_url: String,
    pub status: String,
    pub error: Option<String>,
    pub extracted_text_url: Option<String>,
    pub provider_file_id: Option<String>,
    pub document_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl IngestJob {
    pub fn status(&self) -> Result<JobStatus, PipelineError> {
        JobStatus::parse(&self.status)
    }
}

// ============ Chunks ============

#[derive(Debug, Clone, FromRow)]
pub struct Chunk {
    pub id: String,
    pub case_id: String,
    pub document_id: String,
    pub page_number: Option<i64>,
    /// Zero-based, monotonic across the whole document; the reading-order key.
    pub chunk_index: i64,
    pub text: String,
    pub embedding_json: Option<String>,
    pub created_at: i64,
}

// ============ Case memory rows ============

#[derive(Debug, Clone, FromRow)]
pub struct CaseEntity {
    pub id: String,
    pub case_id: String,
    pub document_id: String,
    pub kind: String,
    pub name: String,
    pub detail: Option<String>,
    pub confidence: String,
    pub citations_json: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct CaseFact {
    pub id: String,
    pub case_id: String,
    pub document_id: String,
    pub kind: String,
    pub statement: String,
    pub confidence: String,
    pub citations_json: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct TimelineEvent {
    pub id: String,
    pub case_id: String,
    pub document_id: String,
    pub event_date: Option<String>,
    pub title: String,
    pub summary: Option<String>,
    pub confidence: String,
    pub citations_json: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Obligation {
    pub id: String,
    pub case_id: String,
    pub document_id: String,
    pub kind: String,
    pub description: String,
    pub due_date: Option<String>,
    pub recurrence: Option<String>,
    pub confidence: String,
    pub citations_json: String,
    pub created_at: i64,
}

// ============ Chat ============

#[derive(Debug, Clone, FromRow)]
pub struct ChatThread {
    pub id: String,
    pub case_id: String,
    pub title: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatMessage {
    pub id: String,
    pub thread_id: String,
    pub case_id: String,
    pub role: String,
    /// Plain `{"text": ...}` for user turns, the full structured answer for
    /// assistant turns.
    pub content_json: String,
    pub created_at: i64,
}

// ============ Closed vocabularies ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Child,
    Lawyer,
    Court,
    Organization,
    Asset,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Person => "person",
            EntityKind::Child => "child",
            EntityKind::Lawyer => "lawyer",
            EntityKind::Court => "court",
            EntityKind::Organization => "organization",
            EntityKind::Asset => "asset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    CustodyArrangement,
    ParentingSchedule,
    HolidaySchedule,
    SupportAmount,
    Income,
    AssetDivision,
    Debt,
    Residence,
    CommunicationRule,
    TravelRule,
    Education,
    Health,
    Other,
}

impl FactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactKind::CustodyArrangement => "custody_arrangement",
            FactKind::ParentingSchedule => "parenting_schedule",
            FactKind::HolidaySchedule => "holiday_schedule",
            FactKind::SupportAmount => "support_amount",
            FactKind::Income => "income",
            FactKind::AssetDivision => "asset_division",
            FactKind::Debt => "debt",
            FactKind::Residence => "residence",
            FactKind::CommunicationRule => "communication_rule",
            FactKind::TravelRule => "travel_rule",
            FactKind::Education => "education",
            FactKind::Health => "health",
            FactKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationKind {
    Payment,
    Exchange,
    Communication,
    Filing,
    Other,
}

impl ObligationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationKind::Payment => "payment",
            ObligationKind::Exchange => "exchange",
            ObligationKind::Communication => "communication",
            ObligationKind::Filing => "filing",
            ObligationKind::Other => "other",
        }
    }
}

// ============ SourceRef ============

/// Human-findable position inside the referenced source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    /// Display label, e.g. a document title or "Separation Agreement p. 4".
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Short excerpt, never a full text blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Locator {
    pub fn labeled(label: impl Into<String>) -> Self {
        Locator {
            label: label.into(),
            pages: None,
            section: None,
            quote: None,
            timestamp: None,
        }
    }
}

/// A typed citation. The discriminant (`ref_type` on the wire) decides which
/// identifier field exists, so a parsed value can never carry a mismatched or
/// duplicated id; the invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ref_type", rename_all = "snake_case")]
pub enum SourceRef {
    Document {
        document_id: String,
        locator: Locator,
        confidence: Confidence,
    },
    TranscriptMessage {
        transcript_message_ids: Vec<String>,
        locator: Locator,
        confidence: Confidence,
    },
    Email {
        email_id: String,
        locator: Locator,
        confidence: Confidence,
    },
    TimelineEvent {
        timeline_event_id: String,
        locator: Locator,
        confidence: Confidence,
    },
    LawyerNote {
        lawyer_note_id: String,
        locator: Locator,
        confidence: Confidence,
    },
    UserNote {
        locator: Locator,
        confidence: Confidence,
    },
}

/// Longest quote a locator may carry, as a sentence count.
const MAX_QUOTE_SENTENCES: usize = 2;

impl SourceRef {
    /// Document citation with a page range, the common case.
    pub fn document(document_id: impl Into<String>, locator: Locator) -> Self {
        SourceRef::Document {
            document_id: document_id.into(),
            locator,
            confidence: Confidence::High,
        }
    }

    pub fn ref_type(&self) -> &'static str {
        match self {
            SourceRef::Document { .. } => "document",
            SourceRef::TranscriptMessage { .. } => "transcript_message",
            SourceRef::Email { .. } => "email",
            SourceRef::TimelineEvent { .. } => "timeline_event",
            SourceRef::LawyerNote { .. } => "lawyer_note",
            SourceRef::UserNote { .. } => "user_note",
        }
    }

    pub fn locator(&self) -> &Locator {
        match self {
            SourceRef::Document { locator, .. }
            | SourceRef::TranscriptMessage { locator, .. }
            | SourceRef::Email { locator, .. }
            | SourceRef::TimelineEvent { locator, .. }
            | SourceRef::LawyerNote { locator, .. }
            | SourceRef::UserNote { locator, .. } => locator,
        }
    }

    /// The referenced document id, when this citation points at a document.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            SourceRef::Document { document_id, .. } => Some(document_id),
            _ => None,
        }
    }

    /// Structural checks serde cannot express: transcript citations need at
    /// least one message id, and quotes must stay excerpt-sized.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let SourceRef::TranscriptMessage {
            transcript_message_ids,
            ..
        } = self
        {
            if transcript_message_ids.is_empty() {
                return Err(PipelineError::Validation(
                    "transcript_message citation has no message ids".to_string(),
                ));
            }
        }
        if let Some(quote) = &self.locator().quote {
            if sentence_count(quote) > MAX_QUOTE_SENTENCES {
                return Err(PipelineError::Validation(format!(
                    "quote exceeds {MAX_QUOTE_SENTENCES} sentences"
                )));
            }
        }
        Ok(())
    }
}

/// Rough sentence count: terminator runs followed by whitespace or
/// end-of-string. Good enough to keep quotes excerpt-sized.
fn sentence_count(text: &str) -> usize {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            while matches!(chars.peek(), Some('.') | Some('!') | Some('?')) {
                chars.next();
            }
            match chars.peek() {
                None => count += 1,
                Some(next) if next.is_whitespace() => count += 1,
                _ => {}
            }
        }
    }
    count.max(1)
}
