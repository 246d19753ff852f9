//! Conversation surface around answer synthesis.
//!
//! Every question creates or reuses a thread and records both turns durably:
//! the user turn before the pipeline runs, the assistant turn whatever shape
//! the pipeline produced. Pipeline failures surface as a failure-shaped
//! structured answer, so history never has a question without a response.

use sqlx::SqlitePool;

use crate::answer::{self, StructuredAnswer};
use crate::app::App;
use crate::error::{PipelineError, Result};
use crate::models::{new_id, now_ts, ChatMessage, ChatThread};

/// Longest auto-generated thread title.
const TITLE_MAX_CHARS: usize = 80;

#[derive(Debug)]
pub struct AskOutcome {
    pub thread_id: String,
    pub answer: StructuredAnswer,
}

/// Answer a question in a case, in an existing thread or a fresh one.
pub async fn ask(
    app: &App,
    case_id: &str,
    thread_id: Option<&str>,
    question: &str,
) -> Result<AskOutcome> {
    let question = question.trim();
    if question.is_empty() {
        return Err(PipelineError::Validation("question is empty".to_string()));
    }
    let case: Option<String> = sqlx::query_scalar("SELECT id FROM cases WHERE id = ?")
        .bind(case_id)
        .fetch_optional(&app.pool)
        .await?;
    if case.is_none() {
        return Err(PipelineError::Validation(format!(
            "case not found: {case_id}"
        )));
    }

    let thread_id = match thread_id {
        Some(id) => {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT id FROM chat_threads WHERE id = ? AND case_id = ?")
                    .bind(id)
                    .bind(case_id)
                    .fetch_optional(&app.pool)
                    .await?;
            existing.ok_or_else(|| PipelineError::Validation(format!("thread not found: {id}")))?
        }
        None => create_thread(&app.pool, case_id, Some(&thread_title(question))).await?,
    };

    // The user turn lands before any fallible pipeline work.
    record_turn(
        &app.pool,
        &thread_id,
        case_id,
        "user",
        &serde_json::json!({ "text": question }).to_string(),
    )
    .await?;

    let structured = match answer::synthesize(app, case_id, question).await {
        Ok(answer) => answer,
        Err(e) => {
            tracing::error!(case = case_id, "answer pipeline failed: {e}");
            answer::pipeline_failure_answer(&e.to_string())
        }
    };

    let content = serde_json::to_string(&structured)
        .map_err(|e| PipelineError::Validation(format!("answer serialization failed: {e}")))?;
    record_turn(&app.pool, &thread_id, case_id, "assistant", &content).await?;

    Ok(AskOutcome {
        thread_id,
        answer: structured,
    })
}

pub async fn create_thread(
    pool: &SqlitePool,
    case_id: &str,
    title: Option<&str>,
) -> Result<String> {
    let id = new_id();
    sqlx::query("INSERT INTO chat_threads (id, case_id, title, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(case_id)
        .bind(title)
        .bind(now_ts())
        .execute(pool)
        .await?;
    Ok(id)
}

pub async fn list_threads(pool: &SqlitePool, case_id: &str) -> Result<Vec<ChatThread>> {
    Ok(sqlx::query_as(
        "SELECT * FROM chat_threads WHERE case_id = ? ORDER BY created_at DESC, id ASC",
    )
    .bind(case_id)
    .fetch_all(pool)
    .await?)
}

pub async fn thread_messages(pool: &SqlitePool, thread_id: &str) -> Result<Vec<ChatMessage>> {
    // rowid tiebreak keeps insertion order for turns landing in the same second.
    Ok(sqlx::query_as(
        "SELECT * FROM chat_messages WHERE thread_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await?)
}

async fn record_turn(
    pool: &SqlitePool,
    thread_id: &str,
    case_id: &str,
    role: &str,
    content_json: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO chat_messages (id, thread_id, case_id, role, content_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(thread_id)
    .bind(case_id)
    .bind(role)
    .bind(content_json)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

fn thread_title(question: &str) -> String {
    let collapsed: String = question.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        collapsed
    } else {
        collapsed.chars().take(TITLE_MAX_CHARS).collect()
    }
}
