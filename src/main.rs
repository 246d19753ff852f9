//! # Docket CLI (`docket`)
//!
//! The `docket` binary is the primary interface for Docket. It provides
//! commands for database initialization, case management, file ingestion,
//! citation-grounded question answering, case-memory maintenance, and
//! starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docket --config ./config/docket.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docket init` | Create the SQLite database and run schema migrations |
//! | `docket case new <name>` | Create a case |
//! | `docket case list` | List cases with document and chunk counts |
//! | `docket add --case <id> <path>...` | Upload files or directories into a case |
//! | `docket process --case <id>` | Run pending ingest jobs for a case |
//! | `docket jobs --case <id>` | Show ingest jobs and their statuses |
//! | `docket ask --case <id> "<question>"` | Ask a question, answered with citations |
//! | `docket memory rebuild --case <id>` | Re-extract structured case memory |
//! | `docket serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! docket init --config ./config/docket.toml
//!
//! # Create a case and upload a folder of records
//! docket case new "Smith v. Smith"
//! docket add --case <case-id> ./records
//!
//! # Run the ingest pipeline and watch job states
//! docket process --case <case-id>
//! docket jobs --case <case-id>
//!
//! # Ask a question grounded in the uploaded documents
//! docket ask --case <case-id> "What does the agreement say about holidays?"
//!
//! # Start the HTTP server
//! docket serve --config ./config/docket.toml
//! ```

mod answer;
mod app;
mod blob;
mod chat;
mod chunker;
mod config;
mod db;
mod embedding;
mod error;
mod extract;
mod indexer;
mod ingest;
mod llm;
mod memory;
mod migrate;
mod models;
mod retrieval;
mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use crate::answer::{ArgumentPoint, StructuredAnswer};
use crate::app::App;
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::SourceRef;

/// Docket CLI, a case-file ingestion and citation-grounded question
/// answering tool for legal matters.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docket.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docket",
    about = "Case-file ingestion and citation-grounded question answering for legal matters",
    version,
    long_about = "Docket provides an upload-to-answer pipeline for legal case files: documents \
    are stored in a byte store, text is extracted and chunked into SQLite, structured case memory \
    is distilled from the chunks, and questions are answered with citation-grounded structured \
    output via a CLI and HTTP server."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docket.toml`. All database, byte-store,
    /// provider, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/docket.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands of the `docket` binary.
#[derive(Subcommand)]
enum Commands {
    /// Create the database schema.
    ///
    /// Creates the SQLite database file and all required tables (cases,
    /// documents, ingest_jobs, chunks, chunk_vectors, memory, and chat
    /// tables). This command is idempotent; running it multiple times is
    /// safe.
    Init,

    /// Create and inspect cases.
    Case {
        #[command(subcommand)]
        action: CaseAction,
    },

    /// Upload files into a case and queue them for processing.
    ///
    /// Each path may be a file or a directory; directories are walked
    /// recursively and every regular file found is uploaded. Files land in
    /// the byte store with one ingest job queued per file. Nothing is
    /// extracted until `process` runs.
    Add {
        /// Case id the files belong to.
        #[arg(long)]
        case: String,

        /// Files or directories to upload.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Run pending ingest jobs for a case.
    ///
    /// Selects jobs in `queued`, `uploaded`, `ready_to_index`, or `error`
    /// state in creation order, plus jobs a crashed run left mid-flight,
    /// and drives each through extraction, chunking, indexing, and memory
    /// extraction. With `--job`, runs exactly the named jobs instead,
    /// including `done` ones.
    Process {
        /// Case id to process.
        #[arg(long)]
        case: String,

        /// Specific job ids to run instead of the pending batch. Repeatable.
        #[arg(long = "job")]
        jobs: Vec<String>,
    },

    /// List ingest jobs for a case, newest first.
    ///
    /// Shows each job's status, size, linked document, and error text if
    /// the last run failed.
    Jobs {
        /// Case id to inspect.
        #[arg(long)]
        case: String,
    },

    /// Ask a question about a case.
    ///
    /// Answers are grounded in the case's documents and structured memory
    /// and always carry citations. Both the question and the answer are
    /// recorded on a chat thread; pass `--thread` to continue an existing
    /// one.
    Ask {
        /// Case id to ask about.
        #[arg(long)]
        case: String,

        /// Existing thread id to append to. Omit to start a new thread.
        #[arg(long)]
        thread: Option<String>,

        /// The question.
        question: String,
    },

    /// Maintain structured case memory.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// case, ingest, and ask endpoints.
    Serve,
}

/// Case management subcommands.
#[derive(Subcommand)]
enum CaseAction {
    /// Create a new case.
    New {
        /// Human-readable case name, e.g. "Smith v. Smith".
        name: String,
    },

    /// List cases with document and chunk counts.
    List,
}

/// Case-memory subcommands.
#[derive(Subcommand)]
enum MemoryAction {
    /// Re-extract entities, facts, timeline events, and obligations.
    ///
    /// Replaces the case's memory rows from its indexed chunks. With
    /// `--document`, rebuilds memory for just the named documents. One
    /// rebuild runs per case at a time; a second invocation reports the
    /// held lock and exits.
    Rebuild {
        /// Case id to rebuild.
        #[arg(long)]
        case: String,

        /// Restrict the rebuild to these document ids. Repeatable.
        #[arg(long = "document")]
        documents: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Case { action } => match action {
            CaseAction::New { name } => run_case_new(cfg, &name).await?,
            CaseAction::List => run_case_list(cfg).await?,
        },
        Commands::Add { case, paths } => run_add(cfg, &case, &paths).await?,
        Commands::Process { case, jobs } => run_process(cfg, &case, &jobs).await?,
        Commands::Jobs { case } => run_jobs(cfg, &case).await?,
        Commands::Ask {
            case,
            thread,
            question,
        } => run_ask(cfg, &case, thread.as_deref(), &question).await?,
        Commands::Memory { action } => match action {
            MemoryAction::Rebuild { case, documents } => {
                run_memory_rebuild(cfg, &case, documents).await?
            }
        },
        Commands::Serve => {
            let app = App::connect(cfg).await?;
            server::run_server(app).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_case_new(cfg: Config, name: &str) -> anyhow::Result<()> {
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("case name is empty");
    }
    let app = App::connect(cfg).await?;
    let id = models::new_id();
    sqlx::query("INSERT INTO cases (id, name, created_at) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(name)
        .bind(models::now_ts())
        .execute(&app.pool)
        .await?;
    println!("Created case {}", id);
    Ok(())
}

async fn run_case_list(cfg: Config) -> anyhow::Result<()> {
    let app = App::connect(cfg).await?;
    let rows: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
        "SELECT c.id, c.name, c.created_at, \
         (SELECT COUNT(*) FROM documents d WHERE d.case_id = c.id) AS documents, \
         (SELECT COUNT(*) FROM chunks ch WHERE ch.case_id = c.id) AS chunks \
         FROM cases c ORDER BY c.created_at DESC, c.id ASC",
    )
    .fetch_all(&app.pool)
    .await?;

    if rows.is_empty() {
        println!("No cases.");
        return Ok(());
    }
    for (i, (id, name, created_at, documents, chunks)) in rows.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(*created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!("{}. {}", i + 1, name);
        println!("    id: {}", id);
        println!("    created: {}", date);
        println!("    documents: {}", documents);
        println!("    chunks: {}", chunks);
        println!();
    }
    Ok(())
}

async fn run_add(cfg: Config, case_id: &str, paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut files: Vec<PathBuf> = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            anyhow::bail!("no such file or directory: {}", path.display());
        }
    }
    if files.is_empty() {
        println!("Nothing to upload.");
        return Ok(());
    }

    let app = App::connect(cfg).await?;
    for path in &files {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin");
        let job = ingest::enqueue_upload(&app, case_id, filename, bytes).await?;
        println!("Queued {} ({})", job.filename, job.id);
    }
    println!("{} file(s) queued.", files.len());
    Ok(())
}

async fn run_process(cfg: Config, case_id: &str, job_ids: &[String]) -> anyhow::Result<()> {
    let app = App::connect(cfg).await?;
    let summary = if job_ids.is_empty() {
        ingest::process_case(&app, case_id).await?
    } else {
        ingest::process_jobs(&app, case_id, job_ids).await?
    };

    for outcome in &summary.outcomes {
        match &outcome.error {
            Some(err) if outcome.terminal => println!(
                "{}  {}: {} (retry will not help)",
                outcome.status.as_str(),
                outcome.filename,
                err
            ),
            Some(err) => println!(
                "{}  {}: {}",
                outcome.status.as_str(),
                outcome.filename,
                err
            ),
            None => println!("{}  {}", outcome.status.as_str(), outcome.filename),
        }
    }
    println!(
        "{} processed, {} succeeded, {} failed.",
        summary.processed, summary.succeeded, summary.failed
    );
    Ok(())
}

async fn run_jobs(cfg: Config, case_id: &str) -> anyhow::Result<()> {
    let app = App::connect(cfg).await?;
    let jobs = ingest::list_jobs(&app.pool, case_id).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for (i, job) in jobs.iter().enumerate() {
        println!("{}. {}", i + 1, job.filename);
        println!("    id: {}", job.id);
        println!("    status: {}", job.status);
        println!("    size: {} bytes", job.size_bytes);
        if let Some(ref document_id) = job.document_id {
            println!("    document: {}", document_id);
        }
        if let Some(ref err) = job.error {
            println!("    error: {}", err);
        }
        println!();
    }
    Ok(())
}

async fn run_ask(
    cfg: Config,
    case_id: &str,
    thread_id: Option<&str>,
    question: &str,
) -> anyhow::Result<()> {
    let app = App::connect(cfg).await?;
    let outcome = chat::ask(&app, case_id, thread_id, question).await?;
    print_answer(&outcome.answer);
    println!("thread: {}", outcome.thread_id);
    Ok(())
}

fn print_answer(answer: &StructuredAnswer) {
    println!("{}", answer.summary);
    println!();
    println!("{}", answer.direct_answer);
    println!();
    println!("confidence: {}", answer.confidence.as_str());
    if !answer.evidence.is_empty() {
        println!("evidence:");
        for item in &answer.evidence {
            println!("  - {}", item.claim);
            for citation in &item.citations {
                println!("      {}", cite_line(citation));
            }
        }
    }
    print_points("what helps", &answer.what_helps);
    print_points("what hurts", &answer.what_hurts);
    print_list("uncertainties", &answer.uncertainties);
    print_list("next steps", &answer.next_steps);
    print_list("questions for counsel", &answer.questions_for_counsel);
    print_list("missing documents", &answer.missing_documents);
    println!();
}

fn print_list(label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{}:", label);
    for item in items {
        println!("  - {}", item);
    }
}

fn print_points(label: &str, points: &[ArgumentPoint]) {
    if points.is_empty() {
        return;
    }
    println!("{}:", label);
    for point in points {
        println!("  - {}", point.point);
        for citation in &point.citations {
            println!("      {}", cite_line(citation));
        }
    }
}

/// One-line rendering of a citation, e.g.
/// `[document] Separation Agreement, p. 4 (document 1f3a...)`.
fn cite_line(source: &SourceRef) -> String {
    let locator = source.locator();
    let mut line = format!("[{}] {}", source.ref_type(), locator.label);
    if let Some(ref pages) = locator.pages {
        line.push_str(&format!(", p. {}", pages));
    }
    if let Some(ref section) = locator.section {
        line.push_str(&format!(", {}", section));
    }
    if let Some(id) = source.document_id() {
        line.push_str(&format!(" (document {})", id));
    }
    line
}

async fn run_memory_rebuild(
    cfg: Config,
    case_id: &str,
    documents: Vec<String>,
) -> anyhow::Result<()> {
    let app = App::connect(cfg).await?;
    let scope = if documents.is_empty() {
        None
    } else {
        Some(documents)
    };
    match memory::rebuild_case_memory(&app, case_id, scope).await {
        Ok(outcome) => {
            println!(
                "Memory rebuilt from {} document(s): {} entities, {} facts, {} timeline events, {} obligations.",
                outcome.documents_processed,
                outcome.entities,
                outcome.facts,
                outcome.timeline_events,
                outcome.obligations
            );
            if outcome.batches_dropped > 0 {
                println!(
                    "{} extraction batch(es) dropped; re-run to fill the gaps.",
                    outcome.batches_dropped
                );
            }
        }
        Err(PipelineError::RebuildInProgress) => {
            println!("A memory rebuild is already running for this case.");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
