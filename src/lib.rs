//! # Docket
//!
//! Case-file ingestion and citation-grounded question answering for legal
//! matters.
//!
//! Docket provides an upload-to-answer pipeline for legal case files:
//! documents are stored in a byte store, text is extracted per format and
//! chunked into SQLite, structured case memory (entities, facts, timeline,
//! obligations) is distilled from the chunks, and questions are answered
//! with citation-grounded structured output via a CLI and HTTP server.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌───────────┐
//! │  Uploads   │──▶│   Pipeline    │──▶│  SQLite   │
//! │ pdf/docx/  │   │ extract+chunk │   │ chunks +  │
//! │ email/zip  │   │ +case memory  │   │  memory   │
//! └────────────┘   └───────────────┘   └────┬──────┘
//!                                           │
//!                       ┌───────────────────┤
//!                       ▼                   ▼
//!                  ┌──────────┐       ┌──────────┐
//!                  │   CLI    │       │   HTTP   │
//!                  │ (docket) │       │  (axum)  │
//!                  └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docket init                          # create database
//! docket case new "Smith v. Smith"     # create a case
//! docket add --case <id> ./records     # upload files
//! docket process --case <id>           # extract, chunk, index
//! docket ask --case <id> "When do holiday exchanges happen?"
//! docket serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`models`] | Core data types and citation shapes |
//! | [`ingest`] | Upload intake and the job state machine |
//! | [`extract`] | Per-format text extraction |
//! | [`chunker`] | Page-aware text chunking |
//! | [`memory`] | Structured case-memory extraction |
//! | [`retrieval`] | Lexical and vector chunk retrieval |
//! | [`answer`] | Citation-grounded answer synthesis |
//! | [`chat`] | Thread persistence around answers |
//! | [`server`] | HTTP API server |
//! | [`db`] | SQLite pool and storage-mode probe |
//! | [`migrate`] | Idempotent schema setup |

pub mod answer;
pub mod app;
pub mod blob;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod indexer;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod retrieval;
pub mod server;
