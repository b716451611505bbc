//! Hark - audio ingestion and retrieval-augmented search
//!
//! Hark ingests audio-bearing media (YouTube URLs, local audio files),
//! turns the audio into searchable semantic chunks, and answers
//! natural-language questions against that corpus.
//!
//! # Architecture
//!
//! Ingestion is driven by a sensor-based scheduler: submissions are
//! persisted in a job store, periodic sensors detect work, and a control
//! loop dispatches claimed submissions through the pipeline stages
//! (download, transcribe, chunk, embed/index) on a bounded worker pool.
//! Queries run through a configurable retrieval stack (hybrid search,
//! re-ranking, query rewriting) before answer generation.
//!
//! Modules:
//!
//! - `config` - Settings and prompt templates
//! - `store` - Durable job store (submissions, jobs, queries, alerts)
//! - `artifacts` - Content-addressed artifact layout on disk
//! - `audio` - External media tool plumbing (yt-dlp, ffmpeg, ffprobe)
//! - `asr` - Speech-to-text seam
//! - `pipeline` - Stage workers
//! - `sensors` - Periodic work detection
//! - `scheduler` - The control loop
//! - `embedding` - Embedding generation
//! - `vector_store` - Vector database abstraction
//! - `llm` - Chat-completion seam
//! - `retrieval` - Query-time search and answer generation
//! - `eval` - Variant comparison harness
//! - `api` - HTTP surface
//! - `bot` - Chat-bot protocol surface
//! - `cli` - Command-line interface
//!
//! # Example
//!
//! ```rust,no_run
//! use hark::cli::commands::Runtime;
//! use hark::config::Settings;
//! use hark::retrieval::QueryRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::build(Settings::load()?)?;
//!
//!     let response = runtime
//!         .engine
//!         .query(QueryRequest {
//!             user_id: "demo".into(),
//!             question: "what was discussed about ownership?".into(),
//!             top_k: None,
//!             variant: None,
//!             system_prompt: None,
//!         })
//!         .await?;
//!     println!("{}", response.answer);
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod artifacts;
pub mod asr;
pub mod audio;
pub mod bot;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
pub mod scheduler;
pub mod sensors;
pub mod store;
pub mod vector_store;

pub use error::{HarkError, Result};
