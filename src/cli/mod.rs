//! CLI module for Hark.

pub mod commands;
mod output;

pub use output::Output;

use clap::{Parser, Subcommand};

/// Hark - ingest spoken audio, search it, ask questions about it.
#[derive(Parser, Debug)]
#[command(name = "hark")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit media URLs and process them to completion
    Process {
        /// Media URLs or local file paths
        urls: Vec<String>,

        /// Use the deterministic fake transcriber instead of the ASR endpoint
        #[arg(long)]
        fake_asr: bool,

        /// Language hint passed to the transcriber
        #[arg(long)]
        language: Option<String>,
    },

    /// Ask a question against the indexed corpus
    Query {
        /// The question to ask
        text: String,

        /// Number of context chunks to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Retrieval variant (semantic, hybrid, hybrid+rerank, rewrite+hybrid+rerank)
        #[arg(long)]
        variant: Option<String>,
    },

    /// Show pipeline and corpus status
    Status,

    /// Compare retrieval variants over a curated case file
    Evaluate {
        /// JSON file of evaluation cases
        #[arg(long)]
        cases: String,

        /// Comma-separated variants to compare (default: all)
        #[arg(long)]
        variants: Option<String>,

        /// Cutoff for hit-rate@k
        #[arg(short = 'k', long, default_value = "3")]
        k: usize,

        /// Write the full JSON report to this path
        #[arg(long)]
        output: Option<String>,
    },

    /// Enqueue media URLs without waiting for processing
    IngestJob {
        /// Media URLs or local file paths
        urls: Vec<String>,
    },

    /// Run the ingestion scheduler
    RunIngestion {
        /// Drain everything pending, then exit
        #[arg(long)]
        all: bool,

        /// Keep running until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Show an analytics snapshot (queries, feedback, alerts)
    Dashboard,

    /// Start the HTTP API together with the scheduler
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8800")]
        port: u16,
    },
}
