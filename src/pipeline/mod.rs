//! Pipeline stage workers.
//!
//! Each worker executes exactly one stage for a claimed submission and
//! reports an outcome; the scheduler records it. Workers are stateless
//! across invocations and never raise across the scheduler boundary —
//! errors carry a taxonomy tag the scheduler passes to `fail`.

mod chunk;
mod download;
mod embed;
mod transcribe;

pub use chunk::{chunk_id, chunk_transcript, normalize_text, ChunkEntry, ChunkWorker};
pub use download::DownloadWorker;
pub use embed::EmbedWorker;
pub use transcribe::TranscribeWorker;

use crate::artifacts::ArtifactStore;
use crate::asr::SpeechToText;
use crate::config::Settings;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::store::{ArtifactRefs, SqliteJobStore, Stage, Submission};
use crate::vector_store::VectorStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a stage worker needs, shared by reference.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<SqliteJobStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub asr: Arc<dyn SpeechToText>,
    pub fake_asr: Arc<dyn SpeechToText>,
    pub embedder: Arc<dyn Embedder>,
    pub settings: Arc<Settings>,
}

/// What a successfully finished stage hands back to the scheduler.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Stage the submission advances to.
    pub next_stage: Stage,
    /// Artifact references produced (merged into the submission record).
    pub artifacts: ArtifactRefs,
    /// Optional warning note kept on the submission (e.g. `no-content`).
    pub note: Option<String>,
}

impl StageOutcome {
    pub fn advance(next_stage: Stage) -> Self {
        Self {
            next_stage,
            artifacts: ArtifactRefs::default(),
            note: None,
        }
    }
}

/// A stateless executor for one pipeline stage.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// The running stage this worker owns claims for.
    fn stage(&self) -> Stage;

    /// Produce the next-stage artifact for a claimed submission.
    async fn run(&self, submission: &Submission, ctx: &WorkerContext) -> Result<StageOutcome>;
}

/// The standard worker set, in stage order.
pub fn standard_workers() -> Vec<Arc<dyn StageWorker>> {
    vec![
        Arc::new(DownloadWorker),
        Arc::new(TranscribeWorker),
        Arc::new(ChunkWorker),
        Arc::new(EmbedWorker),
    ]
}
