//! Embedding and indexing stage worker (fused).
//!
//! Embeds chunk batches, upserts them into the vector store under their
//! deterministic ids, then verifies every chunk is present before
//! advancing the submission to `indexed`. On retry after a partial
//! failure only the missing ids are re-embedded.

use super::{ChunkEntry, StageOutcome, StageWorker, WorkerContext};
use crate::artifacts::ArtifactKind;
use crate::error::{HarkError, Result};
use crate::store::{ArtifactRefs, Stage, Submission};
use crate::vector_store::ChunkRecord;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// Stage worker writing chunk embeddings to the vector store.
pub struct EmbedWorker;

#[async_trait]
impl StageWorker for EmbedWorker {
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    #[instrument(skip_all, fields(submission_id = submission.id))]
    async fn run(&self, submission: &Submission, ctx: &WorkerContext) -> Result<StageOutcome> {
        let entries: Vec<ChunkEntry> = ctx
            .artifacts
            .get_json(ArtifactKind::Chunks, submission.id)
            .map_err(|e| match e {
                HarkError::NotFound(_) | HarkError::Json(_) => HarkError::CorruptArtifact {
                    stage: Stage::Chunking.to_string(),
                    message: "chunk file missing or unreadable".into(),
                },
                other => other,
            })?;

        if entries.is_empty() {
            info!("No chunks to index; submission completes empty");
            return Ok(StageOutcome {
                next_stage: Stage::Indexed,
                artifacts: ArtifactRefs {
                    chunk_count: Some(0),
                    ..ArtifactRefs::default()
                },
                note: Some("no-content: transcript produced no chunks".to_string()),
            });
        }

        let all_ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();

        // Skip chunks already present from an earlier partial run.
        let present: HashSet<String> = ctx
            .vectors
            .get_by_ids(&all_ids)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let missing: Vec<&ChunkEntry> =
            entries.iter().filter(|e| !present.contains(&e.id)).collect();

        let total = entries.len() as u32;
        let mut done = (entries.len() - missing.len()) as u32;
        ctx.store.set_stage_progress(submission.id, done, total)?;

        let batch_size = ctx.settings.embedding.batch_size.max(1);
        for batch in missing.chunks(batch_size) {
            // Cooperative cancellation checkpoint between batches.
            if ctx.store.get(submission.id)?.cancel_requested {
                return Err(HarkError::Cancelled);
            }

            let texts: Vec<String> = batch.iter().map(|e| e.text.clone()).collect();
            let embeddings = ctx.embedder.embed_batch(&texts).await?;

            if embeddings.len() != batch.len() {
                return Err(HarkError::Model(format!(
                    "embedding count mismatch: {} texts, {} vectors",
                    batch.len(),
                    embeddings.len()
                )));
            }

            let records: Vec<ChunkRecord> = batch
                .iter()
                .zip(embeddings)
                .map(|(entry, embedding)| ChunkRecord {
                    id: entry.id.clone(),
                    submission_id: submission.id,
                    ordinal: entry.ordinal,
                    text: entry.text.clone(),
                    embedding,
                    indexed_at: Utc::now(),
                })
                .collect();

            ctx.vectors.upsert_batch(&records).await?;
            done += records.len() as u32;
            ctx.store.set_stage_progress(submission.id, done, total)?;
            debug!("Indexed {}/{} chunks", done, total);
        }

        // Index verification: every chunk id must be present before the
        // submission may advance to indexed.
        let verified = ctx.vectors.get_by_ids(&all_ids).await?.len();
        if verified != entries.len() {
            // Retriable: the next attempt re-embeds only the missing ids.
            return Err(HarkError::Resource(format!(
                "verification found {}/{} chunks in the store",
                verified,
                entries.len()
            )));
        }

        info!("Indexed {} chunks for submission {}", verified, submission.id);

        Ok(StageOutcome {
            next_stage: Stage::Indexed,
            artifacts: ArtifactRefs {
                chunk_count: Some(total),
                ..ArtifactRefs::default()
            },
            note: None,
        })
    }
}
