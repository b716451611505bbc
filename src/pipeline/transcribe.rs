//! Transcription stage worker.

use super::{StageOutcome, StageWorker, WorkerContext};
use crate::artifacts::ArtifactKind;
use crate::error::{HarkError, Result};
use crate::store::{ArtifactRefs, Stage, Submission};
use async_trait::async_trait;
use std::path::Path;
use tracing::{info, instrument};

/// Stage worker producing the transcript artifact from claimed audio.
pub struct TranscribeWorker;

#[async_trait]
impl StageWorker for TranscribeWorker {
    fn stage(&self) -> Stage {
        Stage::Transcribing
    }

    #[instrument(skip_all, fields(submission_id = submission.id))]
    async fn run(&self, submission: &Submission, ctx: &WorkerContext) -> Result<StageOutcome> {
        let audio_path = submission
            .artifacts
            .audio_path
            .as_deref()
            .ok_or_else(|| HarkError::CorruptArtifact {
                stage: Stage::Downloading.to_string(),
                message: "no audio path on submission".into(),
            })?;

        let audio = Path::new(audio_path);
        if !audio.exists() {
            return Err(HarkError::CorruptArtifact {
                stage: Stage::Downloading.to_string(),
                message: format!("audio file missing: {audio_path}"),
            });
        }

        let language_hint = submission
            .language_hint
            .as_deref()
            .or(ctx.settings.asr.language.as_deref());

        let engine = if submission.use_fake_asr || ctx.settings.asr.use_fake {
            &ctx.fake_asr
        } else {
            &ctx.asr
        };

        let transcript = engine.transcribe(audio, language_hint).await?;

        let path = ctx
            .artifacts
            .put_json(ArtifactKind::Transcript, submission.id, &transcript)?;

        info!(
            "Transcribed {} segments ({} chars) into {:?}",
            transcript.segments.len(),
            transcript.full_text.len(),
            path
        );

        Ok(StageOutcome {
            next_stage: Stage::Transcribed,
            artifacts: ArtifactRefs {
                transcript_path: Some(path.to_string_lossy().into_owned()),
                language: Some(transcript.language.clone()),
                ..ArtifactRefs::default()
            },
            note: None,
        })
    }
}
