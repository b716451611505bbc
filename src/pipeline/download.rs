//! Download stage worker.
//!
//! Fetches remote sources via the media downloader and copies local files
//! into the artifact layout, then probes audio properties.

use super::{StageOutcome, StageWorker, WorkerContext};
use crate::audio::{fetch_remote_audio, probe_audio, transcode_to_mp3};
use crate::error::{HarkError, Result};
use crate::store::{ArtifactRefs, SourceKind, Stage, Submission};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Stage worker materializing a submission's audio artifact.
pub struct DownloadWorker;

impl DownloadWorker {
    async fn fetch_remote(&self, submission: &Submission, ctx: &WorkerContext) -> Result<PathBuf> {
        let url = submission.source.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(HarkError::InvalidInput(format!("not a URL: {url}")));
        }

        let title = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("audio");
        let target = ctx.artifacts.audio_path(submission.id, title, "mp3");

        fetch_remote_audio(url, &target).await
    }

    async fn import_local(&self, submission: &Submission, ctx: &WorkerContext) -> Result<PathBuf> {
        let source = Path::new(&submission.source);
        if !source.exists() {
            return Err(HarkError::InvalidInput(format!(
                "local file does not exist: {}",
                submission.source
            )));
        }

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        let ext = source
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("mp3")
            .to_ascii_lowercase();

        let target = ctx.artifacts.audio_path(submission.id, stem, "mp3");
        std::fs::create_dir_all(ctx.artifacts.audio_dir(submission.id))?;

        if ext == "mp3" {
            std::fs::copy(source, &target)?;
        } else {
            transcode_to_mp3(source, &target).await?;
        }
        Ok(target)
    }
}

#[async_trait]
impl StageWorker for DownloadWorker {
    fn stage(&self) -> Stage {
        Stage::Downloading
    }

    #[instrument(skip_all, fields(submission_id = submission.id, source = %submission.source))]
    async fn run(&self, submission: &Submission, ctx: &WorkerContext) -> Result<StageOutcome> {
        let audio_path = match submission.source_kind {
            SourceKind::RemoteUrl => self.fetch_remote(submission, ctx).await?,
            SourceKind::LocalFile => self.import_local(submission, ctx).await?,
        };

        let probe = probe_audio(&audio_path).await?;
        let bytes = std::fs::metadata(&audio_path)?.len();

        info!(
            "Audio ready: {:.1}s, {} bytes at {:?}",
            probe.duration_secs, bytes, audio_path
        );

        Ok(StageOutcome {
            next_stage: Stage::Downloaded,
            artifacts: ArtifactRefs {
                audio_path: Some(audio_path.to_string_lossy().into_owned()),
                audio_bytes: Some(bytes),
                audio_duration_secs: Some(probe.duration_secs),
                audio_sample_rate: probe.sample_rate,
                ..ArtifactRefs::default()
            },
            note: None,
        })
    }
}
