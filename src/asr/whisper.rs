//! Whisper-API speech recognition.

use super::{SpeechToText, Transcript, TranscriptSegment};
use crate::audio::split_audio;
use crate::error::{HarkError, Result};
use crate::llm::create_client_with_timeout;
use async_openai::types::{AudioResponseFormat, CreateTranscriptionRequestArgs};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Whisper-backed transcriber. Long audio is split into segments which are
/// transcribed with bounded concurrency and merged back with adjusted
/// timestamps.
pub struct WhisperTranscriber {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    split_secs: u32,
    max_concurrent_segments: usize,
}

impl WhisperTranscriber {
    pub fn new(model: &str, split_secs: u32, max_concurrent_segments: usize, timeout_secs: u64) -> Self {
        Self {
            client: create_client_with_timeout(Duration::from_secs(timeout_secs)),
            model: model.to_string(),
            split_secs,
            max_concurrent_segments: max_concurrent_segments.max(1),
        }
    }

    /// Transcribe a single file without splitting.
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn transcribe_single(
        &self,
        path: &Path,
        language: Option<&str>,
    ) -> Result<(Vec<TranscriptSegment>, String)> {
        debug!("Transcribing audio file");

        let file_bytes = tokio::fs::read(path).await?;

        let mut request_builder = CreateTranscriptionRequestArgs::default();
        request_builder
            .file(async_openai::types::AudioInput::from_vec_u8(
                path.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("audio.mp3")
                    .to_string(),
                file_bytes,
            ))
            .model(&self.model)
            .response_format(AudioResponseFormat::VerboseJson);

        if let Some(lang) = language {
            request_builder.language(lang);
        }

        let request = request_builder
            .build()
            .map_err(|e| HarkError::Transcription(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .audio()
            .transcribe_verbose_json(request)
            .await
            .map_err(|e| HarkError::OpenAI(format!("Whisper API error: {}", e)))?;

        let detected = response.language.clone();

        let segments: Vec<TranscriptSegment> = response
            .segments
            .map(|segs| {
                segs.iter()
                    .map(|s| {
                        TranscriptSegment::new(
                            s.start as f64,
                            s.end as f64,
                            s.text.trim().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![TranscriptSegment::new(
                    0.0,
                    response.duration as f64,
                    response.text.trim().to_string(),
                )]
            });

        debug!("Transcribed {} segments", segments.len());
        Ok((segments, detected))
    }
}

#[async_trait]
impl SpeechToText for WhisperTranscriber {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn transcribe(&self, path: &Path, language: Option<&str>) -> Result<Transcript> {
        let temp_dir = tempfile::tempdir()?;
        let segments = split_audio(path, temp_dir.path(), self.split_secs).await?;

        if segments.len() == 1 {
            let (parsed, detected) = self.transcribe_single(path, language).await?;
            return Ok(Transcript::from_segments(
                language.map(|l| l.to_string()).unwrap_or(detected),
                parsed,
            ));
        }

        info!("Transcribing {} audio segments with {}", segments.len(), self.model);

        let results: Vec<(usize, f64, Result<(Vec<TranscriptSegment>, String)>)> =
            stream::iter(segments.into_iter().enumerate())
                .map(|(idx, (segment_path, offset))| {
                    let language = language.map(|s| s.to_string());
                    async move {
                        let result = self
                            .transcribe_single(&segment_path, language.as_deref())
                            .await;
                        (idx, offset, result)
                    }
                })
                .buffer_unordered(self.max_concurrent_segments)
                .collect()
                .await;

        drop(temp_dir);

        let mut sorted: Vec<_> = results.into_iter().collect();
        sorted.sort_by_key(|(idx, _, _)| *idx);

        let mut all_segments = Vec::new();
        let mut detected_language = language.map(|l| l.to_string());

        for (idx, offset, result) in sorted {
            match result {
                Ok((mut parsed, detected)) => {
                    if detected_language.is_none() && !detected.is_empty() {
                        detected_language = Some(detected);
                    }
                    for segment in &mut parsed {
                        segment.start += offset;
                        segment.end += offset;
                    }
                    all_segments.extend(parsed);
                }
                Err(e) => {
                    return Err(HarkError::Transcription(format!(
                        "Segment {} at {:.0}s failed: {}",
                        idx, offset, e
                    )));
                }
            }
        }

        Ok(Transcript::from_segments(
            detected_language.unwrap_or_else(|| "unknown".to_string()),
            all_segments,
        ))
    }
}
