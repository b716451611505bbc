//! Deterministic fake transcriber.
//!
//! Used when `use_fake_asr` is set on a submission (or in settings) and in
//! tests. Produces the same transcript for the same input file.

use super::{SpeechToText, Transcript, TranscriptSegment};
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Transcriber that never touches a model endpoint.
pub struct FakeTranscriber {
    text: Option<String>,
    segment_secs: f64,
}

impl FakeTranscriber {
    pub fn new() -> Self {
        Self {
            text: None,
            segment_secs: 5.0,
        }
    }

    /// Always produce the given text, split into one segment per sentence.
    pub fn with_text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            segment_secs: 5.0,
        }
    }
}

impl Default for FakeTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechToText for FakeTranscriber {
    async fn transcribe(&self, path: &Path, language: Option<&str>) -> Result<Transcript> {
        let text = match &self.text {
            Some(t) => t.clone(),
            None => {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("audio");
                format!("synthetic transcript for {}", stem)
            }
        };

        let sentences: Vec<&str> = text
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let segments = if sentences.is_empty() {
            Vec::new()
        } else {
            sentences
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    TranscriptSegment::new(
                        i as f64 * self.segment_secs,
                        (i + 1) as f64 * self.segment_secs,
                        s.to_string(),
                    )
                })
                .collect()
        };

        Ok(Transcript::from_segments(
            language.unwrap_or("en").to_string(),
            segments,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_fake_is_deterministic() {
        let fake = FakeTranscriber::with_text("the quick brown fox");
        let path = PathBuf::from("/tmp/a.mp3");

        let a = fake.transcribe(&path, None).await.unwrap();
        let b = fake.transcribe(&path, None).await.unwrap();
        assert_eq!(a.full_text, b.full_text);
        assert_eq!(a.full_text, "the quick brown fox");
        assert_eq!(a.language, "en");
    }

    #[tokio::test]
    async fn test_empty_text_gives_empty_transcript() {
        let fake = FakeTranscriber::with_text("");
        let transcript = fake
            .transcribe(&PathBuf::from("/tmp/a.mp3"), None)
            .await
            .unwrap();
        assert!(transcript.is_empty());
        assert_eq!(transcript.duration, 0.0);
    }
}
