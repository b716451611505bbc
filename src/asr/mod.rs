//! Speech recognition seam.
//!
//! The pipeline targets the capability `transcribe(path, language?) →
//! Transcript` and assumes nothing else about the ASR engine.

mod fake;
mod whisper;

pub use fake::FakeTranscriber;
pub use whisper::WhisperTranscriber;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A complete transcript. The serialized form is the stable on-disk
/// transcript format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Detected (or hinted) language code.
    pub language: String,
    /// Total duration in seconds.
    pub duration: f64,
    /// Ordered segments with timestamps.
    pub segments: Vec<TranscriptSegment>,
    /// Concatenated segment text.
    pub full_text: String,
}

/// A single timestamped segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    /// Transcribed text.
    pub text: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: String) -> Self {
        Self { start, end, text }
    }
}

impl Transcript {
    /// Build a transcript from segments, dropping empty ones.
    pub fn from_segments(language: String, segments: Vec<TranscriptSegment>) -> Self {
        let segments: Vec<TranscriptSegment> = segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .collect();

        let full_text = segments
            .iter()
            .map(|s| s.text.trim())
            .collect::<Vec<_>>()
            .join(" ");

        let duration = segments.last().map(|s| s.end).unwrap_or(0.0);

        Self {
            language,
            duration,
            segments,
            full_text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Trait for speech-to-text engines.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe an audio file, optionally hinting the language.
    async fn transcribe(&self, path: &Path, language: Option<&str>) -> Result<Transcript>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_segments_drops_empty_and_joins_text() {
        let transcript = Transcript::from_segments(
            "en".to_string(),
            vec![
                TranscriptSegment::new(0.0, 2.0, "hello".to_string()),
                TranscriptSegment::new(2.0, 3.0, "   ".to_string()),
                TranscriptSegment::new(3.0, 5.0, "world".to_string()),
            ],
        );
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.full_text, "hello world");
        assert_eq!(transcript.duration, 5.0);
    }

    #[test]
    fn test_transcript_json_format_is_stable() {
        let transcript = Transcript::from_segments(
            "en".to_string(),
            vec![TranscriptSegment::new(0.0, 1.5, "hi".to_string())],
        );
        let json = serde_json::to_value(&transcript).unwrap();
        assert!(json.get("language").is_some());
        assert!(json.get("duration").is_some());
        assert!(json.get("full_text").is_some());
        let seg = &json["segments"][0];
        assert!(seg.get("start").is_some());
        assert!(seg.get("end").is_some());
        assert!(seg.get("text").is_some());
    }
}
