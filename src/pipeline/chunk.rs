//! Transcript chunking.
//!
//! Normalizes transcript text and splits it into overlapping character
//! windows. Chunk ids are derived from the submission id and ordinal, so
//! re-running the chunker on the same input yields identical ids.

use super::{StageOutcome, StageWorker, WorkerContext};
use crate::artifacts::ArtifactKind;
use crate::asr::Transcript;
use crate::config::ChunkingSettings;
use crate::error::{HarkError, Result};
use crate::store::{ArtifactRefs, Stage, Submission};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

/// One entry of the on-disk chunk file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub id: String,
    pub ordinal: u32,
    pub text: String,
    /// Inclusive range of transcript segment indices this window covers.
    pub segment_range: [usize; 2],
}

/// Deterministic chunk id from submission id and ordinal.
pub fn chunk_id(submission_id: i64, ordinal: u32) -> String {
    let digest = Sha256::digest(format!("{}:{}", submission_id, ordinal).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..32].to_string()
}

/// Collapse whitespace runs, trim, and capitalize the first letter.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) if !first.is_uppercase() => {
            first.to_uppercase().collect::<String>() + chars.as_str()
        }
        _ => collapsed,
    }
}

/// Split a transcript into overlapping character windows.
///
/// Each window is `chunk_chars` long and carries `overlap_chars` of context
/// on both sides, so consecutive window starts advance by
/// `chunk_chars - 2 * overlap_chars`.
pub fn chunk_transcript(
    transcript: &Transcript,
    submission_id: i64,
    config: &ChunkingSettings,
) -> Vec<ChunkEntry> {
    // Normalize per segment and track each segment's span in the joined text
    // so windows can be mapped back to transcript segments.
    let mut joined = String::new();
    let mut segment_spans: Vec<(usize, usize)> = Vec::new();

    for segment in &transcript.segments {
        let normalized = normalize_text(&segment.text);
        if normalized.is_empty() {
            continue;
        }
        if !joined.is_empty() {
            joined.push(' ');
        }
        let start = joined.chars().count();
        joined.push_str(&normalized);
        segment_spans.push((start, joined.chars().count()));
    }

    if joined.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = joined.chars().collect();
    let size = config.chunk_chars.max(1);
    let stride = size.saturating_sub(2 * config.overlap_chars).max(1);

    let segment_for = |pos: usize| -> usize {
        segment_spans
            .iter()
            .position(|(start, end)| pos >= *start && pos < *end)
            .unwrap_or(segment_spans.len().saturating_sub(1))
    };

    let mut entries = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0u32;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let text: String = chars[start..end].iter().collect();

        entries.push(ChunkEntry {
            id: chunk_id(submission_id, ordinal),
            ordinal,
            text,
            segment_range: [segment_for(start), segment_for(end.saturating_sub(1))],
        });
        ordinal += 1;

        if end == chars.len() {
            break;
        }
        start += stride;
    }

    debug!(
        "Chunked submission {} into {} windows (size={}, overlap={})",
        submission_id,
        entries.len(),
        size,
        config.overlap_chars
    );
    entries
}

/// Stage worker turning a transcript into the chunk file.
pub struct ChunkWorker;

#[async_trait]
impl StageWorker for ChunkWorker {
    fn stage(&self) -> Stage {
        Stage::Chunking
    }

    #[instrument(skip_all, fields(submission_id = submission.id))]
    async fn run(&self, submission: &Submission, ctx: &WorkerContext) -> Result<StageOutcome> {
        let transcript: Transcript = ctx
            .artifacts
            .get_json(ArtifactKind::Transcript, submission.id)
            .map_err(|e| match e {
                HarkError::NotFound(_) | HarkError::Json(_) => HarkError::CorruptArtifact {
                    stage: Stage::Transcribing.to_string(),
                    message: "transcript file missing or unreadable".into(),
                },
                other => other,
            })?;

        let entries = chunk_transcript(&transcript, submission.id, &ctx.settings.chunking);
        let path = ctx
            .artifacts
            .put_json(ArtifactKind::Chunks, submission.id, &entries)?;
        debug!("Wrote {} chunks to {:?}", entries.len(), path);

        let note = if entries.is_empty() {
            Some("no-content: transcript produced no chunks".to_string())
        } else {
            None
        };

        Ok(StageOutcome {
            next_stage: Stage::Chunked,
            artifacts: ArtifactRefs {
                chunk_count: Some(entries.len() as u32),
                ..ArtifactRefs::default()
            },
            note,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::TranscriptSegment;

    fn transcript(text: &str) -> Transcript {
        Transcript::from_segments(
            "en".to_string(),
            vec![TranscriptSegment::new(0.0, 5.0, text.to_string())],
        )
    }

    fn config(chunk_chars: usize, overlap_chars: usize) -> ChunkingSettings {
        ChunkingSettings {
            chunk_chars,
            overlap_chars,
        }
    }

    #[test]
    fn test_known_window_sequence() {
        let entries = chunk_transcript(&transcript("the quick brown fox"), 1, &config(10, 2));
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["The quick ", "ick brown ", "own fox"]);
    }

    #[test]
    fn test_ordinals_are_contiguous_from_zero() {
        let entries = chunk_transcript(
            &transcript("a longer piece of text that will produce several windows"),
            7,
            &config(12, 2),
        );
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.ordinal as usize, i);
        }
        assert!(!entries.is_empty());
    }

    #[test]
    fn test_chunking_is_idempotent() {
        let t = transcript("same input should always give the same ids");
        let a = chunk_transcript(&t, 42, &config(16, 3));
        let b = chunk_transcript(&t, 42, &config(16, 3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_ids_depend_on_submission_and_ordinal() {
        assert_ne!(chunk_id(1, 0), chunk_id(1, 1));
        assert_ne!(chunk_id(1, 0), chunk_id(2, 0));
        assert_eq!(chunk_id(5, 3), chunk_id(5, 3));
    }

    #[test]
    fn test_empty_transcript_yields_zero_chunks() {
        let t = Transcript::from_segments("en".to_string(), vec![]);
        assert!(chunk_transcript(&t, 1, &config(300, 75)).is_empty());
    }

    #[test]
    fn test_normalize_collapses_whitespace_and_capitalizes() {
        assert_eq!(normalize_text("  hello   world \n"), "Hello world");
        assert_eq!(normalize_text("Already fine"), "Already fine");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn test_segment_range_maps_back_to_segments() {
        let t = Transcript::from_segments(
            "en".to_string(),
            vec![
                TranscriptSegment::new(0.0, 5.0, "first segment here".to_string()),
                TranscriptSegment::new(5.0, 10.0, "second segment text".to_string()),
            ],
        );
        let entries = chunk_transcript(&t, 1, &config(60, 5));
        // One big window covering both segments.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].segment_range, [0, 1]);
    }
}
