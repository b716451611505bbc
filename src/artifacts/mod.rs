//! Filesystem artifact store.
//!
//! Plain directory layout rooted at the data root:
//!
//! ```text
//! audio/<submission-id>/<sanitized-title>.<ext>
//! transcripts/<submission-id>.json
//! chunks/<submission-id>.json
//! ```
//!
//! Writes go to a temp file in the destination directory followed by an
//! atomic rename, so readers never observe a partially written file.

use crate::error::{HarkError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Artifact kinds with a fixed place in the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Audio,
    Transcript,
    Chunks,
}

impl ArtifactKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Audio => "audio",
            ArtifactKind::Transcript => "transcripts",
            ArtifactKind::Chunks => "chunks",
        }
    }
}

/// Filesystem store partitioned by submission id; no two workers ever write
/// the same file.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create the store, ensuring the directory layout exists.
    pub fn new(root: &Path) -> Result<Self> {
        for dir in ["audio", "transcripts", "chunks", "vectorstore", "logs", "ingress"] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a submission's audio files.
    pub fn audio_dir(&self, submission_id: i64) -> PathBuf {
        self.root
            .join(ArtifactKind::Audio.dir_name())
            .join(submission_id.to_string())
    }

    /// Path for a submission's audio file, derived from user-supplied
    /// metadata via `sanitize_title`.
    pub fn audio_path(&self, submission_id: i64, title: &str, ext: &str) -> PathBuf {
        self.audio_dir(submission_id)
            .join(format!("{}.{}", sanitize_title(title), ext))
    }

    fn json_path(&self, kind: ArtifactKind, submission_id: i64) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join(format!("{}.json", submission_id))
    }

    pub fn transcript_path(&self, submission_id: i64) -> PathBuf {
        self.json_path(ArtifactKind::Transcript, submission_id)
    }

    pub fn chunks_path(&self, submission_id: i64) -> PathBuf {
        self.json_path(ArtifactKind::Chunks, submission_id)
    }

    /// Write bytes atomically: temp file in the destination directory, then
    /// rename over the target.
    #[instrument(skip(self, bytes))]
    pub fn put(&self, kind: ArtifactKind, submission_id: i64, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.json_path(kind, submission_id);
        write_atomic(&path, bytes)?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), path);
        Ok(path)
    }

    /// Serialize a value to JSON and write it atomically.
    pub fn put_json<T: Serialize>(
        &self,
        kind: ArtifactKind,
        submission_id: i64,
        value: &T,
    ) -> Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put(kind, submission_id, &bytes)
    }

    /// Read raw artifact bytes.
    pub fn get(&self, kind: ArtifactKind, submission_id: i64) -> Result<Vec<u8>> {
        let path = self.json_path(kind, submission_id);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HarkError::NotFound(format!("{} artifact for submission {}", kind.dir_name(), submission_id))
            } else {
                e.into()
            }
        })
    }

    /// Read and deserialize a JSON artifact.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        submission_id: i64,
    ) -> Result<T> {
        let bytes = self.get(kind, submission_id)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Remove all artifacts for a submission. Used by cleanup jobs.
    pub fn delete(&self, submission_id: i64) -> Result<()> {
        let audio_dir = self.audio_dir(submission_id);
        if audio_dir.exists() {
            std::fs::remove_dir_all(&audio_dir)?;
        }
        for kind in [ArtifactKind::Transcript, ArtifactKind::Chunks] {
            let path = self.json_path(kind, submission_id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Aggregate bytes used by one artifact kind.
    pub fn size(&self, kind: ArtifactKind) -> Result<u64> {
        dir_size(&self.root.join(kind.dir_name()))
    }

    /// Total bytes across all artifact kinds.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for kind in [ArtifactKind::Audio, ArtifactKind::Transcript, ArtifactKind::Chunks] {
            total += self.size(kind)?;
        }
        Ok(total)
    }
}

/// Atomic write: temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| HarkError::InvalidInput(format!("no parent directory for {:?}", path)))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(path)
        .map_err(|e| HarkError::Io(e.error))?;
    Ok(())
}

/// Sanitize a user-supplied title for use as a filename: strip path
/// separators, control and non-printable characters, truncate to 200 bytes
/// on a char boundary.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !c.is_control() && *c != '\0')
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim();
    let base = if trimmed.is_empty() { "untitled" } else { trimmed };

    let mut out = String::new();
    for c in base.chars() {
        if out.len() + c.len_utf8() > 200 {
            break;
        }
        out.push(c);
    }
    out
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
