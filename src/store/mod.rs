//! Durable job store for submissions, pipeline jobs, queries, feedback, and alerts.
//!
//! All components coordinate through this store; it is the only shared
//! mutable resource in the system.

mod sqlite;

pub use sqlite::{SqliteJobStore, StoreConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a submission's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    RemoteUrl,
    LocalFile,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::RemoteUrl => "remote-url",
            SourceKind::LocalFile => "local-file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "remote-url" => Some(SourceKind::RemoteUrl),
            "local-file" => Some(SourceKind::LocalFile),
            _ => None,
        }
    }
}

/// Pipeline position of a submission. Ordered; transitions are monotonic
/// forward except the terminal `Failed`/`Cancelled`, reachable from any
/// non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Downloading,
    Downloaded,
    Transcribing,
    Transcribed,
    Chunking,
    Chunked,
    Embedding,
    Embedded,
    Indexed,
    Failed,
    Cancelled,
}

impl Stage {
    pub const ALL: [Stage; 12] = [
        Stage::Queued,
        Stage::Downloading,
        Stage::Downloaded,
        Stage::Transcribing,
        Stage::Transcribed,
        Stage::Chunking,
        Stage::Chunked,
        Stage::Embedding,
        Stage::Embedded,
        Stage::Indexed,
        Stage::Failed,
        Stage::Cancelled,
    ];

    /// The stages a worker can hold a claim in.
    pub const RUNNING: [Stage; 4] = [
        Stage::Downloading,
        Stage::Transcribing,
        Stage::Chunking,
        Stage::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Downloading => "downloading",
            Stage::Downloaded => "downloaded",
            Stage::Transcribing => "transcribing",
            Stage::Transcribed => "transcribed",
            Stage::Chunking => "chunking",
            Stage::Chunked => "chunked",
            Stage::Embedding => "embedding",
            Stage::Embedded => "embedded",
            Stage::Indexed => "indexed",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Stage::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Indexed | Stage::Failed | Stage::Cancelled)
    }

    /// Monotonic stage-to-percent mapping for user-facing progress.
    pub fn percent(&self) -> u8 {
        match self {
            Stage::Queued => 0,
            Stage::Downloading => 10,
            Stage::Downloaded => 20,
            Stage::Transcribing => 30,
            Stage::Transcribed => 45,
            Stage::Chunking => 55,
            Stage::Chunked => 65,
            Stage::Embedding => 75,
            Stage::Embedded => 90,
            Stage::Indexed | Stage::Failed | Stage::Cancelled => 100,
        }
    }

    /// The (stage, status) a submission must be in before a worker for this
    /// running stage may claim it.
    pub fn ready_state(&self) -> Option<(Stage, JobStatus)> {
        match self {
            Stage::Downloading => Some((Stage::Queued, JobStatus::Pending)),
            Stage::Transcribing => Some((Stage::Downloaded, JobStatus::Done)),
            Stage::Chunking => Some((Stage::Transcribed, JobStatus::Done)),
            Stage::Embedding => Some((Stage::Chunked, JobStatus::Done)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker state within the current stage, orthogonal to the stage itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }
}

/// A user's request to ingest one media source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub source_kind: SourceKind,
    pub source: String,
    pub user_id: String,
    pub language_hint: Option<String>,
    pub use_fake_asr: bool,
    pub priority: i64,
    pub stage: Stage,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub archived: bool,
    pub claim_owner: Option<String>,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub artifacts: ArtifactRefs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// References to the artifacts a submission has produced so far.
///
/// Submissions reference artifact paths as plain strings; artifacts carry
/// no back-pointer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactRefs {
    pub audio_path: Option<String>,
    pub audio_bytes: Option<u64>,
    pub audio_duration_secs: Option<f64>,
    pub audio_sample_rate: Option<u32>,
    pub language: Option<String>,
    pub transcript_path: Option<String>,
    pub chunk_count: Option<u32>,
}

/// User-facing progress for a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    pub status: JobStatus,
    pub percent: u8,
    /// Intra-stage counter written by workers with batch progress.
    pub steps_done: u32,
    pub steps_total: u32,
    pub error: Option<String>,
}

/// Scheduler-internal work item, kept separate from user-facing submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: i64,
    pub payload: JobPayload,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Tagged payload, one schema per job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    ProcessSubmission {
        submission_id: i64,
    },
    HealthCheck {
        evaluation_time: DateTime<Utc>,
    },
    Cleanup {
        evaluation_time: DateTime<Utc>,
    },
    AlertDispatch {
        alert_ids: Vec<i64>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::ProcessSubmission { .. } => "process-submission",
            JobPayload::HealthCheck { .. } => "health-check",
            JobPayload::Cleanup { .. } => "cleanup",
            JobPayload::AlertDispatch { .. } => "alert-dispatch",
        }
    }
}

/// A sensor's request to enqueue a pipeline job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub payload: JobPayload,
    pub priority: i64,
    /// Suppresses re-enqueueing while an identical job is still open.
    pub dedup_key: String,
}

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// A raised system alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one answered (or attempted) query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEvent {
    pub id: i64,
    pub user_id: String,
    pub query: String,
    pub top_k: u32,
    pub variant: String,
    pub rewritten: bool,
    pub answer: String,
    pub response_time_ms: u64,
    pub chunk_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// User feedback on a query event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackRating {
    Positive,
    Negative,
    DetailRequested,
}

impl FeedbackRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackRating::Positive => "positive",
            FeedbackRating::Negative => "negative",
            FeedbackRating::DetailRequested => "detail-requested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(FeedbackRating::Positive),
            "negative" => Some(FeedbackRating::Negative),
            "detail-requested" => Some(FeedbackRating::DetailRequested),
            _ => None,
        }
    }
}

/// Per-stage submission counts plus store-level stats, for /status and the
/// dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub by_stage: Vec<(String, u32)>,
    pub pending_total: u32,
    pub query_count: u32,
    pub avg_response_time_ms: Option<f64>,
    pub feedback_counts: Vec<(String, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_percent_is_monotonic() {
        let order = [
            Stage::Queued,
            Stage::Downloading,
            Stage::Downloaded,
            Stage::Transcribing,
            Stage::Transcribed,
            Stage::Chunking,
            Stage::Chunked,
            Stage::Embedding,
            Stage::Embedded,
            Stage::Indexed,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].percent() < pair[1].percent(), "{:?}", pair);
        }
    }

    #[test]
    fn test_ready_state_covers_all_running_stages() {
        for stage in Stage::RUNNING {
            assert!(stage.ready_state().is_some(), "{stage}");
        }
        assert!(Stage::Indexed.ready_state().is_none());
    }

    #[test]
    fn test_stage_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn test_job_payload_tagging() {
        let payload = JobPayload::ProcessSubmission { submission_id: 7 };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"process-submission\""));
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "process-submission");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }
}
