//! SQLite-backed job store.
//!
//! A single `jobstore.db` file holds submissions, pipeline jobs, the
//! query/feedback log, alerts, user preferences, and the ingress-file
//! registry. All mutations go through one connection behind a mutex; WAL
//! mode keeps readers cheap.

use super::{
    Alert, ArtifactRefs, FeedbackRating, JobPayload, JobRequest, JobStatus, PipelineJob,
    Progress, Severity, SourceKind, Stage, StoreStats, Submission,
};
use crate::config::IngestionSettings;
use crate::error::{HarkError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Knobs the store needs from configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dedup_window_hours: u32,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub lease_secs: u64,
    pub high_water_mark: u32,
}

impl From<&IngestionSettings> for StoreConfig {
    fn from(s: &IngestionSettings) -> Self {
        Self {
            dedup_window_hours: s.dedup_window_hours,
            max_attempts: s.max_attempts,
            backoff_base_secs: s.backoff_base_secs,
            backoff_max_secs: s.backoff_max_secs,
            lease_secs: s.lease_secs,
            high_water_mark: s.high_water_mark,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::from(&IngestionSettings::default())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS submissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_kind TEXT NOT NULL,
    source TEXT NOT NULL,
    user_id TEXT NOT NULL,
    language_hint TEXT,
    use_fake_asr INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 5,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    archived INTEGER NOT NULL DEFAULT 0,
    claim_owner TEXT,
    claim_deadline TEXT,
    scheduled_at TEXT,
    audio_path TEXT,
    audio_bytes INTEGER,
    audio_duration REAL,
    audio_sample_rate INTEGER,
    language TEXT,
    transcript_path TEXT,
    chunk_count INTEGER,
    steps_done INTEGER NOT NULL DEFAULT 0,
    steps_total INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_submissions_stage_status ON submissions(stage, status);
CREATE INDEX IF NOT EXISTS idx_submissions_user ON submissions(user_id);

CREATE TABLE IF NOT EXISTS pipeline_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    dedup_key TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    scheduled_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pipeline_jobs_status ON pipeline_jobs(status);
CREATE INDEX IF NOT EXISTS idx_pipeline_jobs_dedup ON pipeline_jobs(dedup_key);

CREATE TABLE IF NOT EXISTS queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    query TEXT NOT NULL,
    top_k INTEGER NOT NULL,
    variant TEXT NOT NULL,
    rewritten INTEGER NOT NULL DEFAULT 0,
    answer TEXT NOT NULL,
    response_time_ms INTEGER NOT NULL,
    chunk_ids TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_id INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    rating TEXT NOT NULL,
    comment TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (query_id) REFERENCES queries (id)
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    severity TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    acknowledged_at TEXT,
    dispatched_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity);

CREATE TABLE IF NOT EXISTS user_prefs (
    user_id TEXT PRIMARY KEY,
    verbose INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ingress_files (
    path TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lease_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    submission_id INTEGER NOT NULL,
    expired_at TEXT NOT NULL
);
"#;

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl SqliteJobStore {
    /// Open (or create) the store at the given path.
    #[instrument(skip_all)]
    pub fn new(path: &Path, config: StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized job store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// In-memory store (useful for testing).
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| HarkError::JobStore(format!("Failed to acquire lock: {}", e)))
    }

    // === Submissions ===

    /// Register a new submission. Rejects duplicates of a non-terminal
    /// (user, source) pair within the dedup window, and everything once the
    /// backlog is at the high-water mark.
    #[instrument(skip(self))]
    pub fn insert_submission(
        &self,
        source_kind: SourceKind,
        source: &str,
        user_id: &str,
        language_hint: Option<&str>,
        use_fake_asr: bool,
        priority: i64,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let now = Utc::now();

        let pending: u32 = conn.query_row(
            "SELECT COUNT(*) FROM submissions WHERE stage NOT IN ('indexed','failed','cancelled')",
            [],
            |row| row.get(0),
        )?;
        if pending >= self.config.high_water_mark {
            return Err(HarkError::Backpressure);
        }

        let window_start =
            (now - ChronoDuration::hours(self.config.dedup_window_hours as i64)).to_rfc3339();
        let duplicate: u32 = conn.query_row(
            "SELECT COUNT(*) FROM submissions
             WHERE user_id = ?1 AND source = ?2
               AND stage NOT IN ('indexed','failed','cancelled')
               AND created_at >= ?3",
            params![user_id, source, window_start],
            |row| row.get(0),
        )?;
        if duplicate > 0 {
            return Err(HarkError::DuplicateSource(source.to_string()));
        }

        conn.execute(
            "INSERT INTO submissions
             (source_kind, source, user_id, language_hint, use_fake_asr, priority,
              stage, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 'pending', ?7, ?7)",
            params![
                source_kind.as_str(),
                source,
                user_id,
                language_hint,
                use_fake_asr as i64,
                priority,
                now.to_rfc3339(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        debug!("Registered submission {} for {}", id, source);
        Ok(id)
    }

    /// Fetch one submission.
    pub fn get(&self, id: i64) -> Result<Submission> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM submissions WHERE id = ?1",
            params![id],
            row_to_submission,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                HarkError::NotFound(format!("submission {}", id))
            }
            other => other.into(),
        })
    }

    /// Atomically claim one submission ready for the given running stage.
    ///
    /// Returns None when nothing is claimable. At most one worker holds a
    /// claim per submission; the claim deadline bounds worker hang-time.
    pub fn claim_submission(
        &self,
        worker_id: &str,
        running_stage: Stage,
    ) -> Result<Option<Submission>> {
        let (ready_stage, ready_status) = running_stage
            .ready_state()
            .ok_or_else(|| HarkError::JobStore(format!("{running_stage} is not claimable")))?;

        let mut conn = self.lock()?;
        let now = Utc::now();
        let tx = conn.transaction()?;

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM submissions
                 WHERE stage = ?1 AND status = ?2
                   AND cancel_requested = 0
                   AND (scheduled_at IS NULL OR scheduled_at <= ?3)
                 ORDER BY priority ASC, created_at ASC, id ASC
                 LIMIT 1",
                params![ready_stage.as_str(), ready_status.as_str(), now.to_rfc3339()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let deadline = now + ChronoDuration::seconds(self.config.lease_secs as i64);
        let changed = tx.execute(
            "UPDATE submissions
             SET stage = ?1, status = 'running', claim_owner = ?2, claim_deadline = ?3,
                 scheduled_at = NULL, steps_done = 0, steps_total = 0, updated_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                running_stage.as_str(),
                worker_id,
                deadline.to_rfc3339(),
                now.to_rfc3339(),
                id,
                ready_status.as_str(),
            ],
        )?;

        if changed == 0 {
            tx.commit()?;
            return Ok(None);
        }

        let submission = tx.query_row(
            "SELECT * FROM submissions WHERE id = ?1",
            params![id],
            row_to_submission,
        )?;
        tx.commit()?;

        debug!("Worker {} claimed submission {} for {}", worker_id, id, running_stage);
        Ok(Some(submission))
    }

    /// Advance a claimed submission to its next stage and release the claim.
    /// Succeeds only for the worker holding the active claim.
    pub fn complete(
        &self,
        id: i64,
        worker_id: &str,
        next_stage: Stage,
        artifacts: &ArtifactRefs,
        note: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let changed = conn.execute(
            "UPDATE submissions
             SET stage = ?1, status = 'done', claim_owner = NULL, claim_deadline = NULL,
                 attempts = 0, error = ?2,
                 audio_path = COALESCE(?3, audio_path),
                 audio_bytes = COALESCE(?4, audio_bytes),
                 audio_duration = COALESCE(?5, audio_duration),
                 audio_sample_rate = COALESCE(?6, audio_sample_rate),
                 language = COALESCE(?7, language),
                 transcript_path = COALESCE(?8, transcript_path),
                 chunk_count = COALESCE(?9, chunk_count),
                 updated_at = ?10
             WHERE id = ?11 AND claim_owner = ?12 AND status = 'running'",
            params![
                next_stage.as_str(),
                note,
                artifacts.audio_path,
                artifacts.audio_bytes.map(|b| b as i64),
                artifacts.audio_duration_secs,
                artifacts.audio_sample_rate.map(|r| r as i64),
                artifacts.language,
                artifacts.transcript_path,
                artifacts.chunk_count.map(|c| c as i64),
                now,
                id,
                worker_id,
            ],
        )?;

        if changed == 0 {
            return Err(HarkError::NotFound(format!(
                "submission {} has no active claim for worker {}",
                id, worker_id
            )));
        }
        Ok(())
    }

    /// Record a stage failure. Retriable errors return the submission to
    /// its previous ready state with exponential backoff until attempts run
    /// out; cancellation and non-retriable errors are terminal.
    pub fn fail(&self, id: i64, worker_id: &str, error: &HarkError) -> Result<Stage> {
        let conn = self.lock()?;
        let now = Utc::now();

        let (stage_str, attempts): (String, u32) = conn.query_row(
            "SELECT stage, attempts FROM submissions
             WHERE id = ?1 AND claim_owner = ?2 AND status = 'running'",
            params![id, worker_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => HarkError::NotFound(format!(
                "submission {} has no active claim for worker {}",
                id, worker_id
            )),
            other => other.into(),
        })?;

        let running_stage = Stage::parse(&stage_str)
            .ok_or_else(|| HarkError::JobStore(format!("unknown stage {stage_str}")))?;

        let message = format!("{}: {}", error.tag(), error);

        if matches!(error, HarkError::Cancelled) {
            conn.execute(
                "UPDATE submissions
                 SET stage = 'cancelled', status = 'done', claim_owner = NULL,
                     claim_deadline = NULL, error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![message, now.to_rfc3339(), id],
            )?;
            return Ok(Stage::Cancelled);
        }

        let next_attempts = attempts + 1;
        if error.is_retriable() && next_attempts < self.config.max_attempts {
            let (ready_stage, ready_status) = running_stage
                .ready_state()
                .ok_or_else(|| HarkError::JobStore(format!("{running_stage} is not a running stage")))?;

            let backoff = self
                .config
                .backoff_base_secs
                .saturating_mul(1u64 << attempts.min(16))
                .min(self.config.backoff_max_secs);
            let scheduled = now + ChronoDuration::seconds(backoff as i64);

            conn.execute(
                "UPDATE submissions
                 SET stage = ?1, status = ?2, claim_owner = NULL, claim_deadline = NULL,
                     attempts = ?3, error = ?4, scheduled_at = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    ready_stage.as_str(),
                    ready_status.as_str(),
                    next_attempts,
                    message,
                    scheduled.to_rfc3339(),
                    now.to_rfc3339(),
                    id,
                ],
            )?;
            warn!("Submission {} failed in {} (attempt {}), retrying in {}s",
                id, running_stage, next_attempts, backoff);
            Ok(ready_stage)
        } else {
            conn.execute(
                "UPDATE submissions
                 SET stage = 'failed', status = 'error', claim_owner = NULL,
                     claim_deadline = NULL, error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![message, now.to_rfc3339(), id],
            )?;
            warn!("Submission {} failed terminally in {}: {}", id, running_stage, message);
            Ok(Stage::Failed)
        }
    }

    /// Current progress for a submission.
    pub fn get_progress(&self, id: i64) -> Result<Progress> {
        let submission = self.get(id)?;
        let (steps_done, steps_total) = self.steps(id)?;
        Ok(Progress {
            stage: submission.stage,
            status: submission.status,
            percent: submission.stage.percent(),
            steps_done,
            steps_total,
            error: submission.error,
        })
    }

    fn steps(&self, id: i64) -> Result<(u32, u32)> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT steps_done, steps_total FROM submissions WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    /// Write a worker's intra-stage batch counter.
    pub fn set_stage_progress(&self, id: i64, done: u32, total: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE submissions SET steps_done = ?1, steps_total = ?2, updated_at = ?3
             WHERE id = ?4",
            params![done, total, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Submissions sitting in a stage, ordered by (priority, creation time).
    pub fn list_pending(&self, stage: Stage, limit: usize) -> Result<Vec<Submission>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM submissions WHERE stage = ?1
             ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![stage.as_str(), limit as i64], row_to_submission)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Return expired claims to their ready state for another attempt.
    /// Only this sweep, never a worker-side timeout, reclaims work.
    pub fn sweep_expired_claims(&self) -> Result<u32> {
        self.sweep_expired_claims_at(Utc::now())
    }

    pub fn sweep_expired_claims_at(&self, now: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, stage FROM submissions
             WHERE status = 'running' AND claim_deadline IS NOT NULL AND claim_deadline < ?1",
        )?;
        let expired: Vec<(i64, String)> = stmt
            .query_map(params![now.to_rfc3339()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut reclaimed = 0;
        for (id, stage_str) in expired {
            let Some(running) = Stage::parse(&stage_str) else {
                continue;
            };
            let Some((ready_stage, ready_status)) = running.ready_state() else {
                continue;
            };
            conn.execute(
                "UPDATE submissions
                 SET stage = ?1, status = ?2, claim_owner = NULL, claim_deadline = NULL,
                     updated_at = ?3
                 WHERE id = ?4 AND status = 'running'",
                params![
                    ready_stage.as_str(),
                    ready_status.as_str(),
                    now.to_rfc3339(),
                    id
                ],
            )?;
            conn.execute(
                "INSERT INTO lease_events (submission_id, expired_at) VALUES (?1, ?2)",
                params![id, now.to_rfc3339()],
            )?;
            warn!("Reclaimed expired lease on submission {} ({})", id, running);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Count of lease expirations since a point in time.
    pub fn lease_expirations_since(&self, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM lease_events WHERE expired_at >= ?1",
            params![since.to_rfc3339()],
            |row| row.get(0),
        )?)
    }

    /// Flag a submission for cooperative cancellation.
    pub fn request_cancel(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE submissions SET cancel_requested = 1, updated_at = ?1
             WHERE id = ?2 AND stage NOT IN ('indexed','failed','cancelled')",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(HarkError::NotFound(format!(
                "submission {} not found or already terminal",
                id
            )));
        }
        Ok(())
    }

    /// Transition cancel-flagged submissions that are not mid-stage to the
    /// terminal cancelled state. Returns how many were finalized.
    pub fn apply_cancellations(&self) -> Result<u32> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE submissions
             SET stage = 'cancelled', status = 'done', error = 'cancelled: by user',
                 claim_owner = NULL, claim_deadline = NULL, updated_at = ?1
             WHERE cancel_requested = 1 AND status != 'running'
               AND stage NOT IN ('indexed','failed','cancelled')",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(changed as u32)
    }

    /// Mark a terminal submission as archived (cleanup target).
    pub fn mark_archived(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE submissions SET archived = 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Ids of archived submissions.
    pub fn archived_submissions(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM submissions WHERE archived = 1")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Submission counts grouped by stage.
    pub fn counts_by_stage(&self) -> Result<Vec<(String, u32)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT stage, COUNT(*) FROM submissions GROUP BY stage")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count of submissions not yet in a terminal stage.
    pub fn non_terminal_count(&self) -> Result<u32> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM submissions WHERE stage NOT IN ('indexed','failed','cancelled')",
            [],
            |row| row.get(0),
        )?)
    }

    /// Failure rate over terminal outcomes updated within the window.
    /// None when there were no terminal outcomes.
    pub fn failure_rate(&self, since: DateTime<Utc>) -> Result<Option<f64>> {
        let conn = self.lock()?;
        let (failed, total): (u32, u32) = conn.query_row(
            "SELECT
                 SUM(CASE WHEN stage = 'failed' THEN 1 ELSE 0 END),
                 COUNT(*)
             FROM submissions
             WHERE stage IN ('failed','indexed') AND updated_at >= ?1",
            params![since.to_rfc3339()],
            |row| Ok((row.get::<_, Option<u32>>(0)?.unwrap_or(0), row.get(1)?)),
        )?;
        if total == 0 {
            return Ok(None);
        }
        Ok(Some(failed as f64 / total as f64))
    }

    // === Pipeline jobs ===

    /// Enqueue a pipeline job unless an open job with the same dedup key
    /// exists. Returns the new job id, or None when suppressed.
    pub fn enqueue_job(&self, request: &JobRequest) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(&request.payload)?;

        let inserted = conn.execute(
            "INSERT INTO pipeline_jobs (kind, payload, dedup_key, priority, status, created_at, updated_at)
             SELECT ?1, ?2, ?3, ?4, 'pending', ?5, ?5
             WHERE NOT EXISTS (
                 SELECT 1 FROM pipeline_jobs
                 WHERE dedup_key = ?3 AND status IN ('pending','running')
             )",
            params![request.payload.kind(), payload, request.dedup_key, request.priority, now],
        )?;

        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Pending jobs that are due, ordered by (priority, creation time).
    pub fn due_jobs(&self, limit: usize) -> Result<Vec<PipelineJob>> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, payload, priority, status, attempts, last_error, scheduled_at, created_at
             FROM pipeline_jobs
             WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?1)
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit as i64], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn start_job(&self, id: i64) -> Result<()> {
        self.set_job_status(id, JobStatus::Running, None)
    }

    pub fn finish_job(&self, id: i64) -> Result<()> {
        self.set_job_status(id, JobStatus::Done, None)
    }

    pub fn fail_job(&self, id: i64, error: &str) -> Result<()> {
        self.set_job_status(id, JobStatus::Error, Some(error))
    }

    fn set_job_status(&self, id: i64, status: JobStatus, error: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE pipeline_jobs
             SET status = ?1, attempts = attempts + (CASE WHEN ?1 = 'running' THEN 1 ELSE 0 END),
                 last_error = COALESCE(?2, last_error), updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), error, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    // === Queries and feedback ===

    /// Record a query event. Written before the response returns to the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn record_query(
        &self,
        user_id: &str,
        query: &str,
        top_k: u32,
        variant: &str,
        rewritten: bool,
        answer: &str,
        response_time_ms: u64,
        chunk_ids: &[String],
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO queries
             (user_id, query, top_k, variant, rewritten, answer, response_time_ms, chunk_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user_id,
                query,
                top_k,
                variant,
                rewritten as i64,
                answer,
                response_time_ms as i64,
                serde_json::to_string(chunk_ids)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record user feedback on a query event.
    pub fn record_feedback(
        &self,
        query_id: i64,
        user_id: &str,
        rating: FeedbackRating,
        comment: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO feedback (query_id, user_id, rating, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![query_id, user_id, rating.as_str(), comment, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Feedback counts grouped by rating.
    pub fn feedback_counts(&self) -> Result<Vec<(String, u32)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT rating, COUNT(*) FROM feedback GROUP BY rating")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Aggregate stats for /status and the dashboard.
    pub fn stats(&self) -> Result<StoreStats> {
        let by_stage = self.counts_by_stage()?;
        let pending_total = self.non_terminal_count()?;
        let feedback_counts = self.feedback_counts()?;

        let conn = self.lock()?;
        let (query_count, avg_response_time_ms): (u32, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(response_time_ms) FROM queries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(StoreStats {
            by_stage,
            pending_total,
            query_count,
            avg_response_time_ms,
            feedback_counts,
        })
    }

    // === Alerts ===

    /// Raise an alert. Suppressed while an unacknowledged alert of the same
    /// kind is open, so repeated sensor evaluations stay idempotent.
    pub fn raise_alert(&self, severity: Severity, kind: &str, message: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let open: u32 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE kind = ?1 AND acknowledged_at IS NULL",
            params![kind],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Ok(None);
        }
        conn.execute(
            "INSERT INTO alerts (severity, kind, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![severity.as_str(), kind, message, Utc::now().to_rfc3339()],
        )?;
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Alerts of at least the given severity that were never dispatched.
    pub fn undispatched_alerts(&self, min_severity: Severity) -> Result<Vec<Alert>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, severity, kind, message, acknowledged_at, dispatched_at, created_at
             FROM alerts WHERE dispatched_at IS NULL ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_alert)?;
        let alerts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts
            .into_iter()
            .filter(|a| a.severity >= min_severity)
            .collect())
    }

    pub fn mark_dispatched(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE alerts SET dispatched_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn acknowledge_alert(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE alerts SET acknowledged_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    // === User preferences ===

    pub fn set_verbose(&self, user_id: &str, verbose: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO user_prefs (user_id, verbose) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET verbose = ?2",
            params![user_id, verbose as i64],
        )?;
        Ok(())
    }

    pub fn is_verbose(&self, user_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let verbose: Option<i64> = conn
            .query_row(
                "SELECT verbose FROM user_prefs WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(verbose.unwrap_or(0) != 0)
    }

    // === Ingress registry ===

    /// Register a file discovered in the ingress directory. Returns false if
    /// it was already known.
    pub fn register_ingress_file(&self, path: &str) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO ingress_files (path, registered_at) VALUES (?1, ?2)",
            params![path, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }
}

fn row_to_submission(row: &Row<'_>) -> rusqlite::Result<Submission> {
    let parse_time = |value: Option<String>| {
        value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc)))
    };

    let stage_str: String = row.get("stage")?;
    let status_str: String = row.get("status")?;
    let kind_str: String = row.get("source_kind")?;

    Ok(Submission {
        id: row.get("id")?,
        source_kind: SourceKind::parse(&kind_str).unwrap_or(SourceKind::RemoteUrl),
        source: row.get("source")?,
        user_id: row.get("user_id")?,
        language_hint: row.get("language_hint")?,
        use_fake_asr: row.get::<_, i64>("use_fake_asr")? != 0,
        priority: row.get("priority")?,
        stage: Stage::parse(&stage_str).unwrap_or(Stage::Failed),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Error),
        attempts: row.get("attempts")?,
        error: row.get("error")?,
        cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
        archived: row.get::<_, i64>("archived")? != 0,
        claim_owner: row.get("claim_owner")?,
        claim_deadline: parse_time(row.get("claim_deadline")?),
        scheduled_at: parse_time(row.get("scheduled_at")?),
        artifacts: ArtifactRefs {
            audio_path: row.get("audio_path")?,
            audio_bytes: row.get::<_, Option<i64>>("audio_bytes")?.map(|b| b as u64),
            audio_duration_secs: row.get("audio_duration")?,
            audio_sample_rate: row
                .get::<_, Option<i64>>("audio_sample_rate")?
                .map(|r| r as u32),
            language: row.get("language")?,
            transcript_path: row.get("transcript_path")?,
            chunk_count: row.get::<_, Option<i64>>("chunk_count")?.map(|c| c as u32),
        },
        created_at: parse_time(row.get("created_at")?).unwrap_or_else(Utc::now),
        updated_at: parse_time(row.get("updated_at")?).unwrap_or_else(Utc::now),
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<PipelineJob> {
    let payload_str: String = row.get("payload")?;
    let status_str: String = row.get("status")?;
    let parse_time = |value: Option<String>| {
        value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc)))
    };

    Ok(PipelineJob {
        id: row.get("id")?,
        payload: serde_json::from_str(&payload_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        priority: row.get("priority")?,
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Error),
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
        scheduled_at: parse_time(row.get("scheduled_at")?),
        created_at: parse_time(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let severity_str: String = row.get("severity")?;
    let parse_time = |value: Option<String>| {
        value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc)))
    };

    Ok(Alert {
        id: row.get("id")?,
        severity: Severity::parse(&severity_str).unwrap_or(Severity::Info),
        kind: row.get("kind")?,
        message: row.get("message")?,
        acknowledged_at: parse_time(row.get("acknowledged_at")?),
        dispatched_at: parse_time(row.get("dispatched_at")?),
        created_at: parse_time(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteJobStore {
        SqliteJobStore::in_memory(StoreConfig::default()).unwrap()
    }

    fn submit(store: &SqliteJobStore, source: &str) -> i64 {
        store
            .insert_submission(SourceKind::RemoteUrl, source, "user-1", None, false, 5)
            .unwrap()
    }

    #[test]
    fn test_insert_assigns_monotonic_ids() {
        let store = store();
        let a = submit(&store, "https://example/a");
        let b = submit(&store, "https://example/b");
        assert!(b > a);

        let sub = store.get(a).unwrap();
        assert_eq!(sub.stage, Stage::Queued);
        assert_eq!(sub.status, JobStatus::Pending);
    }

    #[test]
    fn test_duplicate_source_within_window_rejected() {
        let store = store();
        submit(&store, "https://example/dup");
        let err = store
            .insert_submission(SourceKind::RemoteUrl, "https://example/dup", "user-1", None, false, 5)
            .unwrap_err();
        assert!(matches!(err, HarkError::DuplicateSource(_)));

        // A different user may submit the same source.
        store
            .insert_submission(SourceKind::RemoteUrl, "https://example/dup", "user-2", None, false, 5)
            .unwrap();
    }

    #[test]
    fn test_backpressure_at_high_water_mark() {
        let config = StoreConfig {
            high_water_mark: 2,
            ..StoreConfig::default()
        };
        let store = SqliteJobStore::in_memory(config).unwrap();
        submit(&store, "https://example/1");
        submit(&store, "https://example/2");

        let err = store
            .insert_submission(SourceKind::RemoteUrl, "https://example/3", "user-1", None, false, 5)
            .unwrap_err();
        assert!(matches!(err, HarkError::Backpressure));

        // Completing one frees a slot.
        let sub = store.claim_submission("w1", Stage::Downloading).unwrap().unwrap();
        store.fail(sub.id, "w1", &HarkError::InvalidInput("bad".into())).unwrap();
        submit(&store, "https://example/3");
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = store();
        let id = submit(&store, "https://example/a");

        let first = store.claim_submission("w1", Stage::Downloading).unwrap();
        assert_eq!(first.unwrap().id, id);

        // Nothing else claimable: the only submission is already running.
        let second = store.claim_submission("w2", Stage::Downloading).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_complete_requires_active_claim() {
        let store = store();
        let id = submit(&store, "https://example/a");
        store.claim_submission("w1", Stage::Downloading).unwrap().unwrap();

        let err = store
            .complete(id, "w2", Stage::Downloaded, &ArtifactRefs::default(), None)
            .unwrap_err();
        assert!(matches!(err, HarkError::NotFound(_)));

        store
            .complete(id, "w1", Stage::Downloaded, &ArtifactRefs::default(), None)
            .unwrap();
        let sub = store.get(id).unwrap();
        assert_eq!(sub.stage, Stage::Downloaded);
        assert_eq!(sub.status, JobStatus::Done);
        assert!(sub.claim_owner.is_none());
    }

    #[test]
    fn test_stage_order_through_store() {
        let store = store();
        let id = submit(&store, "https://example/a");

        for (running, done) in [
            (Stage::Downloading, Stage::Downloaded),
            (Stage::Transcribing, Stage::Transcribed),
            (Stage::Chunking, Stage::Chunked),
            (Stage::Embedding, Stage::Indexed),
        ] {
            let sub = store.claim_submission("w1", running).unwrap().unwrap();
            assert_eq!(sub.id, id);
            store
                .complete(id, "w1", done, &ArtifactRefs::default(), None)
                .unwrap();
        }
        assert_eq!(store.get(id).unwrap().stage, Stage::Indexed);
    }

    #[test]
    fn test_retriable_failure_backs_off_then_fails_terminally() {
        let store = store();
        let id = submit(&store, "https://example/a");

        // First failure: back to queued with backoff.
        store.claim_submission("w1", Stage::Downloading).unwrap().unwrap();
        let stage = store.fail(id, "w1", &HarkError::Network("timeout".into())).unwrap();
        assert_eq!(stage, Stage::Queued);
        let sub = store.get(id).unwrap();
        assert_eq!(sub.attempts, 1);
        assert!(sub.scheduled_at.is_some());

        // Backoff means it isn't immediately claimable.
        assert!(store.claim_submission("w1", Stage::Downloading).unwrap().is_none());
    }

    #[test]
    fn test_non_retriable_failure_is_terminal() {
        let store = store();
        let id = submit(&store, "https://example/a");
        store.claim_submission("w1", Stage::Downloading).unwrap().unwrap();
        let stage = store.fail(id, "w1", &HarkError::InvalidInput("404".into())).unwrap();
        assert_eq!(stage, Stage::Failed);
        let sub = store.get(id).unwrap();
        assert_eq!(sub.status, JobStatus::Error);
        assert!(sub.error.unwrap().contains("input-invalid"));
    }

    #[test]
    fn test_cancellation_is_terminal() {
        let store = store();
        let id = submit(&store, "https://example/a");
        store.request_cancel(id).unwrap();
        assert_eq!(store.apply_cancellations().unwrap(), 1);
        assert_eq!(store.get(id).unwrap().stage, Stage::Cancelled);

        // Cancelled is final: cancel again fails, claim skips it.
        assert!(store.request_cancel(id).is_err());
        assert!(store.claim_submission("w1", Stage::Downloading).unwrap().is_none());
    }

    #[test]
    fn test_sweep_reclaims_expired_leases() {
        let store = store();
        let id = submit(&store, "https://example/a");
        store.claim_submission("w1", Stage::Downloading).unwrap().unwrap();

        // Not expired yet.
        assert_eq!(store.sweep_expired_claims().unwrap(), 0);

        // Pretend the lease deadline passed.
        let future = Utc::now() + ChronoDuration::seconds(3600);
        assert_eq!(store.sweep_expired_claims_at(future).unwrap(), 1);

        let sub = store.get(id).unwrap();
        assert_eq!(sub.stage, Stage::Queued);
        assert_eq!(sub.status, JobStatus::Pending);
        assert!(sub.claim_owner.is_none());
        assert_eq!(store.lease_expirations_since(Utc::now() - ChronoDuration::hours(1)).unwrap(), 1);

        // Another worker can now complete it.
        let again = store.claim_submission("w2", Stage::Downloading).unwrap();
        assert_eq!(again.unwrap().id, id);
    }

    #[test]
    fn test_job_dedup_key_suppresses_reenqueue() {
        let store = store();
        let request = JobRequest {
            payload: JobPayload::ProcessSubmission { submission_id: 1 },
            priority: 5,
            dedup_key: "process-submission:1".to_string(),
        };
        let first = store.enqueue_job(&request).unwrap();
        assert!(first.is_some());
        let second = store.enqueue_job(&request).unwrap();
        assert!(second.is_none());

        // Once finished, the key may be reused.
        store.finish_job(first.unwrap()).unwrap();
        assert!(store.enqueue_job(&request).unwrap().is_some());
    }

    #[test]
    fn test_query_and_feedback_roundtrip() {
        let store = store();
        let query_id = store
            .record_query("user-1", "what is rust", 3, "hybrid", false, "a language", 42, &["abc".into()])
            .unwrap();
        store
            .record_feedback(query_id, "user-1", FeedbackRating::Negative, Some("wrong"))
            .unwrap();

        let counts = store.feedback_counts().unwrap();
        assert_eq!(counts, vec![("negative".to_string(), 1)]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.query_count, 1);
        assert_eq!(stats.avg_response_time_ms, Some(42.0));
    }

    #[test]
    fn test_alert_dedup_and_dispatch() {
        let store = store();
        let id = store.raise_alert(Severity::Warning, "backlog", "50 pending").unwrap();
        assert!(id.is_some());
        // Same kind while unacknowledged: suppressed.
        assert!(store.raise_alert(Severity::Warning, "backlog", "51 pending").unwrap().is_none());

        let alerts = store.undispatched_alerts(Severity::Warning).unwrap();
        assert_eq!(alerts.len(), 1);
        store.mark_dispatched(alerts[0].id).unwrap();
        assert!(store.undispatched_alerts(Severity::Warning).unwrap().is_empty());

        store.acknowledge_alert(alerts[0].id).unwrap();
        assert!(store.raise_alert(Severity::Warning, "backlog", "52 pending").unwrap().is_some());
    }

    #[test]
    fn test_verbose_flag_persists() {
        let store = store();
        assert!(!store.is_verbose("user-1").unwrap());
        store.set_verbose("user-1", true).unwrap();
        assert!(store.is_verbose("user-1").unwrap());
        store.set_verbose("user-1", false).unwrap();
        assert!(!store.is_verbose("user-1").unwrap());
    }

    #[test]
    fn test_ingress_registry() {
        let store = store();
        assert!(store.register_ingress_file("/data/ingress/a.mp3").unwrap());
        assert!(!store.register_ingress_file("/data/ingress/a.mp3").unwrap());
    }
}
