//! Periodic sensors.
//!
//! Each sensor detects one class of work by polling the job store and the
//! filesystem, and answers with pipeline job requests. Sensors have no
//! side effects outside the job store, and dedup keys make re-evaluation
//! against the same state idempotent. Sensors that depend on wall-clock
//! thresholds stamp their `evaluation_time` into the payload.

use crate::artifacts::ArtifactStore;
use crate::config::{AlertSettings, IngestionSettings};
use crate::error::Result;
use crate::store::{JobPayload, JobRequest, Severity, SourceKind, SqliteJobStore, Stage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared state handed to sensors on each evaluation.
pub struct SensorContext<'a> {
    pub store: &'a SqliteJobStore,
    pub artifacts: &'a ArtifactStore,
    pub now: DateTime<Utc>,
    pub alerts: &'a AlertSettings,
    pub ingestion: &'a IngestionSettings,
}

/// A periodic poller producing pipeline jobs.
pub trait Sensor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimum interval between evaluations.
    fn interval(&self) -> Duration;

    /// Inspect current state and request jobs. Must be idempotent: the same
    /// state yields the same enqueue set.
    fn evaluate(&self, ctx: &SensorContext<'_>) -> Result<Vec<JobRequest>>;
}

/// Detects submissions waiting in the queued stage.
pub struct UrlSensor {
    pub interval: Duration,
    pub batch: usize,
}

impl Sensor for UrlSensor {
    fn name(&self) -> &'static str {
        "url-sensor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn evaluate(&self, ctx: &SensorContext<'_>) -> Result<Vec<JobRequest>> {
        let pending = ctx.store.list_pending(Stage::Queued, self.batch)?;
        let requests: Vec<JobRequest> = pending
            .iter()
            .map(|submission| JobRequest {
                payload: JobPayload::ProcessSubmission {
                    submission_id: submission.id,
                },
                priority: submission.priority,
                dedup_key: format!("process-submission:{}", submission.id),
            })
            .collect();

        if !requests.is_empty() {
            debug!("{} queued submissions pending", requests.len());
        }
        Ok(requests)
    }
}

/// Detects audio files dropped into the ingress directory and registers
/// them as local-file submissions.
pub struct AudioFileSensor {
    pub interval: Duration,
    pub ingress_dir: PathBuf,
}

impl Sensor for AudioFileSensor {
    fn name(&self) -> &'static str {
        "audio-file-sensor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn evaluate(&self, ctx: &SensorContext<'_>) -> Result<Vec<JobRequest>> {
        if !self.ingress_dir.exists() {
            return Ok(Vec::new());
        }

        let mut requests = Vec::new();

        for entry in std::fs::read_dir(&self.ingress_dir)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            if !matches!(ext.as_deref(), Some("mp3" | "m4a" | "wav" | "ogg" | "opus" | "webm")) {
                continue;
            }

            let path_str = path.to_string_lossy().into_owned();
            if !ctx.store.register_ingress_file(&path_str)? {
                continue;
            }

            info!("New ingress file detected: {:?}", path);
            match ctx.store.insert_submission(
                SourceKind::LocalFile,
                &path_str,
                &ctx.ingestion.ingress_user,
                None,
                false,
                5,
            ) {
                Ok(id) => requests.push(JobRequest {
                    payload: JobPayload::ProcessSubmission { submission_id: id },
                    priority: 5,
                    dedup_key: format!("process-submission:{}", id),
                }),
                Err(e) => warn!("Could not register ingress file {:?}: {}", path, e),
            }
        }

        Ok(requests)
    }
}

/// Computes health metrics and raises alerts when thresholds are breached.
pub struct HealthSensor {
    pub interval: Duration,
}

impl Sensor for HealthSensor {
    fn name(&self) -> &'static str {
        "health-sensor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn evaluate(&self, ctx: &SensorContext<'_>) -> Result<Vec<JobRequest>> {
        let window_start =
            ctx.now - ChronoDuration::minutes(ctx.alerts.failure_window_mins as i64);

        if let Some(rate) = ctx.store.failure_rate(window_start)? {
            if rate > ctx.alerts.failure_rate_threshold {
                ctx.store.raise_alert(
                    Severity::Error,
                    "failure-rate",
                    &format!(
                        "failure rate {:.0}% over the last {} minutes",
                        rate * 100.0,
                        ctx.alerts.failure_window_mins
                    ),
                )?;
            }
        }

        let backlog = ctx.store.non_terminal_count()?;
        if backlog > ctx.alerts.backlog_threshold {
            ctx.store.raise_alert(
                Severity::Warning,
                "backlog",
                &format!("{} submissions pending", backlog),
            )?;
        }

        let expirations = ctx
            .store
            .lease_expirations_since(ctx.now - ChronoDuration::hours(1))?;
        if expirations > ctx.alerts.lease_expiry_per_hour {
            ctx.store.raise_alert(
                Severity::Warning,
                "lease-expiry",
                &format!("{} claim leases expired in the last hour", expirations),
            )?;
        }

        let storage = ctx.artifacts.total_size()?;
        if storage > ctx.alerts.storage_cap_bytes {
            ctx.store.raise_alert(
                Severity::Warning,
                "storage",
                &format!(
                    "artifact storage at {} bytes exceeds cap {}",
                    storage, ctx.alerts.storage_cap_bytes
                ),
            )?;
        }

        Ok(vec![JobRequest {
            payload: JobPayload::HealthCheck {
                evaluation_time: ctx.now,
            },
            priority: 8,
            dedup_key: "health-check".to_string(),
        }])
    }
}

/// Fires cleanup when artifact storage exceeds the cap or archived
/// submissions exist.
pub struct CleanupSensor {
    pub interval: Duration,
}

impl Sensor for CleanupSensor {
    fn name(&self) -> &'static str {
        "cleanup-sensor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn evaluate(&self, ctx: &SensorContext<'_>) -> Result<Vec<JobRequest>> {
        let storage = ctx.artifacts.total_size()?;
        let archived = ctx.store.archived_submissions()?;

        if storage <= ctx.alerts.storage_cap_bytes && archived.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Cleanup due: storage={} bytes, {} archived submissions",
            storage,
            archived.len()
        );

        Ok(vec![JobRequest {
            payload: JobPayload::Cleanup {
                evaluation_time: ctx.now,
            },
            priority: 9,
            dedup_key: "cleanup".to_string(),
        }])
    }
}

/// Collects undispatched alerts of at least warning severity.
pub struct AlertDispatchSensor {
    pub interval: Duration,
}

impl Sensor for AlertDispatchSensor {
    fn name(&self) -> &'static str {
        "alert-dispatch-sensor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn evaluate(&self, ctx: &SensorContext<'_>) -> Result<Vec<JobRequest>> {
        let alerts = ctx.store.undispatched_alerts(Severity::Warning)?;
        if alerts.is_empty() {
            return Ok(Vec::new());
        }

        let alert_ids: Vec<i64> = alerts.iter().map(|a| a.id).collect();
        let key = format!(
            "alert-dispatch:{}",
            alert_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );

        Ok(vec![JobRequest {
            payload: JobPayload::AlertDispatch { alert_ids },
            priority: 3,
            dedup_key: key,
        }])
    }
}
