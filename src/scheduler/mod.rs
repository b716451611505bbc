//! Scheduler control loop.
//!
//! One loop drives the whole pipeline: run due sensors, dispatch claimed
//! submissions to a bounded worker pool per stage, record outcomes, sweep
//! expired claims, and execute housekeeping jobs. The scheduler itself only
//! performs short job store operations; all heavy work happens on spawned
//! worker tasks.

use crate::config::Settings;
use crate::error::{HarkError, Result};
use crate::pipeline::{StageOutcome, StageWorker, WorkerContext};
use crate::sensors::{
    AlertDispatchSensor, AudioFileSensor, CleanupSensor, HealthSensor, Sensor, SensorContext,
    UrlSensor,
};
use crate::store::{Alert, JobPayload, PipelineJob, Stage};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Destination for dispatched alerts.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Notifier of last resort: writes alerts to the log.
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        warn!("[alert:{}] {}: {}", alert.severity.as_str(), alert.kind, alert.message);
        Ok(())
    }
}

/// Published view of the worker pool, shared with the status endpoints.
#[derive(Default)]
pub struct PoolState {
    active: RwLock<HashMap<Stage, usize>>,
}

impl PoolState {
    /// Active worker count per stage.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let active = self.active.read().expect("pool state lock");
        let mut out: Vec<(String, usize)> = active
            .iter()
            .map(|(stage, count)| (stage.to_string(), *count))
            .collect();
        out.sort();
        out
    }

    fn publish(&self, counts: &HashMap<Stage, usize>) {
        *self.active.write().expect("pool state lock") = counts.clone();
    }
}

type WorkerResult = (i64, String, Stage, Result<StageOutcome>);

/// The control loop coordinating sensors, workers, and the job store.
pub struct Scheduler {
    ctx: WorkerContext,
    workers: Vec<Arc<dyn StageWorker>>,
    sensors: Vec<Box<dyn Sensor>>,
    notifier: Arc<dyn AlertNotifier>,
    pool: Arc<PoolState>,
    last_sensor_run: HashMap<&'static str, Instant>,
    tasks: JoinSet<WorkerResult>,
    active: HashMap<Stage, usize>,
}

impl Scheduler {
    /// Build a scheduler with the standard sensor set and the given workers.
    pub fn new(
        ctx: WorkerContext,
        workers: Vec<Arc<dyn StageWorker>>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        let sensors = build_sensors(&ctx.settings);
        Self {
            ctx,
            workers,
            sensors,
            notifier,
            pool: Arc::new(PoolState::default()),
            last_sensor_run: HashMap::new(),
            tasks: JoinSet::new(),
            active: HashMap::new(),
        }
    }

    /// Shared handle for status reporting.
    pub fn pool_state(&self) -> Arc<PoolState> {
        self.pool.clone()
    }

    fn slots_for(&self, stage: Stage) -> usize {
        let s = &self.ctx.settings.scheduler;
        match stage {
            Stage::Downloading => s.download_slots,
            Stage::Transcribing => s.transcribe_slots,
            Stage::Chunking => s.chunk_slots,
            Stage::Embedding => s.embed_slots,
            _ => 0,
        }
    }

    fn total_active(&self) -> usize {
        self.active.values().sum()
    }

    /// One pass of the control loop.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> Result<()> {
        self.run_due_sensors()?;
        self.ctx.store.apply_cancellations()?;
        self.drain_finished().await?;
        self.dispatch()?;
        self.ctx.store.sweep_expired_claims()?;
        self.execute_due_jobs().await?;
        self.pool.publish(&self.active);
        Ok(())
    }

    /// Run sensors whose interval has elapsed.
    fn run_due_sensors(&mut self) -> Result<()> {
        let now = Instant::now();
        let sensor_ctx = SensorContext {
            store: self.ctx.store.as_ref(),
            artifacts: self.ctx.artifacts.as_ref(),
            now: Utc::now(),
            alerts: &self.ctx.settings.alerts,
            ingestion: &self.ctx.settings.ingestion,
        };

        for sensor in &self.sensors {
            let due = self
                .last_sensor_run
                .get(sensor.name())
                .map(|last| now.duration_since(*last) >= sensor.interval())
                .unwrap_or(true);
            if !due {
                continue;
            }

            match sensor.evaluate(&sensor_ctx) {
                Ok(requests) => {
                    for request in requests {
                        if let Some(id) = self.ctx.store.enqueue_job(&request)? {
                            debug!("Sensor {} enqueued job {}", sensor.name(), id);
                        }
                    }
                }
                Err(e) => warn!("Sensor {} failed: {}", sensor.name(), e),
            }
            self.last_sensor_run.insert(sensor.name(), now);
        }
        Ok(())
    }

    /// Record outcomes of finished workers.
    async fn drain_finished(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            match joined {
                Ok((submission_id, worker_id, stage, outcome)) => {
                    if let Some(count) = self.active.get_mut(&stage) {
                        *count = count.saturating_sub(1);
                    }
                    self.record_outcome(submission_id, &worker_id, outcome);
                }
                Err(join_err) => {
                    // A panicked worker leaves its claim to the lease sweeper.
                    error!("Worker task aborted: {}", join_err);
                }
            }
        }
        Ok(())
    }

    fn record_outcome(&self, submission_id: i64, worker_id: &str, outcome: Result<StageOutcome>) {
        // Cooperative cancellation boundary: a cancel requested while the
        // stage ran wins over the stage's own outcome.
        let cancelled = self
            .ctx
            .store
            .get(submission_id)
            .map(|s| s.cancel_requested)
            .unwrap_or(false);

        let result = if cancelled {
            self.ctx
                .store
                .fail(submission_id, worker_id, &HarkError::Cancelled)
                .map(|_| ())
        } else {
            match outcome {
                Ok(outcome) => self.ctx.store.complete(
                    submission_id,
                    worker_id,
                    outcome.next_stage,
                    &outcome.artifacts,
                    outcome.note.as_deref(),
                ),
                Err(e) => self
                    .ctx
                    .store
                    .fail(submission_id, worker_id, &e)
                    .map(|_| ()),
            }
        };

        // A lost claim (lease swept mid-run) is not fatal; the submission is
        // already claimable again.
        if let Err(e) = result {
            warn!("Could not record outcome for submission {}: {}", submission_id, e);
        }
    }

    /// Claim work for every stage with free slots and spawn workers.
    fn dispatch(&mut self) -> Result<()> {
        let max_tasks = self.ctx.settings.scheduler.max_tasks;

        for worker in &self.workers {
            let stage = worker.stage();
            let limit = self.slots_for(stage);

            loop {
                let active = *self.active.get(&stage).unwrap_or(&0);
                if active >= limit || self.total_active() >= max_tasks {
                    break;
                }

                let worker_id = format!("{}-{}", stage, Uuid::new_v4());
                let Some(submission) = self.ctx.store.claim_submission(&worker_id, stage)? else {
                    break;
                };

                debug!("Dispatching submission {} to {}", submission.id, worker_id);
                *self.active.entry(stage).or_insert(0) += 1;

                let worker = worker.clone();
                let ctx = self.ctx.clone();
                self.tasks.spawn(async move {
                    // Catch panics so the slot accounting always sees an
                    // outcome; a panicked stage fails retriably.
                    let result = AssertUnwindSafe(worker.run(&submission, &ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(HarkError::Resource("stage worker panicked".into()))
                        });
                    (submission.id, worker_id, stage, result)
                });
            }
        }
        Ok(())
    }

    /// Execute due housekeeping jobs inline.
    async fn execute_due_jobs(&mut self) -> Result<()> {
        for job in self.ctx.store.due_jobs(16)? {
            match &job.payload {
                JobPayload::ProcessSubmission { submission_id } => {
                    // Claims drive the actual processing; the job is closed
                    // once the submission has left the queue.
                    match self.ctx.store.get(*submission_id) {
                        Ok(s) if s.stage != Stage::Queued => {
                            self.ctx.store.finish_job(job.id)?;
                        }
                        Ok(_) => {}
                        Err(_) => self.ctx.store.fail_job(job.id, "submission vanished")?,
                    }
                }
                JobPayload::HealthCheck { evaluation_time } => {
                    debug!("Health check evaluated at {}", evaluation_time);
                    self.ctx.store.finish_job(job.id)?;
                }
                JobPayload::Cleanup { .. } => {
                    self.run_cleanup(&job).await?;
                }
                JobPayload::AlertDispatch { alert_ids } => {
                    let ids = alert_ids.clone();
                    self.dispatch_alerts(&job, &ids).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_cleanup(&self, job: &PipelineJob) -> Result<()> {
        self.ctx.store.start_job(job.id)?;
        let archived = self.ctx.store.archived_submissions()?;
        for submission_id in &archived {
            if let Err(e) = self.ctx.artifacts.delete(*submission_id) {
                warn!("Cleanup of submission {} failed: {}", submission_id, e);
            }
        }
        info!("Cleanup removed artifacts for {} archived submissions", archived.len());
        self.ctx.store.finish_job(job.id)
    }

    async fn dispatch_alerts(&self, job: &PipelineJob, alert_ids: &[i64]) -> Result<()> {
        self.ctx.store.start_job(job.id)?;
        let alerts = self.ctx.store.undispatched_alerts(crate::store::Severity::Warning)?;

        let mut failed = false;
        for alert in alerts.iter().filter(|a| alert_ids.contains(&a.id)) {
            match self.notifier.notify(alert).await {
                Ok(()) => self.ctx.store.mark_dispatched(alert.id)?,
                Err(e) => {
                    warn!("Alert {} dispatch failed: {}", alert.id, e);
                    failed = true;
                }
            }
        }

        if failed {
            self.ctx.store.fail_job(job.id, "one or more alerts undelivered")
        } else {
            self.ctx.store.finish_job(job.id)
        }
    }

    /// Run until no non-terminal submissions remain and all workers are idle.
    pub async fn run_until_drained(&mut self) -> Result<()> {
        let tick = Duration::from_millis(self.ctx.settings.scheduler.tick_ms);
        loop {
            self.tick().await?;
            if self.total_active() == 0 && self.ctx.store.non_terminal_count()? == 0 {
                // One final drain so the last outcomes are recorded.
                self.drain_finished().await?;
                return Ok(());
            }
            tokio::time::sleep(tick).await;
        }
    }

    /// Run until the shutdown signal flips. Daemon mode for `run-ingestion
    /// --watch` and `serve`.
    pub async fn run_forever(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let tick = Duration::from_millis(self.ctx.settings.scheduler.tick_ms);
        info!("Scheduler running (tick {:?})", tick);

        loop {
            self.tick().await?;
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        // Let in-flight workers finish and record them.
                        while self.total_active() > 0 {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            self.drain_finished().await?;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// The standard sensor set, intervals taken from settings.
fn build_sensors(settings: &Settings) -> Vec<Box<dyn Sensor>> {
    let s = &settings.scheduler;
    vec![
        Box::new(UrlSensor {
            interval: Duration::from_secs(s.url_sensor_secs),
            batch: 16,
        }),
        Box::new(AudioFileSensor {
            interval: Duration::from_secs(s.audio_file_sensor_secs),
            ingress_dir: settings.ingress_dir(),
        }),
        Box::new(HealthSensor {
            interval: Duration::from_secs(s.health_sensor_secs),
        }),
        Box::new(CleanupSensor {
            interval: Duration::from_secs(s.cleanup_sensor_secs),
        }),
        Box::new(AlertDispatchSensor {
            interval: Duration::from_secs(s.alert_sensor_secs),
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::asr::FakeTranscriber;
    use crate::embedding::FakeEmbedder;
    use crate::pipeline::{ChunkWorker, EmbedWorker, TranscribeWorker};
    use crate::store::{ArtifactRefs, SourceKind, SqliteJobStore, StoreConfig, Submission};
    use crate::vector_store::{MemoryVectorStore, VectorStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Download stand-in that fabricates an audio artifact without shelling
    /// out to external tools.
    struct StubDownloadWorker;

    #[async_trait]
    impl StageWorker for StubDownloadWorker {
        fn stage(&self) -> Stage {
            Stage::Downloading
        }

        async fn run(&self, submission: &Submission, ctx: &WorkerContext) -> Result<StageOutcome> {
            let path = ctx.artifacts.audio_path(submission.id, "stub", "mp3");
            crate::artifacts::write_atomic(&path, b"stub-audio")?;
            Ok(StageOutcome {
                next_stage: Stage::Downloaded,
                artifacts: ArtifactRefs {
                    audio_path: Some(path.to_string_lossy().into_owned()),
                    audio_bytes: Some(10),
                    audio_duration_secs: Some(5.0),
                    audio_sample_rate: Some(44100),
                    ..ArtifactRefs::default()
                },
                note: None,
            })
        }
    }

    /// Download stand-in that records its own concurrency.
    struct SlowDownloadWorker {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageWorker for SlowDownloadWorker {
        fn stage(&self) -> Stage {
            Stage::Downloading
        }

        async fn run(&self, _submission: &Submission, _ctx: &WorkerContext) -> Result<StageOutcome> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(StageOutcome::advance(Stage::Downloaded))
        }
    }

    fn test_context(chunk_chars: usize, overlap: usize, asr_text: &str) -> (WorkerContext, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.general.data_root = tmp.path().to_string_lossy().into_owned();
        settings.scheduler.tick_ms = 10;
        settings.chunking.chunk_chars = chunk_chars;
        settings.chunking.overlap_chars = overlap;

        let settings = Arc::new(settings);
        let store = Arc::new(SqliteJobStore::in_memory(StoreConfig::default()).unwrap());
        let artifacts = Arc::new(ArtifactStore::new(tmp.path()).unwrap());
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let fake: Arc<dyn crate::asr::SpeechToText> = Arc::new(FakeTranscriber::with_text(asr_text));

        let ctx = WorkerContext {
            store,
            artifacts,
            vectors,
            asr: fake.clone(),
            fake_asr: fake,
            embedder: Arc::new(FakeEmbedder::new(4)),
            settings,
        };
        (ctx, tmp)
    }

    fn full_worker_set() -> Vec<Arc<dyn StageWorker>> {
        vec![
            Arc::new(StubDownloadWorker),
            Arc::new(TranscribeWorker),
            Arc::new(ChunkWorker),
            Arc::new(EmbedWorker),
        ]
    }

    #[tokio::test]
    async fn test_pipeline_runs_end_to_end() {
        let (ctx, _tmp) = test_context(10, 2, "the quick brown fox");
        let store = ctx.store.clone();
        let vectors = ctx.vectors.clone();

        let id = store
            .insert_submission(SourceKind::RemoteUrl, "https://example/test", "u", None, true, 5)
            .unwrap();

        let mut scheduler = Scheduler::new(ctx, full_worker_set(), Arc::new(LogNotifier));
        scheduler.run_until_drained().await.unwrap();

        let submission = store.get(id).unwrap();
        assert_eq!(submission.stage, Stage::Indexed);
        assert_eq!(submission.artifacts.chunk_count, Some(3));

        let records = vectors.get_by_submission(id).await.unwrap();
        assert_eq!(records.len(), 3);
        let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["The quick ", "ick brown ", "own fox"]);

        // Progress reads 100% at indexed.
        let progress = store.get_progress(id).unwrap();
        assert_eq!(progress.percent, 100);
    }

    #[tokio::test]
    async fn test_empty_transcript_still_reaches_indexed() {
        let (ctx, _tmp) = test_context(300, 75, "");
        let store = ctx.store.clone();

        let id = store
            .insert_submission(SourceKind::RemoteUrl, "https://example/silent", "u", None, true, 5)
            .unwrap();

        let mut scheduler = Scheduler::new(ctx, full_worker_set(), Arc::new(LogNotifier));
        scheduler.run_until_drained().await.unwrap();

        let submission = store.get(id).unwrap();
        assert_eq!(submission.stage, Stage::Indexed);
        assert_eq!(submission.artifacts.chunk_count, Some(0));
        assert!(submission.error.unwrap().contains("no-content"));
    }

    #[tokio::test]
    async fn test_download_concurrency_is_bounded() {
        let (ctx, _tmp) = test_context(300, 75, "text");
        let store = ctx.store.clone();

        for i in 0..10 {
            store
                .insert_submission(
                    SourceKind::RemoteUrl,
                    &format!("https://example/{i}"),
                    "u",
                    None,
                    true,
                    5,
                )
                .unwrap();
        }

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let workers: Vec<Arc<dyn StageWorker>> = vec![Arc::new(SlowDownloadWorker {
            current: current.clone(),
            peak: peak.clone(),
        })];

        let mut scheduler = Scheduler::new(ctx, workers, Arc::new(LogNotifier));
        // Only the download stage has a worker; drive until all ten passed it.
        for _ in 0..200 {
            scheduler.tick().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let downloaded = store
                .counts_by_stage()
                .unwrap()
                .iter()
                .find(|(stage, _)| stage == "downloaded")
                .map(|(_, n)| *n)
                .unwrap_or(0);
            if downloaded == 10 {
                break;
            }
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_submission_runs_no_further_stage() {
        let (ctx, _tmp) = test_context(300, 75, "text");
        let store = ctx.store.clone();

        let id = store
            .insert_submission(SourceKind::RemoteUrl, "https://example/c", "u", None, true, 5)
            .unwrap();
        store.request_cancel(id).unwrap();

        let mut scheduler = Scheduler::new(ctx, full_worker_set(), Arc::new(LogNotifier));
        scheduler.run_until_drained().await.unwrap();

        let submission = store.get(id).unwrap();
        assert_eq!(submission.stage, Stage::Cancelled);
        // No artifact was ever produced.
        assert!(submission.artifacts.audio_path.is_none());
    }

    #[tokio::test]
    async fn test_alert_dispatch_marks_alerts() {
        struct CountingNotifier(Arc<AtomicUsize>);

        #[async_trait]
        impl AlertNotifier for CountingNotifier {
            async fn notify(&self, _alert: &Alert) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (ctx, _tmp) = test_context(300, 75, "text");
        let store = ctx.store.clone();
        store
            .raise_alert(crate::store::Severity::Error, "test-alert", "boom")
            .unwrap();

        let sent = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(
            ctx,
            vec![],
            Arc::new(CountingNotifier(sent.clone())),
        );
        // First tick runs sensors and enqueues the dispatch job; it executes
        // on the same pass.
        scheduler.tick().await.unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert!(store
            .undispatched_alerts(crate::store::Severity::Warning)
            .unwrap()
            .is_empty());
    }
}
