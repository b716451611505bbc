//! Command implementations.

use crate::api::{self, AppState};
use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::asr::{FakeTranscriber, SpeechToText, WhisperTranscriber};
use crate::bot::{BotRouter, TelegramNotifier, TelegramPoller, TelegramTransport};
use crate::cli::Output;
use crate::config::{Prompts, Settings};
use crate::embedding::{Embedder, OpenAIEmbedder};
use crate::error::{HarkError, Result};
use crate::eval::{load_cases, EvalHarness};
use crate::llm::{ChatModel, OpenAiChat};
use crate::pipeline::{standard_workers, WorkerContext};
use crate::retrieval::{
    LexicalOverlapScorer, QueryRequest, RetrievalEngine, RetrievalVariant,
};
use crate::scheduler::{AlertNotifier, LogNotifier, Scheduler};
use crate::store::{SourceKind, SqliteJobStore, Stage, StoreConfig};
use crate::vector_store::{SqliteVectorStore, VectorStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Long-lived components built once per invocation.
pub struct Runtime {
    pub settings: Arc<Settings>,
    pub store: Arc<SqliteJobStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatModel>,
    pub engine: Arc<RetrievalEngine>,
    pub worker_ctx: WorkerContext,
}

impl Runtime {
    pub fn build(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);

        let store = Arc::new(SqliteJobStore::new(
            &settings.jobstore_path(),
            StoreConfig::from(&settings.ingestion),
        )?);
        let artifacts = Arc::new(ArtifactStore::new(&settings.data_root())?);
        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::new(&settings.vectorstore_path())?);

        let asr: Arc<dyn SpeechToText> = Arc::new(WhisperTranscriber::new(
            &settings.asr.model,
            settings.asr.split_secs,
            settings.asr.max_concurrent_segments,
            settings.asr.timeout_secs,
        ));
        let fake_asr: Arc<dyn SpeechToText> = Arc::new(FakeTranscriber::new());

        let embedder: Arc<dyn Embedder> = Arc::new(OpenAIEmbedder::new(
            &settings.embedding.model,
            settings.embedding.dimensions as usize,
            settings.embedding.batch_size,
            settings.embedding.timeout_secs,
        ));
        let chat: Arc<dyn ChatModel> = Arc::new(OpenAiChat::new(
            &settings.retrieval.model,
            settings.retrieval.max_tokens,
            settings.retrieval.temperature,
            Duration::from_secs(settings.retrieval.timeout_secs),
        ));

        let engine = Arc::new(RetrievalEngine::new(
            store.clone(),
            vectors.clone(),
            embedder.clone(),
            chat.clone(),
            Arc::new(LexicalOverlapScorer),
            Prompts::default(),
            settings.retrieval.clone(),
        ));

        let worker_ctx = WorkerContext {
            store: store.clone(),
            artifacts: artifacts.clone(),
            vectors: vectors.clone(),
            asr,
            fake_asr,
            embedder: embedder.clone(),
            settings: settings.clone(),
        };

        Ok(Self {
            settings,
            store,
            artifacts,
            vectors,
            embedder,
            chat,
            engine,
            worker_ctx,
        })
    }

    fn scheduler(&self) -> Scheduler {
        self.scheduler_with(Arc::new(LogNotifier))
    }

    fn scheduler_with(&self, notifier: Arc<dyn AlertNotifier>) -> Scheduler {
        Scheduler::new(self.worker_ctx.clone(), standard_workers(), notifier)
    }
}

fn source_kind_of(input: &str) -> SourceKind {
    if input.starts_with("http://") || input.starts_with("https://") {
        SourceKind::RemoteUrl
    } else {
        SourceKind::LocalFile
    }
}

fn submit_all(
    runtime: &Runtime,
    urls: &[String],
    fake_asr: bool,
    language: Option<&str>,
) -> Result<Vec<i64>> {
    if urls.is_empty() {
        return Err(HarkError::InvalidInput("no urls given".into()));
    }

    let mut ids = Vec::new();
    for url in urls {
        let id = runtime.store.insert_submission(
            source_kind_of(url),
            url,
            "cli",
            language,
            fake_asr,
            5,
        )?;
        Output::info(&format!("Submission {} queued: {}", id, url));
        ids.push(id);
    }
    Ok(ids)
}

/// `process`: submit and drive the pipeline until every submission is
/// terminal.
pub async fn run_process(
    urls: &[String],
    fake_asr: bool,
    language: Option<&str>,
    settings: Settings,
) -> Result<()> {
    let runtime = Runtime::build(settings)?;
    let ids = submit_all(&runtime, urls, fake_asr, language)?;

    let spinner = Output::spinner("Processing...");
    let mut scheduler = runtime.scheduler();
    scheduler.run_until_drained().await?;
    spinner.finish_and_clear();

    let mut failed = 0;
    for id in ids {
        let submission = runtime.store.get(id)?;
        match submission.stage {
            Stage::Indexed => Output::success(&format!(
                "Submission {}: indexed {} chunks",
                id,
                submission.artifacts.chunk_count.unwrap_or(0)
            )),
            stage => {
                failed += 1;
                Output::error(&format!(
                    "Submission {}: {} ({})",
                    id,
                    stage,
                    submission.error.unwrap_or_default()
                ));
            }
        }
    }

    if failed > 0 {
        return Err(HarkError::JobStore(format!("{failed} submissions did not index")));
    }
    Ok(())
}

/// `ingest-job`: enqueue only; the scheduler picks the work up later.
pub async fn run_ingest_job(urls: &[String], settings: Settings) -> Result<()> {
    let runtime = Runtime::build(settings)?;
    let ids = submit_all(&runtime, urls, false, None)?;
    Output::success(&format!("Enqueued {} submissions", ids.len()));
    Ok(())
}

/// `run-ingestion`: drain pending work or watch forever.
pub async fn run_ingestion(all: bool, watch: bool, settings: Settings) -> Result<()> {
    let runtime = Runtime::build(settings)?;
    let mut scheduler = runtime.scheduler();

    if watch {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(true);
        });
        Output::info("Scheduler running; Ctrl+C to stop");
        scheduler.run_forever(rx).await?;
    } else if all {
        let pending = runtime.store.non_terminal_count()?;
        Output::info(&format!("Draining {} pending submissions", pending));
        scheduler.run_until_drained().await?;
        Output::success("Ingestion drained");
    } else {
        return Err(HarkError::InvalidInput(
            "pass --all to drain or --watch to keep running".into(),
        ));
    }
    Ok(())
}

/// `query`: one-shot question.
pub async fn run_query(
    text: &str,
    top_k: Option<usize>,
    variant: Option<&str>,
    settings: Settings,
) -> Result<()> {
    let runtime = Runtime::build(settings)?;

    let variant = match variant {
        Some(s) => Some(
            s.parse::<RetrievalVariant>()
                .map_err(HarkError::InvalidInput)?,
        ),
        None => None,
    };

    let response = runtime
        .engine
        .query(QueryRequest {
            user_id: "cli".to_string(),
            question: text.to_string(),
            top_k,
            variant,
            system_prompt: None,
        })
        .await?;

    println!("{}", response.answer);
    for source in &response.sources {
        Output::source(source.submission_id, source.ordinal, source.score, &source.text);
    }
    Output::kv("variant", response.variant.as_str());
    Output::kv("response time", &format!("{} ms", response.response_time_ms));
    Ok(())
}

/// `status`: counts by stage, storage, corpus size.
pub async fn run_status(settings: Settings) -> Result<()> {
    let runtime = Runtime::build(settings)?;
    let stats = runtime.store.stats()?;

    Output::header("Pipeline");
    for (stage, count) in &stats.by_stage {
        Output::kv(stage, &count.to_string());
    }
    Output::kv("pending total", &stats.pending_total.to_string());

    Output::header("Storage");
    Output::kv(
        "audio",
        &format!("{} bytes", runtime.artifacts.size(ArtifactKind::Audio)?),
    );
    Output::kv(
        "transcripts",
        &format!("{} bytes", runtime.artifacts.size(ArtifactKind::Transcript)?),
    );
    Output::kv(
        "chunks",
        &format!("{} bytes", runtime.artifacts.size(ArtifactKind::Chunks)?),
    );

    Output::header("Corpus");
    Output::kv("indexed chunks", &runtime.vectors.count().await?.to_string());
    Ok(())
}

/// `dashboard`: analytics snapshot.
pub async fn run_dashboard(settings: Settings) -> Result<()> {
    let runtime = Runtime::build(settings)?;
    let stats = runtime.store.stats()?;

    Output::header("Queries");
    Output::kv("total", &stats.query_count.to_string());
    if let Some(avg) = stats.avg_response_time_ms {
        Output::kv("avg response time", &format!("{:.0} ms", avg));
    }

    Output::header("Feedback");
    if stats.feedback_counts.is_empty() {
        Output::list_item("none yet");
    }
    for (rating, count) in &stats.feedback_counts {
        Output::kv(rating, &count.to_string());
    }

    Output::header("Alerts (undispatched)");
    let alerts = runtime
        .store
        .undispatched_alerts(crate::store::Severity::Info)?;
    if alerts.is_empty() {
        Output::list_item("none");
    }
    for alert in alerts {
        Output::list_item(&format!(
            "[{}] {}: {}",
            alert.severity.as_str(),
            alert.kind,
            alert.message
        ));
    }
    Ok(())
}

/// `evaluate`: compare variants over a case file.
pub async fn run_evaluate(
    cases_path: &str,
    variants: Option<&str>,
    k: usize,
    output: Option<&str>,
    settings: Settings,
) -> Result<()> {
    let runtime = Runtime::build(settings)?;
    let cases = load_cases(Path::new(cases_path))?;
    if cases.is_empty() {
        return Err(HarkError::InvalidInput("case file is empty".into()));
    }

    let variants: Vec<RetrievalVariant> = match variants {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().parse::<RetrievalVariant>())
            .collect::<std::result::Result<_, _>>()
            .map_err(HarkError::InvalidInput)?,
        None => RetrievalVariant::ALL.to_vec(),
    };

    Output::info(&format!(
        "Evaluating {} cases across {} variants (k={})",
        cases.len(),
        variants.len(),
        k
    ));

    let harness = EvalHarness::new(
        runtime.engine.clone(),
        runtime.embedder.clone(),
        Some(runtime.chat.clone()),
        Prompts::default(),
    );
    let report = harness.run(&cases, &variants, k).await?;

    Output::header("Ranking");
    for (place, variant) in report.variants.iter().enumerate() {
        Output::list_item(&format!(
            "{}. {}  hit@{}={:.2}  mrr={:.3}  sim={}  judge={}  combined={:.3}",
            place + 1,
            variant.variant,
            k,
            variant.hit_rate_at_k,
            variant.mean_reciprocal_rank,
            variant
                .avg_answer_similarity
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".into()),
            variant
                .avg_judge_score
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".into()),
            variant.combined_score,
        ));
    }

    if let Some(path) = output {
        let json = serde_json::to_vec_pretty(&report)?;
        crate::artifacts::write_atomic(Path::new(path), &json)?;
        Output::success(&format!("Report written to {}", path));
    }
    Ok(())
}

/// `serve`: HTTP API plus the scheduler, and the chat surface when
/// `BOT_TOKEN` is set.
pub async fn run_serve(host: &str, port: u16, settings: Settings) -> Result<()> {
    let runtime = Runtime::build(settings)?;

    // The chat transport comes up when a token is present; alert dispatch
    // goes to the admin chat when both BOT_TOKEN and ADMIN_CHAT_ID are set.
    let transport = std::env::var("BOT_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .map(|token| Arc::new(TelegramTransport::new(&token)));

    let notifier: Arc<dyn AlertNotifier> = match (&transport, &runtime.settings.alerts.admin_chat_id)
    {
        (Some(transport), Some(admin)) => {
            Arc::new(TelegramNotifier::new(transport.clone(), admin))
        }
        _ => Arc::new(LogNotifier),
    };

    if let Some(transport) = &transport {
        let router = Arc::new(BotRouter::new(
            runtime.store.clone(),
            runtime.engine.clone(),
            transport.clone(),
            Duration::from_secs(runtime.settings.bot.progress_interval_secs),
        ));
        let poller = TelegramPoller::new(transport.clone(), router);
        tokio::spawn(async move { poller.run().await });
        Output::info("Chat surface enabled");
    }

    let mut scheduler = runtime.scheduler_with(notifier);
    let pool = scheduler.pool_state();

    let (tx, rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(async move { scheduler.run_forever(rx).await });

    let state = Arc::new(AppState {
        store: runtime.store.clone(),
        artifacts: runtime.artifacts.clone(),
        vectors: runtime.vectors.clone(),
        engine: runtime.engine.clone(),
        pool: Some(pool),
    });

    let serve_result = api::serve(state, host, port).await;

    let _ = tx.send(true);
    let _ = scheduler_task.await;

    serve_result
}
