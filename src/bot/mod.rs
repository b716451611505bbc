//! Chat-bot protocol surface.
//!
//! Transport-agnostic: the router implements the protocol (URLs become
//! submissions with live progress edits, plain text becomes queries with a
//! feedback keyboard, commands toggle per-user preferences) against a
//! `ChatTransport` trait the actual bot transport implements. A Telegram
//! transport ships in `telegram`.

mod telegram;

pub use telegram::{TelegramNotifier, TelegramPoller, TelegramTransport};

use crate::error::{HarkError, Result};
use crate::retrieval::{QueryRequest, RetrievalEngine};
use crate::store::{FeedbackRating, Progress, SourceKind, SqliteJobStore, Stage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// An incoming event from the chat transport.
#[derive(Debug, Clone)]
pub enum BotUpdate {
    /// A plain text message.
    Message { user_id: String, text: String },
    /// A feedback button press on a previously answered query.
    Feedback {
        user_id: String,
        query_event_id: i64,
        rating: FeedbackRating,
        comment: Option<String>,
    },
}

/// Outbound operations the transport must provide. Message ids let the
/// router edit progress messages in place.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a plain message, returning its id.
    async fn send_message(&self, user_id: &str, text: &str) -> Result<i64>;

    /// Edit a previously sent message.
    async fn edit_message(&self, user_id: &str, message_id: i64, text: &str) -> Result<()>;

    /// Send an answer with {positive, negative, detail-requested} feedback
    /// buttons bound to the query event.
    async fn send_answer(&self, user_id: &str, text: &str, query_event_id: i64) -> Result<i64>;
}

/// Routes chat updates to the pipeline and the retrieval engine.
pub struct BotRouter {
    store: Arc<SqliteJobStore>,
    engine: Arc<RetrievalEngine>,
    transport: Arc<dyn ChatTransport>,
    progress_interval: Duration,
}

impl BotRouter {
    pub fn new(
        store: Arc<SqliteJobStore>,
        engine: Arc<RetrievalEngine>,
        transport: Arc<dyn ChatTransport>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            transport,
            progress_interval,
        }
    }

    /// Handle one update from the transport.
    #[instrument(skip(self, update))]
    pub async fn handle(&self, update: BotUpdate) -> Result<()> {
        match update {
            BotUpdate::Message { user_id, text } => self.handle_message(&user_id, &text).await,
            BotUpdate::Feedback {
                user_id,
                query_event_id,
                rating,
                comment,
            } => {
                self.store.record_feedback(
                    query_event_id,
                    &user_id,
                    rating,
                    comment.as_deref(),
                )?;
                info!("Feedback {} on query {}", rating.as_str(), query_event_id);
                self.transport
                    .send_message(&user_id, "Thanks for the feedback.")
                    .await?;
                Ok(())
            }
        }
    }

    async fn handle_message(&self, user_id: &str, text: &str) -> Result<()> {
        let text = text.trim();

        if let Some(command) = text.strip_prefix('/') {
            return self.handle_command(user_id, command).await;
        }

        let urls = extract_urls(text);
        if !urls.is_empty() {
            return self.handle_submission(user_id, &urls).await;
        }

        self.handle_question(user_id, text).await
    }

    async fn handle_command(&self, user_id: &str, command: &str) -> Result<()> {
        match command.split_whitespace().next().unwrap_or("") {
            "start" | "help" => {
                self.transport
                    .send_message(
                        user_id,
                        "Send me a media URL to ingest it, or ask a question about \
                         already-ingested content.\n\
                         /verbose toggles detailed answers\n\
                         /status shows processing status\n\
                         /cancel <id> cancels a submission",
                    )
                    .await?;
            }
            "verbose" => {
                let verbose = !self.store.is_verbose(user_id)?;
                self.store.set_verbose(user_id, verbose)?;
                let state = if verbose { "on" } else { "off" };
                self.transport
                    .send_message(user_id, &format!("Verbose mode {}", state))
                    .await?;
            }
            "status" => {
                let stats = self.store.stats()?;
                let mut lines = vec![format!("{} submissions pending", stats.pending_total)];
                for (stage, count) in &stats.by_stage {
                    lines.push(format!("  {}: {}", stage, count));
                }
                lines.push(format!("{} queries answered", stats.query_count));
                self.transport
                    .send_message(user_id, &lines.join("\n"))
                    .await?;
            }
            "cancel" => {
                let id = command
                    .split_whitespace()
                    .nth(1)
                    .and_then(|arg| arg.parse::<i64>().ok());
                let reply = match id {
                    Some(id) => match self.store.request_cancel(id) {
                        Ok(()) => format!("Cancellation requested for submission {}", id),
                        Err(e) => format!("[{}] {}", e.tag(), e),
                    },
                    None => "Usage: /cancel <submission id>".to_string(),
                };
                self.transport.send_message(user_id, &reply).await?;
            }
            other => {
                self.transport
                    .send_message(user_id, &format!("Unknown command /{}", other))
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_submission(&self, user_id: &str, urls: &[String]) -> Result<()> {
        for url in urls {
            match self
                .store
                .insert_submission(SourceKind::RemoteUrl, url, user_id, None, false, 5)
            {
                Ok(id) => {
                    let message_id = self
                        .transport
                        .send_message(user_id, &format!("Queued: {}", url))
                        .await?;
                    self.spawn_progress_tracker(user_id.to_string(), id, message_id);
                }
                Err(e @ HarkError::DuplicateSource(_)) => {
                    self.transport
                        .send_message(user_id, &format!("Already in progress: {}", e))
                        .await?;
                }
                Err(e @ HarkError::Backpressure) => {
                    self.transport
                        .send_message(
                            user_id,
                            &format!("[{}] {} — try again later", e.tag(), e),
                        )
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn handle_question(&self, user_id: &str, question: &str) -> Result<()> {
        let verbose = self.store.is_verbose(user_id)?;

        let response = match self
            .engine
            .query(QueryRequest {
                user_id: user_id.to_string(),
                question: question.to_string(),
                top_k: None,
                variant: None,
                system_prompt: None,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.transport
                    .send_message(user_id, &format!("[{}] {}", e.tag(), e))
                    .await?;
                return Ok(());
            }
        };

        let mut text = response.answer.clone();
        if verbose && !response.sources.is_empty() {
            text.push_str("\n\nSources:");
            for source in &response.sources {
                text.push_str(&format!(
                    "\n  [{}#{}] score {:.2}: {}",
                    source.submission_id,
                    source.ordinal,
                    source.score,
                    preview(&source.text, 80)
                ));
            }
            text.push_str(&format!("\n({} ms)", response.response_time_ms));
        }

        self.transport
            .send_answer(user_id, &text, response.query_event_id)
            .await?;
        Ok(())
    }

    /// Poll progress on a cadence and edit the progress message until the
    /// submission is terminal. Polling, not callbacks: the store is the
    /// only channel between the pipeline and the bot.
    fn spawn_progress_tracker(&self, user_id: String, submission_id: i64, message_id: i64) {
        let store = self.store.clone();
        let transport = self.transport.clone();
        let interval = self.progress_interval;

        tokio::spawn(async move {
            let mut last_rendered = String::new();

            loop {
                tokio::time::sleep(interval).await;

                let progress = match store.get_progress(submission_id) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Progress poll for {} failed: {}", submission_id, e);
                        break;
                    }
                };

                let rendered = render_progress(&progress);
                if rendered != last_rendered {
                    if let Err(e) = transport.edit_message(&user_id, message_id, &rendered).await {
                        debug!("Progress edit failed: {}", e);
                    }
                    last_rendered = rendered;
                }

                if progress.stage.is_terminal() {
                    break;
                }
            }
        });
    }
}

/// Render progress as a text bar with the stage name.
pub fn render_progress(progress: &Progress) -> String {
    let filled = (progress.percent as usize) / 10;
    let bar: String = "#".repeat(filled) + &"-".repeat(10 - filled);

    let mut line = format!("[{}] {}% {}", bar, progress.percent, progress.stage);

    if progress.steps_total > 0 && !progress.stage.is_terminal() {
        line.push_str(&format!(" ({}/{})", progress.steps_done, progress.steps_total));
    }
    if progress.stage == Stage::Failed {
        if let Some(error) = &progress.error {
            line.push_str(&format!("\n{}", error));
        }
    }
    line
}

/// Pull HTTP(S) URLs out of a message.
pub fn extract_urls(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(|token| token.trim_end_matches([',', ';', ')']).to_string())
        .collect()
}

fn preview(text: &str, max_len: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.len() <= max_len {
        flat
    } else {
        let cut: String = flat.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Prompts, RetrievalSettings};
    use crate::embedding::{Embedder, FakeEmbedder};
    use crate::llm::FakeChat;
    use crate::retrieval::LexicalOverlapScorer;
    use crate::store::{JobStatus, StoreConfig};
    use crate::vector_store::{ChunkRecord, MemoryVectorStore, VectorStore};
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestTransport {
        sent: Mutex<Vec<(String, String)>>,
        answers: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl ChatTransport for TestTransport {
        async fn send_message(&self, user_id: &str, text: &str) -> Result<i64> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((user_id.to_string(), text.to_string()));
            Ok(sent.len() as i64)
        }

        async fn edit_message(&self, _user_id: &str, _message_id: i64, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn send_answer(&self, user_id: &str, text: &str, query_event_id: i64) -> Result<i64> {
            self.answers
                .lock()
                .unwrap()
                .push((text.to_string(), query_event_id));
            self.send_message(user_id, text).await
        }
    }

    async fn router() -> (BotRouter, Arc<SqliteJobStore>, Arc<TestTransport>) {
        let store = Arc::new(SqliteJobStore::in_memory(StoreConfig::default()).unwrap());
        let vectors = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(FakeEmbedder::new(4));

        vectors
            .upsert_batch(&[ChunkRecord {
                id: "chunk-1".to_string(),
                submission_id: 1,
                ordinal: 0,
                text: "the brown fox".to_string(),
                embedding: embedder.embed("the brown fox").await.unwrap(),
                indexed_at: Utc::now(),
            }])
            .await
            .unwrap();

        let engine = Arc::new(RetrievalEngine::new(
            store.clone(),
            vectors,
            embedder,
            Arc::new(FakeChat::new("the answer")),
            Arc::new(LexicalOverlapScorer),
            Prompts::default(),
            RetrievalSettings::default(),
        ));

        let transport = Arc::new(TestTransport::default());
        let router = BotRouter::new(
            store.clone(),
            engine,
            transport.clone(),
            Duration::from_millis(10),
        );
        (router, store, transport)
    }

    #[tokio::test]
    async fn test_url_message_creates_submission() {
        let (router, store, transport) = router().await;

        router
            .handle(BotUpdate::Message {
                user_id: "u1".to_string(),
                text: "https://youtube.com/watch?v=abc".to_string(),
            })
            .await
            .unwrap();

        let pending = store.list_pending(Stage::Queued, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, JobStatus::Pending);
        assert!(transport.sent.lock().unwrap()[0].1.contains("Queued"));
    }

    #[tokio::test]
    async fn test_question_message_answers_with_feedback_binding() {
        let (router, store, transport) = router().await;

        router
            .handle(BotUpdate::Message {
                user_id: "u1".to_string(),
                text: "what does the fox say".to_string(),
            })
            .await
            .unwrap();

        let answers = transport.answers.lock().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].0, "the answer");
        assert!(answers[0].1 > 0);
        assert_eq!(store.stats().unwrap().query_count, 1);
    }

    #[tokio::test]
    async fn test_feedback_updates_counts() {
        let (router, store, _transport) = router().await;

        let query_id = store
            .record_query("u1", "q", 3, "hybrid", false, "a", 5, &[])
            .unwrap();

        router
            .handle(BotUpdate::Feedback {
                user_id: "u1".to_string(),
                query_event_id: query_id,
                rating: FeedbackRating::Negative,
                comment: Some("wrong".to_string()),
            })
            .await
            .unwrap();

        let counts = store.feedback_counts().unwrap();
        assert_eq!(counts, vec![("negative".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_verbose_toggle_persists_and_changes_reply() {
        let (router, store, transport) = router().await;

        router
            .handle(BotUpdate::Message {
                user_id: "u1".to_string(),
                text: "/verbose".to_string(),
            })
            .await
            .unwrap();
        assert!(store.is_verbose("u1").unwrap());

        router
            .handle(BotUpdate::Message {
                user_id: "u1".to_string(),
                text: "brown fox".to_string(),
            })
            .await
            .unwrap();

        let answers = transport.answers.lock().unwrap();
        assert!(answers[0].0.contains("Sources:"));
    }

    #[test]
    fn test_extract_urls() {
        assert_eq!(
            extract_urls("look at https://youtu.be/x and http://example.com/a,"),
            vec!["https://youtu.be/x", "http://example.com/a"]
        );
        assert!(extract_urls("no links here").is_empty());
    }

    #[test]
    fn test_render_progress_bar() {
        let progress = Progress {
            stage: Stage::Transcribing,
            status: JobStatus::Running,
            percent: 30,
            steps_done: 0,
            steps_total: 0,
            error: None,
        };
        assert_eq!(render_progress(&progress), "[###-------] 30% transcribing");

        let embedding = Progress {
            stage: Stage::Embedding,
            status: JobStatus::Running,
            percent: 75,
            steps_done: 2,
            steps_total: 5,
            error: None,
        };
        assert!(render_progress(&embedding).ends_with("(2/5)"));
    }
}
