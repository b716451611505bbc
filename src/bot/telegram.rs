//! Telegram transport for the chat surface.
//!
//! Speaks the Bot HTTP API directly over reqwest: long-polls `getUpdates`
//! and maps messages and feedback-button callbacks onto `BotUpdate`s for
//! the router. Enabled when `BOT_TOKEN` is set.

use super::{BotRouter, BotUpdate, ChatTransport};
use crate::error::{HarkError, Result};
use crate::scheduler::AlertNotifier;
use crate::store::{Alert, FeedbackRating};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_TIMEOUT_SECS: u64 = 30;

/// Transport over the Telegram Bot API.
pub struct TelegramTransport {
    client: reqwest::Client,
    token: String,
}

impl TelegramTransport {
    pub fn new(token: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
                .build()
                .expect("Failed to create HTTP client"),
            token: token.to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let response: Value = self
            .client
            .post(self.url(method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if response["ok"].as_bool() != Some(true) {
            return Err(HarkError::Network(format!(
                "telegram {} failed: {}",
                method,
                response["description"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(response["result"].clone())
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(&self, user_id: &str, text: &str) -> Result<i64> {
        let result = self
            .call("sendMessage", json!({ "chat_id": user_id, "text": text }))
            .await?;
        Ok(result["message_id"].as_i64().unwrap_or(0))
    }

    async fn edit_message(&self, user_id: &str, message_id: i64, text: &str) -> Result<()> {
        self.call(
            "editMessageText",
            json!({ "chat_id": user_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn send_answer(&self, user_id: &str, text: &str, query_event_id: i64) -> Result<i64> {
        let keyboard = json!({
            "inline_keyboard": [[
                { "text": "+", "callback_data": format!("fb:positive:{}", query_event_id) },
                { "text": "-", "callback_data": format!("fb:negative:{}", query_event_id) },
                { "text": "more", "callback_data": format!("fb:detail-requested:{}", query_event_id) },
            ]]
        });

        let result = self
            .call(
                "sendMessage",
                json!({ "chat_id": user_id, "text": text, "reply_markup": keyboard }),
            )
            .await?;
        Ok(result["message_id"].as_i64().unwrap_or(0))
    }
}

/// Long-polling loop feeding the router.
pub struct TelegramPoller {
    transport: Arc<TelegramTransport>,
    router: Arc<BotRouter>,
}

impl TelegramPoller {
    pub fn new(transport: Arc<TelegramTransport>, router: Arc<BotRouter>) -> Self {
        Self { transport, router }
    }

    /// Poll until the process exits. Transport errors back off and retry.
    pub async fn run(&self) {
        info!("Telegram poller started");
        let mut offset: i64 = 0;

        loop {
            let updates = match self
                .transport
                .call(
                    "getUpdates",
                    json!({ "offset": offset, "timeout": POLL_TIMEOUT_SECS }),
                )
                .await
            {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("getUpdates failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates.as_array().cloned().unwrap_or_default() {
                if let Some(update_id) = update["update_id"].as_i64() {
                    offset = offset.max(update_id + 1);
                }

                let Some(bot_update) = parse_update(&update) else {
                    continue;
                };

                // Acknowledge button presses so the client stops spinning.
                if let Some(callback_id) = update["callback_query"]["id"].as_str() {
                    let _ = self
                        .transport
                        .call("answerCallbackQuery", json!({ "callback_query_id": callback_id }))
                        .await;
                }

                if let Err(e) = self.router.handle(bot_update).await {
                    warn!("Update handling failed: {}", e);
                }
            }
        }
    }
}

/// Map a raw Telegram update onto the router's protocol.
fn parse_update(update: &Value) -> Option<BotUpdate> {
    if let Some(message) = update.get("message") {
        let user_id = message["chat"]["id"].as_i64()?.to_string();
        let text = message["text"].as_str()?.to_string();
        return Some(BotUpdate::Message { user_id, text });
    }

    if let Some(callback) = update.get("callback_query") {
        let user_id = callback["from"]["id"].as_i64()?.to_string();
        let data = callback["data"].as_str()?;

        let mut parts = data.splitn(3, ':');
        if parts.next() != Some("fb") {
            debug!("Ignoring unknown callback data: {}", data);
            return None;
        }
        let rating = FeedbackRating::parse(parts.next()?)?;
        let query_event_id = parts.next()?.parse().ok()?;

        return Some(BotUpdate::Feedback {
            user_id,
            query_event_id,
            rating,
            comment: None,
        });
    }

    None
}

/// Alert notifier that messages the admin chat.
pub struct TelegramNotifier {
    transport: Arc<TelegramTransport>,
    admin_chat_id: String,
}

impl TelegramNotifier {
    pub fn new(transport: Arc<TelegramTransport>, admin_chat_id: &str) -> Self {
        Self {
            transport,
            admin_chat_id: admin_chat_id.to_string(),
        }
    }
}

#[async_trait]
impl AlertNotifier for TelegramNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let text = format!(
            "[{}] {}\n{}",
            alert.severity.as_str(),
            alert.kind,
            alert.message
        );
        self.transport
            .send_message(&self.admin_chat_id, &text)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_update() {
        let update = json!({
            "update_id": 7,
            "message": { "chat": { "id": 42 }, "text": "hello" }
        });
        match parse_update(&update) {
            Some(BotUpdate::Message { user_id, text }) => {
                assert_eq!(user_id, "42");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_feedback_callback() {
        let update = json!({
            "update_id": 8,
            "callback_query": {
                "id": "cb1",
                "from": { "id": 42 },
                "data": "fb:negative:17"
            }
        });
        match parse_update(&update) {
            Some(BotUpdate::Feedback {
                query_event_id,
                rating,
                ..
            }) => {
                assert_eq!(query_event_id, 17);
                assert_eq!(rating, FeedbackRating::Negative);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_unknown_callbacks() {
        let update = json!({
            "update_id": 9,
            "callback_query": { "id": "cb2", "from": { "id": 1 }, "data": "nav:next" }
        });
        assert!(parse_update(&update).is_none());
    }
}
