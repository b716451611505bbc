//! LLM client configuration and the chat-completion seam.

mod fake;

pub use fake::FakeChat;

use crate::error::{HarkError, Result};
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;
use std::time::Duration;
use tracing::instrument;

/// Default timeout for LLM API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Create an API client with a configured timeout.
///
/// The key is taken from `LLM_API_KEY`; `OPENAI_API_KEY` is honoured as a
/// fallback for compatibility with the underlying client.
pub fn create_client() -> Client<OpenAIConfig> {
    create_client_with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
}

/// Create an API client with a custom timeout.
pub fn create_client_with_timeout(timeout: Duration) -> Client<OpenAIConfig> {
    let http_client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("Failed to create HTTP client");

    let config = match std::env::var("LLM_API_KEY") {
        Ok(key) => OpenAIConfig::default().with_api_key(key),
        Err(_) => OpenAIConfig::default(),
    };

    Client::with_config(config).with_http_client(http_client)
}

/// Trait for chat-completion endpoints.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one system + user exchange and return the assistant text.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Chat model backed by the OpenAI-compatible API.
pub struct OpenAiChat {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(model: &str, max_tokens: u32, temperature: f32, timeout: Duration) -> Self {
        Self {
            client: create_client_with_timeout(timeout),
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    #[instrument(skip(self, system, user))]
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system.to_string())
                .build()
                .map_err(|e| HarkError::OpenAI(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user.to_string())
                .build()
                .map_err(|e| HarkError::OpenAI(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
            .build()
            .map_err(|e| HarkError::OpenAI(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| HarkError::OpenAI(format!("Chat completion failed: {}", e)))?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| HarkError::Model("Empty response from LLM".to_string()))
    }
}
