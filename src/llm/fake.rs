//! Scripted chat model for tests and deterministic evaluation runs.

use super::ChatModel;
use crate::error::{HarkError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Deterministic chat model. Responses are looked up by substring match on
/// the user prompt; unmatched prompts get the default response. Every call
/// is recorded so tests can assert on prompt construction.
pub struct FakeChat {
    responses: Vec<(String, String)>,
    default_response: String,
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeChat {
    pub fn new(default_response: &str) -> Self {
        Self {
            responses: Vec::new(),
            default_response: default_response.to_string(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Respond with `response` whenever the user prompt contains `needle`.
    pub fn with_response(mut self, needle: &str, response: &str) -> Self {
        self.responses.push((needle.to_string(), response.to_string()));
        self
    }

    /// Build a fake keyed by exact mapping.
    pub fn from_map(map: HashMap<String, String>, default_response: &str) -> Self {
        let mut fake = Self::new(default_response);
        fake.responses = map.into_iter().collect();
        fake.responses.sort();
        fake
    }

    /// Make every call fail, for exercising the error path.
    pub fn failing() -> Self {
        Self {
            responses: Vec::new(),
            default_response: String::new(),
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Prompts seen so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for FakeChat {
    async fn complete(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.lock().unwrap().push(user.to_string());

        if self.fail {
            return Err(HarkError::Model("scripted failure".to_string()));
        }

        for (needle, response) in &self.responses {
            if user.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default_response.clone())
    }
}
