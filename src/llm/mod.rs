mod openai;

pub use openai::LlmClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
}

#[derive(Debug)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Option<LlmUsage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// A text generator the crew can drive. Implemented by [`LlmClient`] and by
/// fakes in tests.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(
        &self,
        messages: &[LlmMessage],
        options: ChatOptions,
    ) -> Result<LlmResponse, LlmError>;
}
