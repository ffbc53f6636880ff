use super::{ChatModel, ChatOptions, LlmError, LlmMessage, LlmResponse, LlmUsage};
use crate::config::{HttpSettings, LlmSettings};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Client for OpenAI-compatible `/chat/completions` endpoints (Groq by default).
pub struct LlmClient {
    http: Client,
    config: LlmSettings,
}

impl LlmClient {
    pub fn new(config: LlmSettings, http: &HttpSettings) -> Self {
        Self {
            http: build_client(http),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat(
        &self,
        messages: &[LlmMessage],
        options: ChatOptions,
    ) -> Result<LlmResponse, LlmError> {
        let base = self.config.base_url.trim();
        if base.is_empty() {
            return Err(LlmError::Http("missing base url".into()));
        }

        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: options.temperature,
        };

        let response = self
            .http
            .post(format!("{base}/chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            debug!(target = "listing.llm", ?retry_after, "provider_rate_limited");
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "HTTP {status}: {}",
                detail.chars().take(300).collect::<String>()
            )));
        }

        let payload: ChatCompletion = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        let text = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))?;

        Ok(LlmResponse {
            text,
            usage: payload.usage,
        })
    }
}

fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [LlmMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_accepts_seconds() {
        assert_eq!(parse_retry_after(Some("7")), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after(Some(" 1.5 ")),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn completion_payload_decodes() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "{\"title\":\"T\"}"}
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        }"#;
        let payload: ChatCompletion = serde_json::from_str(raw).unwrap();
        assert_eq!(
            payload.choices[0].message.content.as_deref(),
            Some("{\"title\":\"T\"}")
        );
        assert_eq!(payload.usage.unwrap().completion_tokens, Some(4));
    }

    #[test]
    fn request_body_shape() {
        let messages = vec![LlmMessage::system("sys"), LlmMessage::user("hi")];
        let body = ChatRequest {
            model: "llama-3.3-70b-versatile",
            messages: &messages,
            temperature: 0.5,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "llama-3.3-70b-versatile");
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["temperature"], 0.5);
    }
}
