use crate::crew::retry::{Backoff, RetryPolicy};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LLM_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_LLM_MODEL: &str = "llama-3.3-70b-versatile";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing credential: {0} is not set")]
    MissingCredential(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Runtime settings resolved once at startup.
///
/// Provider credentials are read here and nowhere else; every other component
/// receives what it needs from this struct.
#[derive(Debug, Clone)]
pub struct Settings {
    pub llm: LlmSettings,
    pub serper_api_key: Option<String>,
    pub scrape_enabled: bool,
    pub retry: RetryPolicy,
    pub http: HttpSettings,
    pub port: u16,
}

#[derive(Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Loads `.env` (if present) and resolves settings from the process
    /// environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_key = read("LLM_API_KEY")
            .or_else(|| read("GROQ_API_KEY"))
            .ok_or(ConfigError::MissingCredential("GROQ_API_KEY"))?;

        let llm = LlmSettings {
            base_url: read("LLM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: read("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        };

        let defaults = RetryPolicy::default();
        let max_attempts = parse_or(
            "CREW_MAX_RETRIES",
            read("CREW_MAX_RETRIES"),
            defaults.max_attempts,
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CREW_MAX_RETRIES",
                value: "0".into(),
            });
        }
        let base_secs = parse_or(
            "CREW_BACKOFF_BASE_SECS",
            read("CREW_BACKOFF_BASE_SECS"),
            defaults.backoff.base.as_secs(),
        )?;
        let cap_secs = parse_or(
            "CREW_BACKOFF_CAP_SECS",
            read("CREW_BACKOFF_CAP_SECS"),
            defaults.backoff.cap.as_secs(),
        )?;
        if cap_secs < base_secs {
            return Err(ConfigError::InvalidValue {
                key: "CREW_BACKOFF_CAP_SECS",
                value: cap_secs.to_string(),
            });
        }

        let http_defaults = HttpSettings::default();
        let http = HttpSettings {
            timeout: Duration::from_secs(parse_or(
                "HTTP_TIMEOUT_SECS",
                read("HTTP_TIMEOUT_SECS"),
                http_defaults.timeout.as_secs(),
            )?),
            connect_timeout: Duration::from_secs(parse_or(
                "HTTP_CONNECT_TIMEOUT_SECS",
                read("HTTP_CONNECT_TIMEOUT_SECS"),
                http_defaults.connect_timeout.as_secs(),
            )?),
        };

        Ok(Self {
            llm,
            serper_api_key: read("SERPER_API_KEY"),
            scrape_enabled: read("SCRAPE_ENABLED").map(|v| parse_bool(&v)).unwrap_or(true),
            retry: RetryPolicy {
                max_attempts,
                backoff: Backoff {
                    base: Duration::from_secs(base_secs),
                    cap: Duration::from_secs(cap_secs),
                },
            },
            http,
            port: parse_or("PORT", read("PORT"), 8000)?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
