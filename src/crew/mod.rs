//! The listing crew: declarative stages, the executor that runs them, and the
//! retry and extraction logic wrapped around it.

pub mod executor;
pub mod extract;
pub mod guardrails;
pub mod retry;
pub mod schema;
pub mod stages;

pub use executor::SequentialExecutor;
pub use schema::{ListingCopy, ListingOutput, ProductRecord, ResearchReport};

use crate::llm::LlmError;
use crate::tools::ToolKind;
use async_trait::async_trait;
use retry::RateLimitAware;
use std::time::Duration;
use thiserror::Error;

/// Persona the model plays for one stage.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub role: &'static str,
    pub goal: &'static str,
    pub backstory: &'static str,
    pub temperature: f32,
}

/// One step of the pipeline. `instruction` may reference `{url}`, which is
/// substituted from the run's [`CrewContext`].
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: &'static str,
    pub agent: AgentProfile,
    pub instruction: &'static str,
    pub expected_output: &'static str,
    pub tools: &'static [ToolKind],
}

impl StageSpec {
    pub fn render_instruction(&self, context: &CrewContext) -> String {
        self.instruction.replace("{url}", &context.url)
    }
}

/// Inputs a run is bound to.
#[derive(Debug, Clone)]
pub struct CrewContext {
    pub url: String,
}

/// Raw text a stage produced.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub stage: &'static str,
    pub raw: String,
    pub elapsed_ms: u128,
}

#[derive(Debug, Error)]
pub enum CrewError {
    #[error("stage `{stage}` was rate limited by the provider")]
    RateLimited {
        stage: &'static str,
        retry_after: Option<Duration>,
    },
    #[error("stage `{stage}` failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },
}

impl CrewError {
    pub fn from_llm(stage: &'static str, err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { retry_after } => CrewError::RateLimited { stage, retry_after },
            other => CrewError::Stage {
                stage,
                message: other.to_string(),
            },
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            CrewError::RateLimited { stage, .. } | CrewError::Stage { stage, .. } => stage,
        }
    }
}

impl RateLimitAware for CrewError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, CrewError::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CrewError::RateLimited { retry_after, .. } => *retry_after,
            CrewError::Stage { .. } => None,
        }
    }
}

/// Runs a stage list against a bound context and returns one raw output per
/// stage, in order.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        stages: &[StageSpec],
        context: &CrewContext,
    ) -> Result<Vec<StageOutput>, CrewError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_rate_limit_maps_to_transient_crew_error() {
        let err = CrewError::from_llm(
            stages::WRITE,
            LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(3)),
            },
        );
        assert!(err.is_rate_limited());
        assert_eq!(err.stage(), "write");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));

        let err = CrewError::from_llm(stages::SCRAPE, LlmError::Http("HTTP 500".into()));
        assert!(!err.is_rate_limited());
        assert_eq!(err.retry_after(), None);
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn url_is_substituted_into_instruction() {
        let spec = stages::listing_stages().remove(0);
        let rendered = spec.render_instruction(&CrewContext {
            url: "https://example.com/product".into(),
        });
        assert!(rendered.contains("https://example.com/product"));
        assert!(!rendered.contains("{url}"));
    }
}
