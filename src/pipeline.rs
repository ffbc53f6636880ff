use crate::config::Settings;
use crate::crew::extract::{extract_listing, parse_lenient};
use crate::crew::guardrails::{self, GuardrailIssue};
use crate::crew::retry::{RetryError, RetryPolicy, Sleeper, TokioSleeper, retry_with_backoff};
use crate::crew::stages::{RESEARCH, SCRAPE, WRITE, listing_stages};
use crate::crew::{
    CrewContext, CrewError, ListingOutput, ProductRecord, ResearchReport, SequentialExecutor,
    StageExecutor, StageOutput, StageSpec,
};
use crate::llm::LlmClient;
use crate::models::{ListingResponse, StageReport};
use crate::product_url::{canonical_product_url, extract_asin, normalize_url};
use crate::tools::Toolbox;
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const CREW_OPERATION: &str = "crew_kickoff";

#[derive(Clone)]
pub struct Pipeline {
    executor: Arc<dyn StageExecutor>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(settings: &Settings) -> Self {
        let model = LlmClient::new(settings.llm.clone(), &settings.http);
        info!(
            target = "listing.crew",
            model = model.model(),
            max_attempts = settings.retry.max_attempts,
            scrape_enabled = settings.scrape_enabled,
            search_enabled = settings.serper_api_key.is_some(),
            "pipeline_configured"
        );
        let executor = SequentialExecutor::new(Arc::new(model), Toolbox::from_settings(settings));
        Self::with_executor(Arc::new(executor), Arc::new(TokioSleeper), settings.retry)
    }

    pub fn with_executor(
        executor: Arc<dyn StageExecutor>,
        sleeper: Arc<dyn Sleeper>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            sleeper,
            retry,
        }
    }

    /// Final listing only, without the transcript.
    pub async fn generate_listing(&self, url: &str) -> Result<ListingOutput, PipelineError> {
        self.run(url).await.map(|response| response.output)
    }

    pub async fn run(&self, url: &str) -> Result<ListingResponse, PipelineError> {
        let mut stages = Vec::new();

        let url = self
            .capture_stage("normalize_url", &mut stages, async {
                let normalized = normalize_url(url)
                    .map_err(|err| PipelineError::invalid_input("normalize_url", err.to_string()))?;
                let output = json!({
                    "input": url,
                    "url": normalized,
                    "asin": extract_asin(&normalized),
                    "canonical_url": canonical_product_url(&normalized),
                });
                Ok(StageOutcome::new(normalized, output))
            })
            .await?;

        let specs = listing_stages();
        let context = CrewContext { url: url.clone() };
        let crew = {
            let executor = &self.executor;
            let specs = &specs;
            let context = &context;
            retry_with_backoff(&self.retry, self.sleeper.as_ref(), CREW_OPERATION, move || {
                executor.execute(specs, context)
            })
            .await
            .map_err(PipelineError::from_retry)?
        };
        let attempts = crew.attempts;
        let outputs = crew.value;
        verify_outputs(&specs, &outputs)?;

        let [scrape, research, write] = outputs.as_slice() else {
            return Err(PipelineError::internal(
                CREW_OPERATION,
                "crew returned an unexpected number of outputs",
            ));
        };

        let product = parse_lenient::<ProductRecord>(&scrape.raw);
        let product_issues = guardrails::check_product(&product.clone().unwrap_or_default());
        guardrails::report(SCRAPE, &product_issues);
        stages.push(crew_report(
            scrape,
            json!({
                "raw": scrape.raw,
                "parsed": product,
                "guardrail_issues": product_issues,
            }),
        ));

        let research_report = parse_lenient::<ResearchReport>(&research.raw);
        if research_report.is_none() {
            warn!(target = "listing.crew", stage = RESEARCH, "research_unparsed");
        }
        stages.push(crew_report(
            research,
            json!({
                "raw": research.raw,
                "parsed": research_report,
                "keywords": research_report
                    .as_ref()
                    .map(ResearchReport::all_keywords)
                    .unwrap_or_default(),
            }),
        ));

        stages.push(crew_report(write, json!({ "raw": write.raw })));

        let output = self
            .capture_stage("extract_listing", &mut stages, async {
                let output = extract_listing(&write.raw);
                let issues: Vec<GuardrailIssue> = match output.copy() {
                    Some(copy) => guardrails::check_listing(copy),
                    None => {
                        warn!(
                            target = "listing.crew",
                            url = %url,
                            "final_output_fell_back_to_raw"
                        );
                        Vec::new()
                    }
                };
                guardrails::report(WRITE, &issues);
                let report = json!({
                    "structured": !output.is_fallback(),
                    "guardrail_issues": issues,
                });
                Ok(StageOutcome::new(output, report))
            })
            .await?;

        Ok(ListingResponse {
            listing_id: Uuid::new_v4().to_string(),
            url,
            output,
            product,
            research: research_report,
            attempts,
            stages,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn crew_report(output: &StageOutput, body: Value) -> StageReport {
    crate::metrics::stage_elapsed(output.stage, output.elapsed_ms);
    StageReport::new(output.stage, output.elapsed_ms, body)
}

fn verify_outputs(specs: &[StageSpec], outputs: &[StageOutput]) -> Result<(), PipelineError> {
    let expected: Vec<_> = specs.iter().map(|spec| spec.name).collect();
    let actual: Vec<_> = outputs.iter().map(|output| output.stage).collect();
    if expected != actual {
        return Err(PipelineError::internal(
            CREW_OPERATION,
            format!("expected stage outputs {expected:?}, got {actual:?}"),
        ));
    }
    Ok(())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    RetriesExhausted,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    fn from_retry(err: RetryError<CrewError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => Self {
                stage: last.stage(),
                message: format!("rate limited on all {attempts} attempts: {last}"),
                kind: PipelineErrorKind::RetriesExhausted,
            },
            RetryError::Aborted(err) => Self::internal(err.stage(), err.to_string()),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::crew::{CrewContext, CrewError, StageExecutor, StageOutput, StageSpec};
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    pub enum Step {
        Reply(Vec<&'static str>),
        RateLimited,
        Fail(&'static str),
    }

    /// Executor that plays back one [`Step`] per call.
    pub struct ScriptedExecutor {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
                urls: Mutex::default(),
            }
        }

        pub fn succeeding(outputs: Vec<&'static str>) -> Self {
            Self::new(vec![Step::Reply(outputs)])
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            stages: &[StageSpec],
            context: &CrewContext,
        ) -> Result<Vec<StageOutput>, CrewError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(context.url.clone());
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(raws)) => Ok(stages
                    .iter()
                    .zip(raws)
                    .map(|(spec, raw)| StageOutput {
                        stage: spec.name,
                        raw: raw.to_string(),
                        elapsed_ms: 1,
                    })
                    .collect()),
                Some(Step::RateLimited) | None => Err(CrewError::RateLimited {
                    stage: stages[0].name,
                    retry_after: None,
                }),
                Some(Step::Fail(message)) => Err(CrewError::Stage {
                    stage: stages[0].name,
                    message: message.to_string(),
                }),
            }
        }
    }

    pub const PRODUCT_JSON: &str = r#"{"title": "Knee Strap", "color": "N/A"}"#;
    pub const RESEARCH_JSON: &str = r#"{"product_keywords": ["knee strap", "patella"]}"#;
    pub const LISTING_JSON: &str = r#"{"title": "T", "description": "D"}"#;
}

#[cfg(test)]
mod tests {
    use super::testing::{LISTING_JSON, PRODUCT_JSON, RESEARCH_JSON, ScriptedExecutor, Step};
    use super::*;
    use crate::crew::ListingCopy;
    use crate::crew::retry::testing::RecordingSleeper;
    use std::time::Duration;

    fn pipeline(executor: Arc<ScriptedExecutor>, sleeper: Arc<RecordingSleeper>) -> Pipeline {
        Pipeline::with_executor(executor, sleeper, RetryPolicy::default())
    }

    #[tokio::test]
    async fn run_produces_transcript_in_stage_order() {
        let executor = Arc::new(ScriptedExecutor::succeeding(vec![
            PRODUCT_JSON,
            RESEARCH_JSON,
            LISTING_JSON,
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let response = pipeline(executor.clone(), sleeper.clone())
            .run("example.com/product")
            .await
            .expect("pipeline run");

        assert_eq!(response.url, "https://example.com/product");
        assert_eq!(executor.urls(), vec!["https://example.com/product"]);
        let names: Vec<_> = response.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["normalize_url", "scrape", "research", "write", "extract_listing"]
        );
        assert_eq!(
            response.output,
            ListingOutput::Structured(ListingCopy {
                title: "T".into(),
                description: "D".into(),
            })
        );
        let product = response.product.expect("parsed product");
        assert_eq!(product.title.as_deref(), Some("Knee Strap"));
        assert_eq!(product.color, None);
        assert_eq!(response.attempts, 1);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_the_crew_runs() {
        let executor = Arc::new(ScriptedExecutor::succeeding(vec![
            PRODUCT_JSON,
            RESEARCH_JSON,
            LISTING_JSON,
        ]));
        let err = pipeline(executor.clone(), Arc::new(RecordingSleeper::default()))
            .run("   ")
            .await
            .expect_err("empty url");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.stage(), "normalize_url");
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn recovers_after_rate_limits_with_backoff() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Step::RateLimited,
            Step::RateLimited,
            Step::Reply(vec![PRODUCT_JSON, RESEARCH_JSON, LISTING_JSON]),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let response = pipeline(executor.clone(), sleeper.clone())
            .run("https://example.com/product")
            .await
            .expect("recovers");
        assert_eq!(response.attempts, 3);
        assert_eq!(executor.calls(), 3);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
    }

    #[tokio::test]
    async fn persistent_rate_limit_exhausts_retries() {
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let err = pipeline(executor.clone(), sleeper.clone())
            .run("https://example.com/product")
            .await
            .expect_err("exhausted");
        assert_eq!(err.kind(), PipelineErrorKind::RetriesExhausted);
        assert_eq!(executor.calls(), 3);
        assert_eq!(sleeper.recorded().len(), 2);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let executor = Arc::new(ScriptedExecutor::new(vec![Step::Fail("tool exploded")]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let err = pipeline(executor.clone(), sleeper.clone())
            .run("https://example.com/product")
            .await
            .expect_err("aborted");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        assert!(err.detail().contains("tool exploded"));
        assert_eq!(executor.calls(), 1);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn unparseable_final_output_is_returned_raw() {
        let executor = Arc::new(ScriptedExecutor::succeeding(vec![
            PRODUCT_JSON,
            RESEARCH_JSON,
            "Here is your listing!",
        ]));
        let output = pipeline(executor, Arc::new(RecordingSleeper::default()))
            .generate_listing("https://example.com/product")
            .await
            .expect("pipeline run");
        assert_eq!(
            output,
            ListingOutput::Raw {
                raw_output: "Here is your listing!".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_stage_output_is_internal_error() {
        let executor = Arc::new(ScriptedExecutor::succeeding(vec![PRODUCT_JSON, RESEARCH_JSON]));
        let err = pipeline(executor, Arc::new(RecordingSleeper::default()))
            .run("https://example.com/product")
            .await
            .expect_err("short transcript");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        assert_eq!(err.stage(), CREW_OPERATION);
    }

    #[tokio::test]
    async fn guardrail_findings_are_reported_not_fatal() {
        let executor =
            Arc::new(ScriptedExecutor::succeeding(vec!["{}", RESEARCH_JSON, LISTING_JSON]));
        let response = pipeline(executor, Arc::new(RecordingSleeper::default()))
            .run("https://example.com/product")
            .await
            .expect("advisory guardrails");
        let scrape = &response.stages[1];
        assert_eq!(scrape.output["guardrail_issues"][0]["field"], "product");
        let extract = &response.stages[4];
        assert_eq!(extract.output["structured"], true);
        assert!(
            extract.output["guardrail_issues"]
                .as_array()
                .is_some_and(|issues| !issues.is_empty())
        );
    }
}
