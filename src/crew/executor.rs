use super::extract::parse_lenient;
use super::schema::ProductRecord;
use super::{CrewContext, CrewError, StageExecutor, StageOutput, StageSpec};
use crate::llm::{ChatModel, ChatOptions, LlmMessage};
use crate::tools::{ScrapedPage, ToolKind, Toolbox};
use async_trait::async_trait;
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

const SEARCH_QUERY_CHARS: usize = 120;

/// Runs stages one after another against a chat model. Each stage sees the
/// raw output of the stage right before it and nothing older.
#[derive(Clone)]
pub struct SequentialExecutor {
    model: Arc<dyn ChatModel>,
    tools: Toolbox,
}

impl SequentialExecutor {
    pub fn new(model: Arc<dyn ChatModel>, tools: Toolbox) -> Self {
        Self { model, tools }
    }

    async fn run_tools(
        &self,
        spec: &StageSpec,
        context: &CrewContext,
        previous: Option<&str>,
    ) -> Vec<String> {
        let mut sections = Vec::new();
        let mut scraped: Option<ScrapedPage> = None;

        if spec.tools.contains(&ToolKind::ScrapePage)
            && let Some(scraper) = &self.tools.page
        {
            match scraper.fetch(&context.url).await {
                Ok(page) => {
                    match serde_json::to_string_pretty(&page) {
                        Ok(json) => sections.push(format!("Scraped page content:\n{json}")),
                        Err(err) => {
                            warn!(target = "listing.tools", error = %err, "scrape_encode_failed")
                        }
                    }
                    scraped = Some(page);
                }
                Err(err) => warn!(
                    target = "listing.tools",
                    stage = spec.name,
                    url = %context.url,
                    error = %err,
                    "scrape_tool_failed"
                ),
            }
        }

        if spec.tools.contains(&ToolKind::WebSearch)
            && let Some(search) = &self.tools.search
            && let Some(query) = search_query(previous, scraped.as_ref())
        {
            match search.search(&query).await {
                Ok(hits) if !hits.is_empty() => {
                    let listing = hits
                        .iter()
                        .map(|hit| format!("- {} ({})\n  {}", hit.title, hit.link, hit.snippet))
                        .collect::<Vec<_>>()
                        .join("\n");
                    sections.push(format!("Search results for \"{query}\":\n{listing}"));
                }
                Ok(_) => info!(
                    target = "listing.tools",
                    stage = spec.name,
                    query = %query,
                    "search_no_results"
                ),
                Err(err) => warn!(
                    target = "listing.tools",
                    stage = spec.name,
                    query = %query,
                    error = %err,
                    "search_tool_failed"
                ),
            }
        }

        sections
    }
}

#[async_trait]
impl StageExecutor for SequentialExecutor {
    async fn execute(
        &self,
        stages: &[StageSpec],
        context: &CrewContext,
    ) -> Result<Vec<StageOutput>, CrewError> {
        let mut outputs: Vec<StageOutput> = Vec::with_capacity(stages.len());

        for spec in stages {
            let started = Instant::now();
            let previous = outputs.last().map(|output| output.raw.as_str());
            let tool_sections = self.run_tools(spec, context, previous).await;
            let messages = build_messages(spec, context, previous, &tool_sections);

            info!(
                target = "listing.crew",
                stage = spec.name,
                role = spec.agent.role,
                tool_sections = tool_sections.len(),
                "stage_started"
            );
            let response = self
                .model
                .chat(
                    &messages,
                    ChatOptions {
                        temperature: spec.agent.temperature,
                    },
                )
                .await
                .map_err(|err| CrewError::from_llm(spec.name, err))?;

            let raw = response.text.trim().to_string();
            if raw.is_empty() {
                return Err(CrewError::Stage {
                    stage: spec.name,
                    message: "model returned an empty response".into(),
                });
            }
            if let Some(usage) = &response.usage {
                debug!(
                    target = "listing.llm",
                    stage = spec.name,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "stage_token_usage"
                );
            }
            let elapsed_ms = started.elapsed().as_millis();
            info!(
                target = "listing.crew",
                stage = spec.name,
                elapsed_ms = elapsed_ms as u64,
                chars = raw.len(),
                "stage_completed"
            );
            outputs.push(StageOutput {
                stage: spec.name,
                raw,
                elapsed_ms,
            });
        }

        Ok(outputs)
    }
}

fn build_messages(
    spec: &StageSpec,
    context: &CrewContext,
    previous: Option<&str>,
    tool_sections: &[String],
) -> Vec<LlmMessage> {
    let system = format!(
        "You are the {}.\n{}\nYour goal: {}",
        spec.agent.role, spec.agent.backstory, spec.agent.goal
    );

    let mut user = spec.render_instruction(context);
    for section in tool_sections {
        user.push_str("\n\n");
        user.push_str(section);
    }
    if let Some(previous) = previous {
        user.push_str("\n\nContext from the previous task:\n");
        user.push_str(previous);
    }
    user.push_str("\n\nExpected output:\n");
    user.push_str(spec.expected_output);

    vec![LlmMessage::system(system), LlmMessage::user(user)]
}

/// Product title to search for: the previous stage's record if it has one,
/// then the page scraped in this stage.
fn search_query(previous: Option<&str>, scraped: Option<&ScrapedPage>) -> Option<String> {
    let from_previous = previous
        .and_then(parse_lenient::<ProductRecord>)
        .and_then(|record| record.title);
    let title = from_previous.or_else(|| scraped.and_then(|page| page.title.clone()))?;
    let query: String = title.chars().take(SEARCH_QUERY_CHARS).collect();
    let query = query.trim();
    (!query.is_empty()).then(|| query.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::llm::{ChatModel, ChatOptions, LlmError, LlmMessage, LlmResponse};
    use async_trait::async_trait;
    use std::{collections::VecDeque, sync::Mutex};

    /// Replays scripted replies and records every prompt it receives.
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        prompts: Mutex<Vec<Vec<LlmMessage>>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::default(),
            }
        }

        pub fn prompts(&self) -> Vec<Vec<LlmMessage>> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(
            &self,
            messages: &[LlmMessage],
            _options: ChatOptions,
        ) -> Result<LlmResponse, LlmError> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".into())));
            reply.map(|text| LlmResponse { text, usage: None })
        }
    }
}
