use crate::crew::{ListingOutput, ProductRecord, ResearchReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const BULLET_POINTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractRequest {
    pub raw: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListingResponse {
    pub listing_id: String,
    pub url: String,
    pub output: ListingOutput,
    pub product: Option<ProductRecord>,
    pub research: Option<ResearchReport>,
    pub attempts: u32,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

/// Response of the public generate endpoint. Field names follow the web
/// client's camelCase convention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTextResponse {
    pub titles: Vec<String>,
    pub description: String,
    pub bullet_points: Vec<String>,
    pub keywords_report: String,
}

impl GenerateTextResponse {
    /// `None` when the run ended with unstructured output.
    pub fn from_listing(response: &ListingResponse) -> Option<Self> {
        let copy = response.output.copy()?;
        let keywords = response
            .research
            .as_ref()
            .map(ResearchReport::all_keywords)
            .unwrap_or_default();
        let bullet_points = response
            .research
            .as_ref()
            .map(|report| {
                report
                    .key_features
                    .iter()
                    .map(|feature| feature.trim())
                    .filter(|feature| !feature.is_empty())
                    .take(BULLET_POINTS)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            titles: vec![copy.title.clone()],
            description: copy.description.clone(),
            bullet_points,
            keywords_report: keywords.join(", "),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
