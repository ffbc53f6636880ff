use super::ToolError;
use crate::config::HttpSettings;
use crate::http::build_client;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";
const DEFAULT_RESULTS: u8 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

/// Web search through a Serper-compatible API.
#[derive(Clone)]
pub struct SearchClient {
    http: Client,
    api_key: String,
    endpoint: String,
}

impl SearchClient {
    pub fn new(api_key: String, http: &HttpSettings) -> Self {
        Self {
            http: build_client(http),
            api_key,
            endpoint: SERPER_ENDPOINT.to_string(),
        }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&SearchRequest {
                q: query,
                num: DEFAULT_RESULTS,
            })
            .send()
            .await
            .map_err(|err| ToolError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ToolError::Request(format!("HTTP {}", response.status())));
        }

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| ToolError::Decode(err.to_string()))?;
        Ok(payload.organic)
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    q: &'a str,
    num: u8,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic: Vec<SearchHit>,
}
