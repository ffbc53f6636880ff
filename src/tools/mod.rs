pub mod page;
pub mod search;

pub use page::{PageScraper, ScrapedPage};
pub use search::{SearchClient, SearchHit};

use crate::config::Settings;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("nothing extractable at {0}")]
    Empty(String),
}

/// Tools a stage may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ScrapePage,
    WebSearch,
}

/// The tools available to a crew run; absent tools are skipped.
#[derive(Clone, Default)]
pub struct Toolbox {
    pub page: Option<PageScraper>,
    pub search: Option<SearchClient>,
}

impl Toolbox {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            page: settings
                .scrape_enabled
                .then(|| PageScraper::new(&settings.http)),
            search: settings
                .serper_api_key
                .clone()
                .map(|key| SearchClient::new(key, &settings.http)),
        }
    }
}
