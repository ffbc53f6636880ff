//! Advisory checks on stage outputs. Findings are logged and reported in the
//! stage transcript; they never fail a run.

use super::schema::{ListingCopy, ProductRecord};
use serde::Serialize;
use tracing::warn;

pub const TITLE_CHARS: usize = 80;
pub const MAX_DESCRIPTION_WORDS: usize = 400;
pub const DESCRIPTION_PARAGRAPHS: usize = 4;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GuardrailIssue {
    pub field: &'static str,
    pub message: String,
}

impl GuardrailIssue {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn check_product(record: &ProductRecord) -> Vec<GuardrailIssue> {
    let mut issues = Vec::new();
    if record.is_blank() {
        issues.push(GuardrailIssue::new("product", "no product fields were extracted"));
    } else if record.title.is_none() {
        issues.push(GuardrailIssue::new("title", "product title missing"));
    }
    issues
}

pub fn check_listing(copy: &ListingCopy) -> Vec<GuardrailIssue> {
    let mut issues = Vec::new();

    let title_chars = copy.title.chars().count();
    if title_chars != TITLE_CHARS {
        issues.push(GuardrailIssue::new(
            "title",
            format!("title has {title_chars} characters, expected {TITLE_CHARS}"),
        ));
    }

    let words = copy.description.split_whitespace().count();
    if words > MAX_DESCRIPTION_WORDS {
        issues.push(GuardrailIssue::new(
            "description",
            format!("description has {words} words, limit is {MAX_DESCRIPTION_WORDS}"),
        ));
    }

    let paragraphs = paragraph_count(&copy.description);
    if paragraphs != DESCRIPTION_PARAGRAPHS {
        issues.push(GuardrailIssue::new(
            "description",
            format!("description has {paragraphs} paragraphs, expected {DESCRIPTION_PARAGRAPHS}"),
        ));
    }

    issues
}

pub fn report(stage: &'static str, issues: &[GuardrailIssue]) {
    for issue in issues {
        warn!(
            target = "listing.crew",
            stage,
            field = issue.field,
            message = %issue.message,
            "guardrail_issue"
        );
    }
}

fn paragraph_count(text: &str) -> usize {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .count()
}
