//! Shapes exchanged between stages.
//!
//! The model writes free text that is *supposed* to be JSON of these shapes.
//! Intermediate shapes decode leniently (bad fields become empty); the final
//! [`ListingCopy`] decodes strictly, see [`super::extract`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{DefaultOnError, OneOrMany, formats::PreferMany, serde_as, skip_serializing_none};

const PLACEHOLDERS: &[&str] = &[
    "",
    "n/a",
    "na",
    "null",
    "none",
    "not available",
    "unknown",
    "not specified",
    "-",
    "...",
];

/// What the scrape stage found on the page. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductRecord {
    #[serde(default, deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub color: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub count: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub product_type: Option<String>,
}

impl ProductRecord {
    pub fn is_blank(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.color.is_none()
            && self.size.is_none()
            && self.count.is_none()
            && self.product_type.is_none()
    }
}

#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResearchReport {
    #[serde_as(as = "DefaultOnError<OneOrMany<_, PreferMany>>")]
    #[serde(default)]
    pub product_keywords: Vec<String>,
    #[serde_as(as = "DefaultOnError<OneOrMany<_, PreferMany>>")]
    #[serde(default)]
    pub key_features: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub target_audience: Option<String>,
    #[serde_as(as = "DefaultOnError<OneOrMany<_, PreferMany>>")]
    #[serde(default)]
    pub competitors: Vec<String>,
    #[serde_as(as = "DefaultOnError<OneOrMany<_, PreferMany>>")]
    #[serde(default)]
    pub trending_keywords: Vec<String>,
    #[serde_as(as = "DefaultOnError<OneOrMany<_, PreferMany>>")]
    #[serde(default)]
    pub competitor_keywords: Vec<String>,
    #[serde_as(as = "DefaultOnError<OneOrMany<_, PreferMany>>")]
    #[serde(default)]
    pub audience_keywords: Vec<String>,
}

impl ResearchReport {
    /// Every keyword in the report, first occurrence wins, case-insensitive.
    pub fn all_keywords(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.product_keywords
            .iter()
            .chain(&self.trending_keywords)
            .chain(&self.competitor_keywords)
            .chain(&self.audience_keywords)
            .map(|keyword| keyword.trim())
            .filter(|keyword| !keyword.is_empty())
            .filter(|keyword| seen.insert(keyword.to_lowercase()))
            .map(str::to_string)
            .collect()
    }
}

/// The final title/description pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingCopy {
    pub title: String,
    pub description: String,
}

/// Final artifact of a run: structured copy, or the raw text when the model
/// did not produce parseable JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListingOutput {
    Structured(ListingCopy),
    Raw { raw_output: String },
}

impl ListingOutput {
    pub fn is_fallback(&self) -> bool {
        matches!(self, ListingOutput::Raw { .. })
    }

    pub fn copy(&self) -> Option<&ListingCopy> {
        match self {
            ListingOutput::Structured(copy) => Some(copy),
            ListingOutput::Raw { .. } => None,
        }
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(text_from_value(&value))
}

fn text_from_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(text_from_value)
            .collect::<Vec<_>>()
            .join("; "),
        Value::Null | Value::Object(_) => return None,
    };
    if PLACEHOLDERS.contains(&text.to_lowercase().as_str()) {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn product_record_reads_placeholders_as_missing() {
        let record: ProductRecord = serde_json::from_value(json!({
            "title": "Knee Strap",
            "description": ["Relieves pain", "", "Adjustable"],
            "color": "N/A",
            "size": null,
            "count": 2,
            "product_type": {"nested": true}
        }))
        .unwrap();
        assert_eq!(record.title.as_deref(), Some("Knee Strap"));
        assert_eq!(record.description.as_deref(), Some("Relieves pain; Adjustable"));
        assert_eq!(record.color, None);
        assert_eq!(record.size, None);
        assert_eq!(record.count.as_deref(), Some("2"));
        assert_eq!(record.product_type, None);
        assert_eq!(record.category, None);
    }

    #[test]
    fn product_record_serializes_missing_as_null() {
        let value = serde_json::to_value(ProductRecord::default()).unwrap();
        assert_eq!(value["title"], Value::Null);
        assert!(ProductRecord::default().is_blank());
    }

    #[test]
    fn research_report_accepts_single_strings_and_bad_types() {
        let report: ResearchReport = serde_json::from_value(json!({
            "product_keywords": "knee brace",
            "key_features": ["adjustable", "breathable"],
            "target_audience": "runners",
            "competitors": 42,
            "trending_keywords": ["Knee Brace", "patella strap"]
        }))
        .unwrap();
        assert_eq!(report.product_keywords, vec!["knee brace"]);
        assert_eq!(report.key_features.len(), 2);
        assert!(report.competitors.is_empty());
        assert!(report.audience_keywords.is_empty());
        assert_eq!(report.all_keywords(), vec!["knee brace", "patella strap"]);
    }

    #[test]
    fn listing_output_wire_shapes() {
        let structured = ListingOutput::Structured(ListingCopy {
            title: "T".into(),
            description: "D".into(),
        });
        assert_eq!(
            serde_json::to_value(&structured).unwrap(),
            json!({"title": "T", "description": "D"})
        );
        let raw = ListingOutput::Raw {
            raw_output: "oops".into(),
        };
        assert_eq!(serde_json::to_value(&raw).unwrap(), json!({"raw_output": "oops"}));
        let back: ListingOutput = serde_json::from_value(json!({"raw_output": "oops"})).unwrap();
        assert!(back.is_fallback());
        assert!(back.copy().is_none());
    }
}
