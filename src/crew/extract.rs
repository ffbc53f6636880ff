use super::schema::{ListingCopy, ListingOutput};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// Turns the write stage's raw text into a [`ListingOutput`].
///
/// Only a markdown fence around the JSON is tolerated; anything else that is
/// not a `{title, description}` object comes back as the raw envelope.
pub fn extract_listing(raw: &str) -> ListingOutput {
    let cleaned = strip_markdown_fence(raw);
    match decode_object::<ListingCopy>(&cleaned) {
        Ok(copy) => ListingOutput::Structured(copy),
        Err(reason) => {
            debug!(target = "listing.crew", reason = %reason, "final_output_unstructured");
            ListingOutput::Raw {
                raw_output: raw.to_string(),
            }
        }
    }
}

/// Best-effort decode of an intermediate stage's output. Accepts prose around
/// the JSON object.
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let cleaned = strip_markdown_fence(raw);
    if let Ok(value) = decode_object::<T>(&cleaned) {
        return Some(value);
    }
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    decode_object::<T>(&cleaned[start..=end]).ok()
}

/// Derived structs also deserialize from JSON arrays; only objects count here.
fn decode_object<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let value: Value = serde_json::from_str(text).map_err(|err| err.to_string())?;
    if !value.is_object() {
        return Err("expected a JSON object".into());
    }
    serde_json::from_value(value).map_err(|err| err.to_string())
}

pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}
