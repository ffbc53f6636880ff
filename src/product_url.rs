//! Product URL normalization.
//!
//! Users paste whatever is in their address bar, frequently without a scheme.
//! [`normalize_url`] turns that into an absolute `http(s)` URL or rejects it.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use thiserror::Error;

static SCHEME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("valid scheme regex"));

static ASIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/dp/([A-Z0-9]{10})").expect("valid asin regex"));

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid url `{input}`: {reason}")]
pub struct InvalidUrl {
    pub input: String,
    pub reason: &'static str,
}

impl InvalidUrl {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Validates `raw` and prepends `https://` when it carries no scheme.
///
/// The returned string is the trimmed input (plus scheme); it is not
/// re-serialized, so callers get back what they sent when it was already
/// absolute.
pub fn normalize_url(raw: &str) -> Result<String, InvalidUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidUrl::new(raw, "empty"));
    }

    let candidate = if SCHEME_PATTERN.is_match(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    // WHATWG parsing skips extra slashes after a special scheme and would take
    // the first path segment as the host.
    let authority = candidate.split_once("://").map(|(_, rest)| rest).unwrap_or("");
    if authority.is_empty() || authority.starts_with('/') {
        return Err(InvalidUrl::new(&candidate, "missing_host"));
    }

    let parsed = Url::parse(&candidate).map_err(|_| InvalidUrl::new(&candidate, "malformed"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(InvalidUrl::new(&candidate, "unsupported_scheme"));
    }
    match parsed.host_str() {
        Some(host) if !host.trim().is_empty() => Ok(candidate),
        _ => Err(InvalidUrl::new(&candidate, "missing_host")),
    }
}

/// Amazon product identifier (ASIN) embedded in a `/dp/<ASIN>` path.
pub fn extract_asin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if !host.to_lowercase().contains("amazon") {
        return None;
    }
    ASIN_PATTERN
        .captures(parsed.path())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Clean product URL without tracking parameters, when the identifier is known.
pub fn canonical_product_url(url: &str) -> String {
    match extract_asin(url) {
        Some(asin) => format!("https://www.amazon.com/dp/{asin}"),
        None => url.to_string(),
    }
}
