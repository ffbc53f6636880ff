use crate::config::HttpSettings;
use reqwest::Client;

/// Browser-like agent string; product pages commonly refuse the default one.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko)";

pub fn build_client(settings: &HttpSettings) -> Client {
    Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .user_agent(BROWSER_USER_AGENT)
        .gzip(true)
        .brotli(true)
        .build()
        .unwrap_or_else(|_| Client::new())
}
