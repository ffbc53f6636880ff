//! API-key authentication and per-org request quotas.
//!
//! Each org has one token bucket. A request that starts a crew run is charged
//! `run_cost` tokens, every other protected request one token.

use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::{OriginalUri, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const KEY_HEADER: &str = "X-Listing-Key";
const FALLBACK_KEYS: &str = "local:local-key";
/// Routes whose POST kicks off the scrape, research and write crew.
const CREW_ROUTES: &[&str] = &["/api/v1/generate_text", "/listings", "/jobs/listings"];

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub org_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    quotas: Arc<OrgQuotas>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("LISTING_API_KEYS").unwrap_or_else(|_| FALLBACK_KEYS.to_string());
        Self::new(&raw, QuotaConfig::from_env())
    }

    fn new(raw_keys: &str, quota: QuotaConfig) -> Self {
        Self {
            keys: Arc::new(parse_keys(raw_keys)),
            quotas: Arc::new(OrgQuotas::new(quota)),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_keys(raw: &str) -> Self {
        Self::new(
            raw,
            QuotaConfig {
                refill_per_sec: 1000.0,
                burst: 1000.0,
                run_cost: 1.0,
            },
        )
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(presented) = presented_key(request.headers()) else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Listing-Key or Bearer token",
        );
    };
    let Some(context) = state.keys.get(&presented).cloned() else {
        return reject(StatusCode::UNAUTHORIZED, "invalid_api_key", "Key not recognized");
    };

    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let cost = state.quotas.cost_of(request.method(), &path);
    let quota = state.quotas.charge(&context.org_id, cost).await;

    if !quota.granted {
        warn!(
            target = "listing.api",
            org_id = %context.org_id,
            path = %path,
            cost,
            "org_quota_exceeded"
        );
        let mut response = reject(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Org quota exhausted, retry later",
        );
        quota.write_headers(response.headers_mut());
        return response;
    }

    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    quota.write_headers(response.headers_mut());
    response
}

fn presented_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim().to_string());
    bearer
        .or_else(|| {
            headers
                .get(KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        })
        .filter(|key| !key.is_empty())
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// `raw` is a comma separated `org:key` list. Key ids follow list position.
fn parse_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut keys = HashMap::new();
    for (idx, entry) in raw.split(',').map(str::trim).enumerate() {
        if entry.is_empty() {
            continue;
        }
        let parsed = entry
            .split_once(':')
            .map(|(org, key)| (org.trim(), key.trim()))
            .filter(|(org, key)| !org.is_empty() && !key.is_empty());
        let Some((org, key)) = parsed else {
            warn!(target = "listing.api", entry, "ignored malformed LISTING_API_KEYS entry");
            continue;
        };
        keys.insert(
            key.to_string(),
            AuthContext {
                org_id: org.to_string(),
                api_key_id: format!("key-{:02}", idx + 1),
            },
        );
    }

    if keys.is_empty() {
        warn!(
            target = "listing.api",
            "LISTING_API_KEYS produced no keys; falling back to local credentials"
        );
        return parse_keys(FALLBACK_KEYS);
    }
    info!(target = "listing.api", key_count = keys.len(), "loaded API keys");
    keys
}

#[derive(Debug, Clone, Copy)]
struct QuotaConfig {
    refill_per_sec: f64,
    burst: f64,
    run_cost: f64,
}

impl QuotaConfig {
    fn from_env() -> Self {
        let read = |key: &str, default: f64, min: f64| {
            env::var(key)
                .ok()
                .and_then(|value| value.trim().parse::<f64>().ok())
                .filter(|value| *value >= min)
                .unwrap_or(default)
        };
        Self {
            refill_per_sec: read("RATE_LIMIT_PER_SEC", 1.0, f64::MIN_POSITIVE),
            burst: read("RATE_LIMIT_CAPACITY", 10.0, 1.0),
            run_cost: read("CREW_RUN_COST", 5.0, 1.0),
        }
    }
}

struct OrgQuotas {
    config: QuotaConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Outcome of one charge against an org's bucket.
#[derive(Debug, Clone, Copy)]
struct Quota {
    granted: bool,
    limit: f64,
    remaining: f64,
    refill_per_sec: f64,
    deficit: f64,
}

impl OrgQuotas {
    fn new(mut config: QuotaConfig) -> Self {
        // A run that costs more than the bucket holds could never be granted.
        config.run_cost = config.run_cost.min(config.burst);
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn cost_of(&self, method: &Method, path: &str) -> f64 {
        if method == Method::POST && CREW_ROUTES.contains(&path) {
            self.config.run_cost
        } else {
            1.0
        }
    }

    async fn charge(&self, org_id: &str, cost: f64) -> Quota {
        let QuotaConfig {
            refill_per_sec,
            burst,
            ..
        } = self.config;
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(org_id.to_string()).or_insert(Bucket {
            tokens: burst,
            refilled_at: now,
        });

        let refill = now.duration_since(bucket.refilled_at).as_secs_f64() * refill_per_sec;
        bucket.tokens = (bucket.tokens + refill).min(burst);
        bucket.refilled_at = now;

        let granted = bucket.tokens >= cost;
        if granted {
            bucket.tokens -= cost;
        }
        Quota {
            granted,
            limit: burst,
            remaining: bucket.tokens,
            refill_per_sec,
            deficit: if granted { 0.0 } else { cost - bucket.tokens },
        }
    }
}

impl Quota {
    fn write_headers(&self, headers: &mut HeaderMap) {
        let reset = ((self.limit - self.remaining) / self.refill_per_sec).ceil().max(0.0);
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit.floor() as u64));
        headers.insert(
            "X-RateLimit-Remaining",
            HeaderValue::from(self.remaining.max(0.0).floor() as u64),
        );
        headers.insert("X-RateLimit-Reset", HeaderValue::from(reset as u64));
        if !self.granted {
            let retry_after = (self.deficit / self.refill_per_sec).ceil().max(1.0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after as u64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router, middleware,
        routing::{get, post},
    };
    use tower::ServiceExt;

    fn app(state: AuthState) -> Router {
        Router::new()
            .route("/listings", post(|| async { "run" }))
            .route("/ping", get(|| async { "pong" }))
            .route_layer(middleware::from_fn_with_state(state, require_api_auth))
    }

    fn request(method: Method, uri: &str, header: Option<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn keyed(method: Method, uri: &str) -> Request<Body> {
        request(method, uri, Some((KEY_HEADER, "secret")))
    }

    #[test]
    fn parses_org_key_pairs_and_skips_malformed() {
        let keys = parse_keys("acme:secret-1, broken ,beta:secret-2");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["secret-1"].org_id, "acme");
        assert_eq!(keys["secret-2"].api_key_id, "key-03");
        assert!(parse_keys(" , ").contains_key("local-key"));
    }

    #[tokio::test]
    async fn accepts_bearer_and_header_keys() {
        let state = AuthState::with_keys("acme:secret");
        for header in [("Authorization", "Bearer secret"), (KEY_HEADER, "secret")] {
            let response = app(state.clone())
                .oneshot(request(Method::GET, "/ping", Some(header)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().contains_key("X-RateLimit-Remaining"));
        }
    }

    #[tokio::test]
    async fn rejects_missing_and_unknown_keys() {
        let state = AuthState::with_keys("acme:secret");
        let missing = app(state.clone())
            .oneshot(request(Method::GET, "/ping", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let unknown = app(state)
            .oneshot(request(Method::GET, "/ping", Some((KEY_HEADER, "nope"))))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn crew_runs_are_charged_run_cost() {
        let state = AuthState::new(
            "acme:secret",
            QuotaConfig {
                refill_per_sec: 0.001,
                burst: 6.0,
                run_cost: 5.0,
            },
        );
        let first = app(state.clone()).oneshot(keyed(Method::POST, "/listings")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["X-RateLimit-Remaining"], "1");

        let second = app(state.clone()).oneshot(keyed(Method::POST, "/listings")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));

        let cheap = app(state).oneshot(keyed(Method::GET, "/ping")).await.unwrap();
        assert_eq!(cheap.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn orgs_have_separate_buckets() {
        let quotas = OrgQuotas::new(QuotaConfig {
            refill_per_sec: 0.001,
            burst: 2.0,
            run_cost: 10.0,
        });
        assert_eq!(quotas.cost_of(&Method::POST, "/jobs/listings"), 2.0);
        assert_eq!(quotas.cost_of(&Method::GET, "/jobs/listings"), 1.0);
        assert!(quotas.charge("acme", 2.0).await.granted);
        assert!(!quotas.charge("acme", 1.0).await.granted);
        assert!(quotas.charge("beta", 1.0).await.granted);
    }
}
