//! Replay store for `Idempotency-Key` requests. Redis when configured, an
//! in-process map otherwise.

use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

const KEY_PREFIX: &str = "listing:idem:";
const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    memory: Arc<Mutex<HashMap<String, (Instant, String)>>>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            memory: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .and_then(|url| match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(
                        target = "listing.api",
                        error = %err,
                        "invalid REDIS_URL; using memory store"
                    );
                    None
                }
            });
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_TTL_SECS);
        Self::new(redis, Duration::from_secs(ttl))
    }

    /// Keys are scoped per org so tenants cannot replay each other's results.
    pub fn scoped_key(org_id: &str, key: &str) -> String {
        format!("{KEY_PREFIX}{org_id}:{}", key.trim())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(client) = &self.redis {
            return redis_get(client, key).await;
        }
        let mut guard = self.memory.lock().await;
        let (stored_at, json) = guard.get(key)?;
        if stored_at.elapsed() < self.ttl {
            return serde_json::from_str(json).ok();
        }
        guard.remove(key);
        None
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        if let Some(client) = &self.redis {
            redis_set(client, key, value, self.ttl.as_secs()).await;
            return;
        }
        if let Ok(json) = serde_json::to_string(value) {
            let ttl = self.ttl;
            let mut guard = self.memory.lock().await;
            guard.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
            guard.insert(key.to_string(), (Instant::now(), json));
        }
    }
}

async fn redis_get<T: DeserializeOwned>(client: &redis::Client, key: &str) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "listing.api", error = %err, "redis_unavailable");
            return None;
        }
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set<T: Serialize>(client: &redis::Client, key: &str, value: &T, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GenerateTextResponse;

    fn body() -> GenerateTextResponse {
        GenerateTextResponse {
            titles: vec!["T".into()],
            description: "D".into(),
            bullet_points: Vec::new(),
            keywords_report: String::new(),
        }
    }

    #[tokio::test]
    async fn memory_store_replays_until_ttl() {
        let store = IdempotencyStore::new(None, Duration::from_secs(60));
        let key = IdempotencyStore::scoped_key("acme", "abc");
        assert!(store.get::<GenerateTextResponse>(&key).await.is_none());
        store.put(&key, &body()).await;
        assert_eq!(store.get::<GenerateTextResponse>(&key).await, Some(body()));

        let expired = IdempotencyStore::new(None, Duration::ZERO);
        expired.put(&key, &body()).await;
        assert!(expired.get::<GenerateTextResponse>(&key).await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_write() {
        let store = IdempotencyStore::new(None, Duration::ZERO);
        for n in 0..100 {
            store.put(&format!("key-{n}"), &body()).await;
        }
        assert_eq!(store.memory.lock().await.len(), 1);

        let live = IdempotencyStore::new(None, Duration::from_secs(60));
        live.put("a", &body()).await;
        live.put("b", &body()).await;
        assert_eq!(live.memory.lock().await.len(), 2);
    }

    #[test]
    fn keys_are_scoped_by_org() {
        assert_ne!(
            IdempotencyStore::scoped_key("a", "k"),
            IdempotencyStore::scoped_key("b", "k")
        );
        assert_eq!(IdempotencyStore::scoped_key("a", " k "), "listing:idem:a:k");
    }
}
