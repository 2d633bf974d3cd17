use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

pub async fn redis_get<T: DeserializeOwned>(client: &redis::Client, key: &str) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "auction.upload", error = %err, "redis unavailable");
            return None;
        }
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set<T: Serialize>(client: &redis::Client, key: &str, value: &T, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

/// Replays responses for repeated `Idempotency-Key` requests. Uses Redis
/// when configured and a process-local map otherwise.
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    local: Mutex<HashMap<String, (Instant, String)>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            local: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None, DEFAULT_TTL_SECS)
    }

    pub fn backend(&self) -> &'static str {
        if self.redis.is_some() { "redis" } else { "memory" }
    }

    /// Keys are scoped per user so two sellers cannot collide.
    pub fn scoped_key(user_id: &str, key: &str) -> String {
        format!("idem:{user_id}:{key}")
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(client) = &self.redis {
            return redis_get(client, key).await;
        }
        let mut local = self.local.lock().await;
        local.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        local
            .get(key)
            .and_then(|(_, json)| serde_json::from_str(json).ok())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
        if let Some(client) = &self.redis {
            redis_set(client, key, value, self.ttl.as_secs()).await;
            return;
        }
        if let Ok(json) = serde_json::to_string(value) {
            self.local
                .lock()
                .await
                .insert(key.to_string(), (Instant::now(), json));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UploadResponse;

    #[tokio::test]
    async fn memory_cache_replays_until_expiry() {
        let cache = IdempotencyCache::in_memory();
        let key = IdempotencyCache::scoped_key("u1", "abc");
        assert_eq!(key, "idem:u1:abc");
        assert!(cache.get::<UploadResponse>(&key).await.is_none());

        let response = UploadResponse {
            listing_id: "l1".into(),
            message: "ok".into(),
            images: 2,
            documents: 0,
        };
        cache.set(&key, &response).await;
        let cached: UploadResponse = cache.get(&key).await.expect("cached");
        assert_eq!(cached.listing_id, "l1");

        let expired = IdempotencyCache::new(None, 0);
        expired.set(&key, &response).await;
        assert!(expired.get::<UploadResponse>(&key).await.is_none());
        assert_eq!(expired.backend(), "memory");
    }
}
