//! Job analysis cache.
//!
//! Keys are the sha256 of `(model, prompt version, title, truncated description)`.
//! Cache failures never fail a run: callers log them and treat them as misses.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ranking::models::JobAnalysis;

const REDIS_KEY_PREFIX: &str = "quiver:analysis:";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cached value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

pub fn cache_key(model: &str, prompt_version: &str, title: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [model, prompt_version, title, description] {
        hasher.update(part.as_bytes());
        // unit separator keeps ("ab","c") and ("a","bc") apart
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait AnalysisCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JobAnalysis>, CacheError>;
    async fn put(&self, key: &str, analysis: &JobAnalysis, ttl: Duration)
        -> Result<(), CacheError>;
}

/// In-process cache. Expired entries are dropped on read and swept on write.
#[derive(Default)]
pub struct MemoryAnalysisCache {
    entries: Mutex<HashMap<String, (Instant, JobAnalysis)>>,
}

impl MemoryAnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalysisCache for MemoryAnalysisCache {
    async fn get(&self, key: &str) -> Result<Option<JobAnalysis>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((expires_at, analysis)) if Instant::now() < *expires_at => {
                Ok(Some(analysis.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        analysis: &JobAnalysis,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        entries.insert(key.to_string(), (now + ttl, analysis.clone()));
        Ok(())
    }
}

/// Shared cache in Redis; expiry is delegated to `SET ... EX`.
pub struct RedisAnalysisCache {
    client: redis::Client,
}

impl RedisAnalysisCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnalysisCache for RedisAnalysisCache {
    async fn get(&self, key: &str) -> Result<Option<JobAnalysis>, CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("{REDIS_KEY_PREFIX}{key}"))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        analysis: &JobAnalysis,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(analysis)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("SET")
            .arg(format!("{REDIS_KEY_PREFIX}{key}"))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
