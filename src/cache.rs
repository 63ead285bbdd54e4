//! File-backed TTL caches for knowledge-base lookups, and the three-tier
//! secret fallback (§6). `CachedKnowledgeBase` decorates any
//! [`KnowledgeBasePort`] the same way [`crate::stack::ResiliencePipeline`]
//! decorates a call with retry/breaker/bulkhead, rather than baking caching
//! into any one adapter. `SecretResolver` applies the fallback order a
//! caller wants for every secret lookup: the live service, then a short
//! in-process cache, then an environment file, so a transient outage in the
//! secret service never blocks a run that has a working `.env`.

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy};
use crate::error::ClassifiedError;
use crate::persistence::write_json_atomic;
use crate::ports::{KnowledgeBasePort, OnDuplicate, Record, Schema, SecretPort};
use crate::retry_executor::RetryConfig;
use crate::stack::ResiliencePipeline;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    cached_at: chrono::DateTime<chrono::Utc>,
    value: T,
}

impl<T> CacheEntry<T> {
    fn is_stale(&self, ttl: Duration) -> bool {
        match chrono::Utc::now().signed_duration_since(self.cached_at).to_std() {
            Ok(age) => age >= ttl,
            Err(_) => true, // cached_at is in the future; clock skew, treat as stale
        }
    }
}

fn read_cache<T: serde::de::DeserializeOwned>(path: &Path) -> Option<CacheEntry<T>> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Decorates a [`KnowledgeBasePort`] with file-backed caches under
/// `<data_root>/notion_cache/`: schema (default TTL 24h) and the
/// unfiltered, unlimited record listing (default TTL 6h). Filtered or
/// limited reads always go to `inner`, since a cache keyed only by `db_id`
/// can't safely serve them. Writes invalidate the data cache for that
/// `db_id` so a write is never masked by a stale read.
pub struct CachedKnowledgeBase<K> {
    inner: K,
    root: PathBuf,
    schema_ttl: Duration,
    data_ttl: Duration,
}

impl<K: KnowledgeBasePort> CachedKnowledgeBase<K> {
    pub fn new(inner: K, data_root: impl AsRef<Path>, schema_ttl: Duration, data_ttl: Duration) -> Self {
        Self { inner, root: data_root.as_ref().join("notion_cache"), schema_ttl, data_ttl }
    }

    fn schema_path(&self, db_id: &str) -> PathBuf {
        self.root.join(format!("schema_{db_id}.json"))
    }

    fn data_path(&self, db_id: &str) -> PathBuf {
        self.root.join(format!("data_{db_id}.json"))
    }

    /// Drops both the schema and data cache files for `db_id` (`notion
    /// cleanup`, §6), forcing the next read of either to go through `inner`.
    pub fn invalidate(&self, db_id: &str) {
        let _ = std::fs::remove_file(self.schema_path(db_id));
        let _ = std::fs::remove_file(self.data_path(db_id));
    }
}

#[async_trait]
impl<K: KnowledgeBasePort> KnowledgeBasePort for CachedKnowledgeBase<K> {
    async fn discover_schema(&self, db_id: &str, force_refresh: bool) -> Result<Schema, ClassifiedError> {
        let path = self.schema_path(db_id);
        if !force_refresh {
            if let Some(entry) = read_cache::<Schema>(&path) {
                if !entry.is_stale(self.schema_ttl) {
                    return Ok(entry.value);
                }
            }
        }
        let schema = self.inner.discover_schema(db_id, force_refresh).await?;
        let _ = write_json_atomic(&path, &CacheEntry { cached_at: chrono::Utc::now(), value: schema.clone() });
        Ok(schema)
    }

    async fn list_records(&self, db_id: &str, filter: Option<&str>, limit: Option<usize>) -> Result<Vec<Record>, ClassifiedError> {
        if filter.is_some() || limit.is_some() {
            return self.inner.list_records(db_id, filter, limit).await;
        }
        let path = self.data_path(db_id);
        if let Some(entry) = read_cache::<Vec<Record>>(&path) {
            if !entry.is_stale(self.data_ttl) {
                return Ok(entry.value);
            }
        }
        let records = self.inner.list_records(db_id, filter, limit).await?;
        let _ = write_json_atomic(&path, &CacheEntry { cached_at: chrono::Utc::now(), value: records.clone() });
        Ok(records)
    }

    async fn create_record(&self, db_id: &str, payload: HashMap<String, serde_json::Value>) -> Result<Record, ClassifiedError> {
        let record = self.inner.create_record(db_id, payload).await?;
        let _ = std::fs::remove_file(self.data_path(db_id));
        Ok(record)
    }

    async fn upsert_record(&self, db_id: &str, key: &str, payload: HashMap<String, serde_json::Value>, on_duplicate: OnDuplicate) -> Result<Record, ClassifiedError> {
        let record = self.inner.upsert_record(db_id, key, payload, on_duplicate).await?;
        let _ = std::fs::remove_file(self.data_path(db_id));
        Ok(record)
    }
}

struct CachedSecret {
    value: Option<String>,
    cached_at: std::time::Instant,
}

/// Three-tier secret fallback: the live [`SecretPort`], then an in-process
/// cache, then an environment file. `ttl` is clamped to `[0, 3600]` seconds
/// per §6, regardless of what a caller passes. A critical failure from the
/// service does not block startup when the env file has the key; a warning
/// is logged instead.
pub struct SecretResolver<S> {
    service: Arc<S>,
    resilience: ResiliencePipeline,
    cache: Mutex<HashMap<String, CachedSecret>>,
    ttl: Duration,
    env_file: PathBuf,
}

impl<S: SecretPort + 'static> SecretResolver<S> {
    /// The service tier runs through the tighter `CircuitBreakerConfig::secrets()`
    /// breaker (3 failures / 30s cooldown) rather than `default_service()`: a
    /// flaky secret service should fail over to the env file quickly instead
    /// of retrying for as long as an LLM vendor call would.
    pub fn new(service: S, ttl_secs: u64, env_file: impl AsRef<Path>) -> Self {
        let clamped = ttl_secs.min(3600);
        let resilience = ResiliencePipeline::new(
            "secrets",
            RetryConfig::new(2, Duration::from_millis(50), Duration::from_secs(1)),
            CircuitBreakerPolicy::with_config(CircuitBreakerConfig::secrets()),
            BulkheadPolicy::new(4),
        );
        Self {
            service: Arc::new(service),
            resilience,
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(clamped),
            env_file: env_file.as_ref().to_path_buf(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ClassifiedError> {
        if let Some(cached) = self.cache_lookup(key) {
            return Ok(cached);
        }

        let service = self.service.clone();
        let owned_key = key.to_string();
        match self.resilience.execute(move || {
            let service = service.clone();
            let owned_key = owned_key.clone();
            async move { service.get(&owned_key).await }
        }).await {
            Ok(value) => {
                self.cache_store(key, value.clone());
                Ok(value)
            }
            Err(e) => match self.read_env_file(key) {
                Some(value) => {
                    tracing::warn!(key, error = %e, "secret service failed, falling back to env file");
                    self.cache_store(key, Some(value.clone()));
                    Ok(Some(value))
                }
                None => Err(e),
            },
        }
    }

    fn cache_lookup(&self, key: &str) -> Option<Option<String>> {
        let cache = self.cache.lock().expect("secret cache mutex poisoned");
        let cached = cache.get(key)?;
        if cached.cached_at.elapsed() >= self.ttl {
            return None;
        }
        Some(cached.value.clone())
    }

    fn cache_store(&self, key: &str, value: Option<String>) {
        let mut cache = self.cache.lock().expect("secret cache mutex poisoned");
        cache.insert(key.to_string(), CachedSecret { value, cached_at: std::time::Instant::now() });
    }

    fn read_env_file(&self, key: &str) -> Option<String> {
        let contents = std::fs::read_to_string(&self.env_file).ok()?;
        contents.lines().find_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
        })
    }
}
