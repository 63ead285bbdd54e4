//! Per-provider health: EMA latency, success/error counts, last timestamps,
//! and the provider's circuit breaker, persisted after every mutation.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::domain::ProviderHealth;
use crate::error::CollabError;
use crate::persistence::{read_json_or_default, write_json_atomic};
use crate::telemetry::TelemetrySink;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const EMA_ALPHA: f64 = 0.2;

/// Tracks [`ProviderHealth`] for every provider, backed by a
/// [`CircuitBreakerRegistry`] for the actual state machine.
pub struct HealthTracker {
    breakers: CircuitBreakerRegistry,
    health: Mutex<HashMap<String, ProviderHealth>>,
    path: PathBuf,
}

impl HealthTracker {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        let path = data_root.as_ref().join("llm_health").join("health.json");
        let health: HashMap<String, ProviderHealth> = read_json_or_default(&path);
        Self { breakers: CircuitBreakerRegistry::new(), health: Mutex::new(health), path }
    }

    /// Like `new`, but every breaker the tracker hands out also reports to
    /// `telemetry` — wire this in whenever a run wants a JSONL audit trail
    /// of breaker transitions rather than the default no-op sink.
    pub fn with_telemetry(data_root: impl AsRef<Path>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let path = data_root.as_ref().join("llm_health").join("health.json");
        let health: HashMap<String, ProviderHealth> = read_json_or_default(&path);
        Self { breakers: CircuitBreakerRegistry::with_telemetry(telemetry), health: Mutex::new(health), path }
    }

    pub fn breaker_for(&self, provider: &str) -> CircuitBreakerPolicy {
        self.breakers.get_or_default(provider)
    }

    pub fn breaker_with_config(&self, provider: &str, config: CircuitBreakerConfig) -> CircuitBreakerPolicy {
        self.breakers.get_or_insert_with(provider, || config)
    }

    /// Would a call to `provider` be allowed right now, without consuming a retry slot?
    pub fn allow(&self, provider: &str) -> bool {
        self.breaker_for(provider).allow()
    }

    pub fn record_success(&self, provider: &str, latency_ms: f64) -> Result<(), CollabError> {
        let mut health = self.health.lock().expect("health tracker mutex poisoned");
        let entry = health.entry(provider.to_string()).or_insert_with(|| ProviderHealth::new(provider));
        entry.avg_response_ms = if entry.success_count + entry.error_count == 0 {
            latency_ms
        } else {
            EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * entry.avg_response_ms
        };
        entry.success_count += 1;
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(chrono::Utc::now());
        entry.state = self.breaker_for(provider).state().into();
        self.persist(&health)
    }

    pub fn record_failure(&self, provider: &str, error: &str) -> Result<(), CollabError> {
        let mut health = self.health.lock().expect("health tracker mutex poisoned");
        let entry = health.entry(provider.to_string()).or_insert_with(|| ProviderHealth::new(provider));
        entry.error_count += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(chrono::Utc::now());
        entry.last_error = Some(error.to_string());
        entry.state = self.breaker_for(provider).state().into();
        self.persist(&health)
    }

    pub fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.health.lock().expect("health tracker mutex poisoned").clone()
    }

    /// Breaker state for every service that has ever gone through this
    /// tracker's registry, for `llm status` / `errors list`.
    pub fn breaker_snapshot(&self) -> Vec<(String, crate::circuit_breaker::CircuitState)> {
        self.breakers.snapshot()
    }

    fn persist(&self, health: &HashMap<String, ProviderHealth>) -> Result<(), CollabError> {
        write_json_atomic(&self.path, health)
    }
}
