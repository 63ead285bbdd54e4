//! Registry of named circuit breakers: one per external service.
//!
//! The orchestrator keeps one breaker per LLM vendor; the pipeline keeps one
//! each for the mail source, knowledge base, and secret store. This registry
//! gives `llm status` / `errors list` a single place to snapshot every
//! breaker's state without threading references through every call site.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
use crate::telemetry::{NoopSink, TelemetrySink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry keyed by service id (e.g. "gemini", "notion", "mail", "secrets").
/// Every breaker created through this registry is tagged with its service id
/// and shares the registry's telemetry sink, so `llm status` / `errors list`
/// and a JSONL audit trail both see the same breaker names.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreakerPolicy>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), telemetry: Arc::new(NoopSink) }
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_telemetry(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), telemetry }
    }

    /// Get the breaker for `service`, creating one with `default_service()`
    /// config on first access.
    pub fn get_or_default(&self, service: &str) -> CircuitBreakerPolicy {
        self.get_or_insert_with(service, CircuitBreakerConfig::default_service)
    }

    pub fn get_or_insert_with(
        &self,
        service: &str,
        make_config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> CircuitBreakerPolicy {
        let mut map = self.inner.lock().expect("circuit breaker registry mutex poisoned");
        map.entry(service.to_string())
            .or_insert_with(|| {
                CircuitBreakerPolicy::with_config(make_config())
                    .with_service(service.to_string())
                    .with_telemetry(self.telemetry.clone())
            })
            .clone()
    }

    pub fn reset(&self, service: &str) -> Result<(), String> {
        let map = self.inner.lock().expect("circuit breaker registry mutex poisoned");
        match map.get(service) {
            Some(breaker) => {
                breaker.state.reset();
                Ok(())
            }
            None => Err(format!("breaker not registered: {service}")),
        }
    }

    /// Snapshot of all registered breaker states, sorted by service id.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().expect("circuit breaker registry mutex poisoned");
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
