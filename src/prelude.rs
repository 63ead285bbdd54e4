//! Convenient re-exports for the reliability layer and the pipeline built on
//! top of it.
pub use crate::{
    bulkhead::{BulkheadError, BulkheadPolicy},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    clock::{Clock, ManualClock, MonotonicClock},
    error::{ClassifiedError, CollabError, ErrorClass, ResilienceError, Severity},
    pipeline::{CancellationToken, EmailOutcome, Pipeline, PipelineController, SkipReason, Stage},
    provider_adapter::ProviderAdapter,
    provider_orchestrator::{ProviderEntry, ProviderOrchestrator},
    rate_limit::{store::InMemoryTokenStore, strategies::{Adaptive, TokenBucket}},
    retry_executor::{Backoff, InstantSleeper, Jitter, RetryConfig, RetryExecutor, Sleeper, TokioSleeper, TrackingSleeper},
    stack::ResiliencePipeline,
    telemetry::{JsonlSink, NoopSink, TelemetryEvent, TelemetrySink},
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
};
