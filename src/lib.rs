#![forbid(unsafe_code)]

//! # CollabIQ
//!
//! An email ingestion pipeline that extracts structured collaboration
//! records from inbound mail via LLM vendors, matches the named company
//! against a knowledge base, classifies the relationship, and persists an
//! idempotent row per email.
//!
//! The reliability primitives this crate is built on — retry with backoff
//! and jitter, circuit breakers, bulkheads, timeouts, and a token-bucket
//! rate limiter — guard every call this pipeline makes to an external
//! service (mail source, knowledge base, LLM vendor, secret store), so a
//! slow or flaky vendor degrades gracefully instead of stalling the whole
//! run.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use collabiq::prelude::*;
//!
//! async fn flaky_call(attempts: Arc<AtomicUsize>) -> Result<u32, ClassifiedError> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(ClassifiedError::transient("rate limited"))
//!     } else {
//!         Ok(42)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!     let pipeline = ResiliencePipeline::new(
//!         "gemini",
//!         RetryConfig::new(3, Duration::from_millis(200), Duration::from_secs(5)),
//!         CircuitBreakerPolicy::with_config(CircuitBreakerConfig::default_service()),
//!         BulkheadPolicy::new(8),
//!     );
//!
//!     let result = pipeline.execute(move || flaky_call(attempts.clone())).await;
//!     assert_eq!(result.unwrap(), 42);
//! }
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod retry_executor;
pub mod stack;
pub mod timeout;

pub mod api;
pub mod cache;
pub mod classifier;
pub mod cost_tracker;
pub mod dlq;
pub mod domain;
pub mod fuzzy_linker;
pub mod health_tracker;
pub mod idempotency;
pub mod normalizer;
pub mod persistence;
pub mod pipeline;
pub mod ports;
pub mod provider_adapter;
pub mod provider_orchestrator;
pub mod quality_tracker;
pub mod telemetry;

pub mod prelude;

pub use bulkhead::{BulkheadError, BulkheadPolicy};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ClassifiedError, CollabError, ErrorClass, ResilienceError, Severity};
pub use retry_executor::{Backoff, InstantSleeper, Jitter, RetryConfig, RetryExecutor, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::ResiliencePipeline;
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
