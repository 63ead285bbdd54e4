//! Circuit breaker implementation with lock-free atomics.
//!
//! One breaker guards each external service (mail source, knowledge base,
//! each LLM vendor, secret store). `CLOSED` → `OPEN` on `failure_threshold`
//! consecutive failures; `OPEN` → `HALF_OPEN` after `recovery_timeout`
//! elapses; `HALF_OPEN` → `CLOSED` only after `required_successes` consecutive
//! probe successes (default 2), and back to `OPEN` on any probe failure.
//! [`crate::error::ErrorClass::Critical`] failures trip the breaker on the
//! first occurrence regardless of `failure_threshold`.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ClassifiedError, ResilienceError};
use crate::telemetry::{NoopSink, TelemetryEvent, TelemetrySink};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required before closing (default 2).
    pub required_successes: usize,
    pub half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            required_successes: 1,
            half_open_max_calls: usize::MAX,
        }
    }

    /// Default policy for most external services: 5 consecutive failures, 60s cooldown.
    pub fn default_service() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            required_successes: 2,
            half_open_max_calls: 1,
        }
    }

    /// Tighter policy for the secret store: 3 failures, 30s cooldown.
    pub fn secrets() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            required_successes: 2,
            half_open_max_calls: 1,
        }
    }
}

pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    half_open_successes: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

impl CircuitBreakerState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            half_open_successes: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub(crate) fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
    }
}

/// Per-service circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    pub(crate) state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    service: String,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreakerPolicy {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            required_successes: 2,
            half_open_max_calls: 1,
        })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
            service: "unknown".to_string(),
            telemetry: Arc::new(NoopSink),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Name this breaker guards, surfaced on every telemetry event it emits.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Non-blocking check: would a call be allowed right now? Used by callers
    /// that want to skip an attempt without consuming a retry slot.
    pub fn allow(&self) -> bool {
        match self.state.current_state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                self.now_millis().saturating_sub(opened_at) >= self.config.recovery_timeout.as_millis() as u64
            }
        }
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<ClassifiedError>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);
            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker -> half-open");
                                self.telemetry
                                    .record(TelemetryEvent::BreakerHalfOpen { provider: self.service.clone() })
                                    .await;
                                self.state.half_open_calls.store(1, Ordering::Release);
                                self.state.half_open_successes.store(0, Ordering::Release);
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("invalid state transition"),
                        }
                    } else {
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success().await,
            Err(e) => self.on_failure(e).await,
        }

        result.map_err(ResilienceError::Inner)
    }

    async fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes = self.state.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.required_successes {
                    if self
                        .state
                        .state
                        .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.state.failure_count.store(0, Ordering::Release);
                        self.state.half_open_successes.store(0, Ordering::Release);
                        self.state.opened_at_millis.store(0, Ordering::Release);
                        tracing::info!("circuit breaker -> closed");
                        self.telemetry
                            .record(TelemetryEvent::BreakerClosed { provider: self.service.clone() })
                            .await;
                    }
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    async fn on_failure(&self, error: &ClassifiedError) {
        let class = error.class;
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        let should_open = class.trips_breaker_immediately() || failures >= self.config.failure_threshold;

        if class.trips_breaker_immediately() {
            self.telemetry
                .record(TelemetryEvent::CriticalFailure {
                    provider: self.service.clone(),
                    message: error.message.clone(),
                })
                .await;
        }

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.half_open_successes.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: probe failed -> open");
                    self.telemetry
                        .record(TelemetryEvent::BreakerOpened {
                            provider: self.service.clone(),
                            failure_count: failures as u32,
                        })
                        .await;
                }
            }
            STATE_CLOSED if should_open => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, class = %class, "circuit breaker -> open");
                    self.telemetry
                        .record(TelemetryEvent::BreakerOpened {
                            provider: self.service.clone(),
                            failure_count: failures as u32,
                        })
                        .await;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn ok_call() -> Result<u32, ClassifiedError> {
        Ok(42)
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreakerPolicy::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::transient("boom")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn critical_failure_opens_immediately() {
        let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(60));
        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::critical("auth failed")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fails_fast_while_open() {
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(60));
        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::transient("boom")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.execute(|| ok_call()).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_cooldown() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(10)).with_clock(clock.clone());
        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::transient("boom")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(10_001);
        let result = breaker.execute(|| ok_call()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn requires_s_consecutive_successes_to_close() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(1),
            required_successes: 2,
            half_open_max_calls: 5,
        };
        let breaker = CircuitBreakerPolicy::with_config(config).with_clock(clock.clone());
        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::transient("boom")) }).await;
        clock.advance(1_001);

        let _ = breaker.execute(|| ok_call()).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen, "one success is not enough");

        let _ = breaker.execute(|| ok_call()).await;
        assert_eq!(breaker.state(), CircuitState::Closed, "second consecutive success closes");
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(1)).with_clock(clock.clone());
        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::transient("boom")) }).await;
        clock.advance(1_001);

        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::transient("still broken")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn allow_reports_false_during_open_cooldown() {
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(60));
        breaker.state.state.store(STATE_OPEN, Ordering::Release);
        breaker.state.opened_at_millis.store(0, Ordering::Release);
        assert!(!breaker.allow());
    }

    struct RecordingSink {
        events: Arc<tokio::sync::Mutex<Vec<TelemetryEvent>>>,
    }

    #[async_trait::async_trait]
    impl TelemetrySink for RecordingSink {
        async fn record(&self, event: TelemetryEvent) {
            self.events.lock().await.push(event);
        }
    }

    #[tokio::test]
    async fn emits_breaker_opened_and_half_open_and_closed_events() {
        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sink: Arc<dyn TelemetrySink> = Arc::new(RecordingSink { events: events.clone() });
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(10))
            .with_clock(clock.clone())
            .with_service("gemini")
            .with_telemetry(sink);

        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::transient("boom")) }).await;
        clock.advance(10_001);
        let _ = breaker.execute(|| ok_call()).await;
        let _ = breaker.execute(|| ok_call()).await;

        let recorded = events.lock().await;
        assert!(matches!(recorded[0], TelemetryEvent::BreakerOpened { failure_count: 1, .. }));
        assert!(matches!(recorded[1], TelemetryEvent::BreakerHalfOpen { .. }));
        assert!(matches!(recorded[2], TelemetryEvent::BreakerClosed { .. }));
        for event in recorded.iter() {
            match event {
                TelemetryEvent::BreakerOpened { provider, .. }
                | TelemetryEvent::BreakerHalfOpen { provider }
                | TelemetryEvent::BreakerClosed { provider } => assert_eq!(provider, "gemini"),
                _ => panic!("unexpected event"),
            }
        }
    }

    #[tokio::test]
    async fn emits_critical_failure_event() {
        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sink: Arc<dyn TelemetrySink> = Arc::new(RecordingSink { events: events.clone() });
        let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(60)).with_service("notion").with_telemetry(sink);

        let _ = breaker.execute::<(), _, _>(|| async { Err(ClassifiedError::critical("auth failed")) }).await;

        let recorded = events.lock().await;
        assert!(recorded.iter().any(|e| matches!(
            e,
            TelemetryEvent::CriticalFailure { provider, message } if provider == "notion" && message == "auth failed"
        )));
    }
}
