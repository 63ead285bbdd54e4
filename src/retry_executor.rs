//! Retry with exponential backoff, jitter, and `Retry-After` honoring.
//!
//! `RetryExecutor` is the single place in the crate that decides whether to
//! retry a failed external call. Every adapter, the knowledge-base client,
//! and the mail source client run their calls through one of these,
//! configured per service via [`crate::presets`].
//!
//! `Backoff`, `Jitter`, and the `Sleeper` abstraction live in this module
//! rather than as standalone files: `RetryExecutor` is their only consumer,
//! and none of the three carries enough independent surface area to justify
//! its own module.

use crate::error::{ClassifiedError, ResilienceError, MAX_RETRY_FAILURES};
use crate::telemetry::{NoopSink, TelemetryEvent, TelemetrySink};
use crate::timeout::TimeoutPolicy;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backoff strategy for retries. `Exponential` implements the doubling rule
/// every external-service retry config in this crate uses:
/// `min(max, base * 2^(attempt-1))`.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// Linearly increasing delay
    Linear { base: Duration },
    /// Exponentially increasing delay with optional cap
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create a linear backoff strategy
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Create an exponential backoff strategy
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Set a maximum delay for exponential backoff
    pub fn with_max(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => {
                // Use checked_mul to prevent overflow
                base.checked_mul(attempt as u32).unwrap_or(Duration::from_secs(u64::MAX))
            }
            Backoff::Exponential { base, max } => {
                // Calculate 2^(attempt-1) with overflow protection
                let exponent = (attempt.saturating_sub(1)) as u32;
                let multiplier = 2u32.saturating_pow(exponent);

                let exp_delay = base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX));

                if let Some(max) = max {
                    exp_delay.min(*max)
                } else {
                    exp_delay
                }
            }
        }
    }
}

/// Jitter strategy for randomizing retry delays. `RetryExecutor` always uses
/// `Jitter::Full` with `delay = jitter_max`, matching the `U(0, jitter_max)`
/// contract each provider's retry config specifies; `Equal` and
/// `Decorrelated` remain available for callers that want a different shape.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Full jitter: random between 0 and delay
    Full,
    /// Equal jitter: random between delay/2 and delay
    Equal,
    /// Decorrelated jitter: AWS-style with state
    Decorrelated { base: Duration, max: Duration },
}

impl Jitter {
    /// Create a full jitter strategy
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Create an equal jitter strategy
    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Create a decorrelated jitter strategy
    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        Jitter::Decorrelated { base, max }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let jittered = rand::thread_rng().gen_range(0..=millis);
                Duration::from_millis(jittered)
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                let jittered = rand::thread_rng().gen_range(half..=millis);
                Duration::from_millis(jittered)
            }
            Jitter::Decorrelated { base, max } => {
                // Decorrelated jitter: sleep = min(cap, random(base, sleep * 3))
                // For simplicity, we use the delay as previous sleep
                let base_millis = base.as_millis() as u64;
                let delay_millis = delay.as_millis() as u64;
                let max_millis = max.as_millis() as u64;

                let upper = delay_millis.saturating_mul(3);
                let range_max = upper.min(max_millis);

                if base_millis >= range_max {
                    return Duration::from_millis(base_millis);
                }

                let jittered = rand::thread_rng().gen_range(base_millis..=range_max);
                Duration::from_millis(jittered)
            }
        }
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let jittered = rng.gen_range(0..=millis);
                Duration::from_millis(jittered)
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                let jittered = rng.gen_range(half..=millis);
                Duration::from_millis(jittered)
            }
            Jitter::Decorrelated { base, max } => {
                let base_millis = base.as_millis() as u64;
                let delay_millis = delay.as_millis() as u64;
                let max_millis = max.as_millis() as u64;

                let upper = delay_millis.saturating_mul(3);
                let range_max = upper.min(max_millis);

                if base_millis >= range_max {
                    return Duration::from_millis(base_millis);
                }

                let jittered = rng.gen_range(base_millis..=range_max);
                Duration::from_millis(jittered)
            }
        }
    }
}

/// Abstraction for sleeping/waiting between retry attempts. Enables fast,
/// deterministic tests of `RetryExecutor` backoff behavior without real time
/// delays.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        // no-op
    }
}

/// Test sleeper that tracks all sleep calls
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Number of recorded sleep calls.
    pub fn calls(&self) -> usize {
        self.calls.lock().expect("TrackingSleeper.calls: mutex poisoned").len()
    }

    /// Get a recorded call duration by index, if present.
    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.calls.lock().expect("TrackingSleeper.call_at: mutex poisoned").get(index).copied()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("TrackingSleeper.clear: mutex poisoned").clear();
    }
}
#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}

/// Per-service retry configuration.
#[derive(Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub backoff: Backoff,
    pub jitter_max: Duration,
    pub per_attempt_timeout: Duration,
    pub respect_retry_after: bool,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("jitter_max", &self.jitter_max)
            .field("per_attempt_timeout", &self.per_attempt_timeout)
            .field("respect_retry_after", &self.respect_retry_after)
            .finish()
    }
}

impl RetryConfig {
    pub fn new(max_attempts: usize, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::exponential(base_backoff).with_max(max_backoff),
            jitter_max: Duration::from_millis(250),
            per_attempt_timeout: Duration::from_secs(30),
            respect_retry_after: true,
            sleeper: Arc::new(TokioSleeper),
            telemetry: Arc::new(NoopSink),
        }
    }

    pub fn with_jitter_max(mut self, d: Duration) -> Self {
        self.jitter_max = d;
        self
    }

    pub fn with_per_attempt_timeout(mut self, d: Duration) -> Self {
        self.per_attempt_timeout = d;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Route every `RetryAttempt`/`RetryExhausted` event through `sink`
    /// instead of the default no-op (§4.12).
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }
}

/// Executes an operation under a [`RetryConfig`], retrying only
/// [`crate::error::ErrorClass::Transient`] failures.
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    service: &'static str,
}

impl RetryExecutor {
    pub fn new(service: &'static str, config: RetryConfig) -> Self {
        Self { config, service }
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<ClassifiedError>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures: Vec<ClassifiedError> = Vec::new();
        let timeout = TimeoutPolicy::new(self.config.per_attempt_timeout)
            .unwrap_or_else(|_| TimeoutPolicy::new(Duration::from_secs(30)).expect("30s is always valid"));

        for attempt in 0..self.config.max_attempts {
            let attempt_no = attempt + 1;
            let outcome = timeout.execute(|| async { operation().await.map_err(ResilienceError::Inner) }).await;

            let err = match outcome {
                Ok(value) => {
                    tracing::debug!(service = self.service, attempt = attempt_no, "retry executor: success");
                    return Ok(value);
                }
                Err(ResilienceError::Timeout { elapsed, timeout }) => {
                    ClassifiedError::transient(format!("attempt timed out after {:?} (limit {:?})", elapsed, timeout))
                }
                Err(ResilienceError::Inner(e)) => e,
                Err(other) => return Err(other),
            };

            tracing::warn!(
                service = self.service,
                attempt = attempt_no,
                class = %err.class,
                message = %err.message,
                "retry executor: attempt failed"
            );

            if !err.class.is_retryable() {
                return Err(ResilienceError::Inner(err));
            }

            let retry_after = err.retry_after;
            failures.push(err);
            if failures.len() > MAX_RETRY_FAILURES {
                let excess = failures.len() - MAX_RETRY_FAILURES;
                failures.drain(0..excess);
            }

            if attempt_no >= self.config.max_attempts {
                self.config
                    .telemetry
                    .record(TelemetryEvent::RetryExhausted { provider: self.service.to_string(), attempts: self.config.max_attempts as u32 })
                    .await;
                return Err(ResilienceError::RetryExhausted { attempts: self.config.max_attempts, failures });
            }

            // Backoff floor, raised to the vendor's Retry-After hint if present,
            // plus full jitter over [0, jitter_max].
            let mut floor = self.config.backoff.delay(attempt_no);
            if self.config.respect_retry_after {
                if let Some(hint) = retry_after {
                    floor = floor.max(hint);
                }
            }
            let delay = floor + Jitter::Full.apply(self.config.jitter_max);

            self.config
                .telemetry
                .record(TelemetryEvent::RetryAttempt { provider: self.service.to_string(), attempt: attempt_no as u32, delay_ms: delay.as_millis() })
                .await;
            self.config.sleeper.sleep(delay).await;
        }

        unreachable!("retry loop always returns within max_attempts iterations")
    }
}


#[cfg(test)]
mod jitter_tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let jitter = Jitter::None;
        let delay = Duration::from_secs(1);
        assert_eq!(jitter.apply(delay), delay);
    }

    #[test]
    fn full_jitter_is_between_zero_and_delay() {
        let jitter = Jitter::full();
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered <= delay);
            assert!(jittered >= Duration::from_millis(0));
        }
    }

    #[test]
    fn equal_jitter_is_between_half_and_delay() {
        let jitter = Jitter::equal();
        let delay = Duration::from_secs(1);
        let half = Duration::from_millis(500);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered <= delay);
            assert!(jittered >= half);
        }
    }

    #[test]
    fn full_jitter_with_deterministic_rng() {
        let jitter = Jitter::full();
        let delay = Duration::from_millis(1000);
        let mut rng = StdRng::seed_from_u64(42);

        let jittered = jitter.apply_with_rng(delay, &mut rng);
        assert!(jittered <= delay);
        assert!(jittered < Duration::from_millis(1000));
    }

    #[test]
    fn equal_jitter_with_deterministic_rng() {
        let jitter = Jitter::equal();
        let delay = Duration::from_millis(1000);
        let mut rng = StdRng::seed_from_u64(42);

        let jittered = jitter.apply_with_rng(delay, &mut rng);
        assert!(jittered >= Duration::from_millis(500));
        assert!(jittered <= delay);
    }

    #[test]
    fn decorrelated_jitter_respects_bounds() {
        let jitter = Jitter::decorrelated(Duration::from_millis(100), Duration::from_secs(10));
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(100));
            assert!(jittered <= Duration::from_secs(10));
        }
    }

    #[test]
    fn jitter_handles_zero_delay() {
        assert_eq!(Jitter::full().apply(Duration::from_millis(0)), Duration::from_millis(0));
        assert_eq!(Jitter::equal().apply(Duration::from_millis(0)), Duration::from_millis(0));
    }

    #[test]
    fn decorrelated_jitter_caps_at_max() {
        let jitter = Jitter::decorrelated(Duration::from_secs(1), Duration::from_secs(5));
        let huge_delay = Duration::from_secs(100);
        for _ in 0..50 {
            let jittered = jitter.apply(huge_delay);
            assert!(jittered <= Duration::from_secs(5));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let exec = RetryExecutor::new("kb", RetryConfig::new(3, Duration::from_millis(10), Duration::from_secs(1)));
        let result = exec.execute(|| async { Ok::<_, ClassifiedError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let sleeper = TrackingSleeper::new();
        let config = RetryConfig::new(3, Duration::from_millis(10), Duration::from_secs(1)).with_sleeper(sleeper.clone());
        let exec = RetryExecutor::new("claude", config);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = exec
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ClassifiedError::transient("429"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.calls(), 2);
    }

    #[tokio::test]
    async fn never_retries_permanent_errors() {
        let exec = RetryExecutor::new("notion", RetryConfig::new(5, Duration::from_millis(10), Duration::from_secs(1)));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = exec
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(ClassifiedError::permanent("bad request"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "permanent errors are attempted exactly once");
    }

    #[tokio::test]
    async fn never_retries_critical_errors() {
        let exec = RetryExecutor::new("mail", RetryConfig::new(5, Duration::from_millis(10), Duration::from_secs(1)));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let _ = exec
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(ClassifiedError::critical("unauthorized"))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let sleeper = TrackingSleeper::new();
        let config = RetryConfig::new(3, Duration::from_millis(5), Duration::from_secs(1)).with_sleeper(sleeper);
        let exec = RetryExecutor::new("gemini", config);

        let result = exec.execute(|| async { Err::<u32, _>(ClassifiedError::transient("still down")) }).await;

        match result.unwrap_err() {
            ResilienceError::RetryExhausted { attempts, failures } => {
                assert_eq!(attempts, 3);
                assert_eq!(failures.len(), 3);
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn retry_after_raises_the_delay_floor() {
        let sleeper = TrackingSleeper::new();
        let config = RetryConfig::new(2, Duration::from_millis(1), Duration::from_secs(1))
            .with_jitter_max(Duration::ZERO)
            .with_sleeper(sleeper.clone());
        let exec = RetryExecutor::new("claude", config);

        let _ = exec
            .execute(|| async { Err::<u32, _>(ClassifiedError::transient("rate limited").with_retry_after(Duration::from_millis(500))) })
            .await;

        assert_eq!(sleeper.calls(), 1);
        assert!(sleeper.call_at(0).unwrap() >= Duration::from_millis(500));
    }

    struct RecordingSink {
        events: Arc<AsyncMutex<Vec<TelemetryEvent>>>,
    }

    #[async_trait::async_trait]
    impl TelemetrySink for RecordingSink {
        async fn record(&self, event: TelemetryEvent) {
            self.events.lock().await.push(event);
        }
    }

    #[tokio::test]
    async fn emits_retry_attempt_and_retry_exhausted_events() {
        let events = Arc::new(AsyncMutex::new(Vec::new()));
        let sink: Arc<dyn TelemetrySink> = Arc::new(RecordingSink { events: events.clone() });
        let config = RetryConfig::new(2, Duration::from_millis(1), Duration::from_secs(1))
            .with_sleeper(InstantSleeper)
            .with_telemetry(sink);
        let exec = RetryExecutor::new("gemini", config);

        let _ = exec.execute(|| async { Err::<u32, _>(ClassifiedError::transient("down")) }).await;

        let recorded = events.lock().await;
        assert!(matches!(recorded[0], TelemetryEvent::RetryAttempt { attempt: 1, .. }));
        assert!(matches!(recorded[1], TelemetryEvent::RetryExhausted { attempts: 2, .. }));
    }
}
