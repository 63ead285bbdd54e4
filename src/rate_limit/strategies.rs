use crate::rate_limit::store::TokenStore;
use crate::rate_limit::{Decision, RateLimiter};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Adaptive<T> gives cheap reads and controlled updates for shared config.
/// `TokenBucket` is its only consumer: it lets the knowledge-base rate limit
/// be retuned without restarting the daemon.
///
/// Default uses `ArcSwap` for lock-free reads; feature `adaptive-rwlock` can
/// switch to RwLock if desired.
#[derive(Debug)]
pub struct Adaptive<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for Adaptive<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Adaptive<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Arc::new(self.inner.read().unwrap().clone())
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap() = value;
        }
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
        T: Clone,
    {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            let cur = self.inner.load_full();
            let new_val = f(&cur);
            self.inner.store(Arc::new(new_val));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let cur = self.inner.read().unwrap().clone();
            let new_val = f(&cur);
            *self.inner.write().unwrap() = new_val;
        }
    }
}

/// A Token Bucket rate limiter.
///
/// Replenishes tokens at a fixed `rate` per second, up to `capacity`.
pub struct TokenBucket<S> {
    store: Arc<S>,
    bucket_key: String,
    rate: Adaptive<f64>,     // Tokens per second
    capacity: Adaptive<f64>, // Max tokens
}

impl<S> TokenBucket<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    /// Create a new TokenBucket backed by `store`.
    pub fn new(store: S, key: impl Into<String>, rate: f64, capacity: f64) -> Self {
        Self { store: Arc::new(store), bucket_key: key.into(), rate: Adaptive::new(rate), capacity: Adaptive::new(capacity) }
    }

    /// Retune the rate and capacity without rebuilding the bucket or
    /// disturbing whatever token count is already persisted in the store.
    pub fn retune(&self, rate: f64, capacity: f64) {
        self.rate.set(rate);
        self.capacity.set(capacity);
    }

    fn now_nanos() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
    }
}

#[async_trait]
impl<S> RateLimiter for TokenBucket<S>
where
    S: TokenStore + Send + Sync + 'static,
{
    async fn acquire(&self, permits: u32) -> Result<Decision, Box<dyn std::error::Error + Send + Sync>> {
        let now = Self::now_nanos();
        let cost = permits as f64;
        let rate = *self.rate.get();
        let capacity = *self.capacity.get();

        // Optimistic locking loop
        for _ in 0..3 {
            // Try 3 times
            let (current_tokens, last_updated) = match self.store.get_state(&self.bucket_key).await? {
                Some((t, u)) => (t, u),
                None => (capacity, now), // Initial state: full bucket
            };

            // Refill
            let elapsed_secs = (now.saturating_sub(last_updated) as f64) / 1_000_000_000.0;
            let new_tokens = (current_tokens + elapsed_secs * rate).min(capacity);

            if new_tokens >= cost {
                let final_tokens = new_tokens - cost;
                // Try to commit
                if self.store.set_state(&self.bucket_key, final_tokens, now, Some(last_updated)).await? {
                    return Ok(Decision::Allowed { remaining: final_tokens as u32, metadata: Default::default() });
                }
                // Race detected, loop again
            } else {
                // Not enough tokens. Calculate wait time.
                let missing = cost - new_tokens;
                let wait_secs = missing / rate;
                return Ok(Decision::Denied { wait: Duration::from_secs_f64(wait_secs), reason: "token_bucket_empty".into() });
            }
        }

        // Failed to acquire lock after retries
        // In a real system, we might deny or fail open.
        Ok(Decision::Denied { wait: Duration::from_millis(100), reason: "store_contention".into() })
    }
}
