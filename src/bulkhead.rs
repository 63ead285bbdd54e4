//! Concurrency limiter: single in-flight cap per external service.
//!
//! Complements the [`crate::rate_limit`] token bucket — the bucket caps
//! *throughput*, this caps *concurrency*. The knowledge-base client uses one
//! to guarantee at most one in-flight write per `(db_id, record_key)`
//! relationship resolution pass, matching the worker pool's "failures of one
//! email don't starve another" requirement without letting a single slow
//! call monopolize the connection.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadError {
    pub in_flight: usize,
    pub max: usize,
}

impl std::fmt::Display for BulkheadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bulkhead rejected request ({} in-flight, max {})", self.in_flight, self.max)
    }
}

impl std::error::Error for BulkheadError {}

#[derive(Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    pub fn single_in_flight() -> Self {
        Self::new(1)
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, E>
    where
        E: From<BulkheadError>,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
        T: Send,
    {
        let available = self.semaphore.available_permits();
        let in_flight = self.max_concurrent.saturating_sub(available);
        let permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| BulkheadError { in_flight, max: self.max_concurrent }.into())?;

        let result = operation().await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifiedError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn allows_operations_within_limit() {
        let bulkhead = BulkheadPolicy::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter_clone = counter.clone();
            let result: Result<_, ClassifiedError> = bulkhead
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    }
                })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejects_when_at_capacity() {
        let bulkhead = BulkheadPolicy::single_in_flight();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let b2 = barrier.clone();
        let bulkhead_clone = bulkhead.clone();
        let handle = tokio::spawn(async move {
            let r: Result<(), ClassifiedError> = bulkhead_clone
                .execute(|| {
                    let b2 = b2.clone();
                    async move {
                        b2.wait().await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    }
                })
                .await;
            r
        });

        barrier.wait().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result: Result<(), ClassifiedError> = bulkhead.execute(|| async { Ok(()) }).await;
        assert!(result.is_err());
        let _ = handle.await;
    }
}
