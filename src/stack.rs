//! Resilience pipeline composing retry, circuit breaker, bulkhead and timeout
//! around a single external-service call.
//!
//! Every provider adapter and the knowledge-base client build one of these
//! instead of wiring the four primitives by hand: `Bulkhead -> RetryExecutor
//! -> CircuitBreaker -> operation`. The bulkhead sits outermost so a
//! saturated slot never consumes a retry attempt or trips the breaker; the
//! per-attempt timeout lives inside `RetryExecutor` itself.

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::{ClassifiedError, ResilienceError};
use crate::retry_executor::{RetryConfig, RetryExecutor};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Composed resilience pipeline for one external service.
#[derive(Clone)]
pub struct ResiliencePipeline {
    bulkhead: BulkheadPolicy,
    breaker: CircuitBreakerPolicy,
    retry: Arc<RetryExecutor>,
}

impl ResiliencePipeline {
    pub fn new(
        service: &'static str,
        retry_config: RetryConfig,
        breaker: CircuitBreakerPolicy,
        bulkhead: BulkheadPolicy,
    ) -> Self {
        Self { bulkhead, breaker: breaker.with_service(service), retry: Arc::new(RetryExecutor::new(service, retry_config)) }
    }

    /// Run `operation` through the bulkhead, then retry+timeout, then the
    /// circuit breaker, returning the final classified error on exhaustion.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ClassifiedError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send,
        Op: FnMut() -> Fut + Send + 'static,
    {
        let op_cell = Arc::new(Mutex::new(operation));
        let breaker = self.breaker.clone();
        let retry = self.retry.clone();

        self.bulkhead
            .execute(|| {
                let op_cell = op_cell.clone();
                let breaker = breaker.clone();
                let retry = retry.clone();
                async move {
                    let outcome = retry
                        .execute(|| {
                            let op_cell = op_cell.clone();
                            let breaker = breaker.clone();
                            async move {
                                breaker
                                    .execute(|| {
                                        let op_cell = op_cell.clone();
                                        async move {
                                            let mut op = op_cell.lock().await;
                                            op().await
                                        }
                                    })
                                    .await
                                    .map_err(|e| match e {
                                        ResilienceError::Inner(inner) => inner,
                                        ResilienceError::CircuitOpen { .. } => {
                                            ClassifiedError::transient("circuit breaker open")
                                        }
                                        other => ClassifiedError::transient(other.to_string()),
                                    })
                            }
                        })
                        .await;
                    match outcome {
                        Ok(v) => Ok(v),
                        Err(ResilienceError::Inner(e)) => Err(e),
                        Err(ResilienceError::RetryExhausted { failures, .. }) => {
                            Err(failures.into_iter().last().unwrap_or_else(|| ClassifiedError::transient("retry exhausted")))
                        }
                        Err(other) => Err(ClassifiedError::transient(other.to_string())),
                    }
                }
            })
            .await
    }
}
