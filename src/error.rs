//! Error classification taxonomy shared by every external-service call.
//!
//! The reliability layer does not reason about HTTP status codes or vendor
//! SDK exception types directly; every collaborator (mail source, knowledge
//! base, LLM vendor, secret store) maps its failures onto [`ErrorClass`] at
//! the boundary, and everything above that boundary — [`crate::retry_executor`],
//! [`crate::circuit_breaker`], the pipeline controller — only ever switches on
//! the class.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside `RetryExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// How a failure should be treated by the retry executor and circuit breaker.
///
/// This is orthogonal to [`Severity`], which describes how bad a failure is
/// for operators; `ErrorClass` describes what the executor should *do*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network error, timeout, rate limit (429), or server error (5xx).
    /// Retried by the executor, honoring any `Retry-After` hint.
    Transient,
    /// Bad request (400), not found (404), forbidden (403), validation or
    /// parse failure. Never retried.
    Permanent,
    /// Authentication failure (401) or invalid credentials. Never retried,
    /// trips the circuit breaker immediately, and signals the controller to
    /// halt new fetches.
    Critical,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    pub fn trips_breaker_immediately(self) -> bool {
        matches!(self, ErrorClass::Critical)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Critical => write!(f, "critical"),
        }
    }
}

/// Operator-facing severity of an [`crate::domain::ErrorRecord`], orthogonal to [`ErrorClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A classified failure from any external collaborator.
///
/// Adapters construct these directly; nothing upstream needs to know the
/// wire-level cause once it is wrapped here.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
    /// Lower bound on the next retry delay, taken from a vendor `Retry-After` header.
    pub retry_after: Option<Duration>,
    pub http_status: Option<u16>,
}

impl ClassifiedError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Transient, message: message.into(), retry_after: None, http_status: None }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Permanent, message: message.into(), retry_after: None, http_status: None }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Critical, message: message.into(), retry_after: None, http_status: None }
    }

    pub fn with_retry_after(mut self, d: Duration) -> Self {
        self.retry_after = Some(d);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

impl From<crate::bulkhead::BulkheadError> for ClassifiedError {
    /// A bulkhead rejection is always transient: the caller should back off
    /// and retry once a slot frees up, not treat it as a vendor failure.
    fn from(e: crate::bulkhead::BulkheadError) -> Self {
        ClassifiedError::transient(e.to_string())
    }
}

/// Unified error type returned by anything wrapped in the resilience stack.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The operation exceeded the timeout duration.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker is open.
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The underlying operation failed without retry (Permanent/Critical).
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { failure_count, open_duration } => {
                write!(f, "circuit breaker open ({} failures, open for {:?})", failure_count, open_duration)
            }
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(f, "retry exhausted after {} attempts ({} recorded failures), last error: {}", attempts, failures.len(), last)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last().map(|e| e as &dyn std::error::Error),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl ResilienceError<ClassifiedError> {
    /// Best-effort classification of the outer error, for callers that only
    /// care whether the pipeline should halt.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::CircuitOpen { .. } => ErrorClass::Transient,
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e.class).unwrap_or(ErrorClass::Transient)
            }
            Self::Inner(e) => e.class,
        }
    }
}

/// Top-level error type for configuration, persistence, and startup failures
/// (ambient concern; distinct from the per-call classification above).
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("persistence error at {path}: {source}")]
    Persistence { path: String, #[source] source: std::io::Error },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("external API error: {0}")]
    External(String),
}
