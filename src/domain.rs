//! Core data types shared across the pipeline: raw/cleaned messages,
//! extraction and classification results, company/match records, and the
//! run-level bookkeeping types persisted to disk.
//!
//! Mirrors the shape of [`crate::error::ClassifiedError`] split into
//! long-lived records rather than in-flight failures: an [`ErrorRecord`] is
//! what survives an unrecoverable stage failure once the controller has
//! decided not to retry it further.

use crate::error::{ErrorClass, Severity};
use serde::{Deserialize, Serialize};

/// An inbound message as fetched from the mail source, before any cleaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub attachments: Vec<String>,
}

/// What the normalizer strips from a [`RawMessage`] body.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Removed {
    pub signature: bool,
    pub quotes: bool,
    pub disclaimer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanedMessage {
    pub raw_id: String,
    pub body: String,
    pub removed: Removed,
    pub is_empty: bool,
}

/// Per-field confidence, always present and bounded to `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FieldConfidence {
    pub person: f64,
    pub startup: f64,
    pub partner: f64,
    pub details: f64,
    pub date: f64,
}

impl FieldConfidence {
    /// Mean of the five per-field confidences ("overall confidence" in the glossary).
    pub fn overall(&self) -> f64 {
        (self.person + self.startup + self.partner + self.details + self.date) / 5.0
    }

    pub fn as_array(&self) -> [f64; 5] {
        [self.person, self.startup, self.partner, self.details, self.date]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntities {
    pub person: Option<String>,
    pub startup: Option<String>,
    pub partner: Option<String>,
    pub details: Option<String>,
    pub date: Option<chrono::NaiveDate>,
    pub confidence: FieldConfidence,
    pub provider: String,
    pub email_id: String,
    pub extracted_at: chrono::DateTime<chrono::Utc>,
}

impl ExtractedEntities {
    /// Count of the five core fields that are non-null.
    pub fn fields_extracted(&self) -> usize {
        [self.person.is_some(), self.startup.is_some(), self.partner.is_some(), self.details.is_some(), self.date.is_some()]
            .into_iter()
            .filter(|v| *v)
            .count()
    }

    /// Percentage of the five core fields that are non-null.
    pub fn completeness(&self) -> f64 {
        self.fields_extracted() as f64 / 5.0 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Understand,
    Cooperate,
    Invest,
    Acquire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub type_tag: String,
    pub type_confidence: f64,
    pub intensity: Intensity,
    pub intensity_confidence: f64,
    pub summary: String,
    pub summary_word_count: usize,
    /// Whether each of the five core fields survived into the summary.
    pub key_entities_preserved: [bool; 5],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationHint {
    Affiliate,
    Portfolio,
    Both,
    Neither,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: String,
    pub name: String,
    pub is_affiliate: bool,
    pub is_portfolio: bool,
    pub source: String,
}

impl CompanyRecord {
    pub fn classification_hint(&self) -> ClassificationHint {
        match (self.is_affiliate, self.is_portfolio) {
            (true, true) => ClassificationHint::Both,
            (true, false) => ClassificationHint::Affiliate,
            (false, true) => ClassificationHint::Portfolio,
            (false, false) => ClassificationHint::Neither,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Match,
    AutoCreate,
    Reject,
    Ambiguous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub query: String,
    pub matched_id: Option<String>,
    pub matched_name: Option<String>,
    pub similarity: f64,
    pub decision: MatchDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<crate::circuit_breaker::CircuitState> for BreakerState {
    fn from(s: crate::circuit_breaker::CircuitState) -> Self {
        match s {
            crate::circuit_breaker::CircuitState::Closed => BreakerState::Closed,
            crate::circuit_breaker::CircuitState::Open => BreakerState::Open,
            crate::circuit_breaker::CircuitState::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: usize,
    /// Exponential moving average of response time, alpha = 0.2.
    pub avg_response_ms: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            avg_response_ms: 0.0,
            success_count: 0,
            error_count: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCost {
    pub name: String,
    pub calls: u64,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost_usd: f64,
    pub avg_cost_per_call: f64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ProviderCost {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), calls: 0, in_tokens: 0, out_tokens: 0, cost_usd: 0.0, avg_cost_per_call: 0.0, updated_at: chrono::Utc::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderQuality {
    pub name: String,
    pub extractions: u64,
    pub validations_passed: u64,
    pub validations_failed: u64,
    pub avg_confidence: f64,
    pub stddev_confidence: f64,
    pub avg_completeness: f64,
    pub avg_fields_extracted: f64,
    pub per_field_avg_confidence: [f64; 5],
    pub trend: Trend,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl ProviderQuality {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extractions: 0,
            validations_passed: 0,
            validations_failed: 0,
            avg_confidence: 0.0,
            stddev_confidence: 0.0,
            avg_completeness: 0.0,
            avg_fields_extracted: 0.0,
            per_field_avg_confidence: [0.0; 5],
            trend: Trend::Stable,
            last_updated: chrono::Utc::now(),
        }
    }

    pub fn validation_rate(&self) -> f64 {
        let total = self.validations_passed + self.validations_failed;
        if total == 0 {
            0.0
        } else {
            self.validations_passed as f64 / total as f64 * 100.0
        }
    }

    /// `0.4*avg_confidence + 0.3*(avg_completeness/100) + 0.3*(validation_rate/100)`.
    pub fn quality_score(&self) -> f64 {
        0.4 * self.avg_confidence + 0.3 * (self.avg_completeness / 100.0) + 0.3 * (self.validation_rate() / 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqError {
    pub error_type: String,
    pub message: String,
    pub http_status: Option<u16>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub email_id: String,
    pub stage: String,
    pub payload: serde_json::Value,
    pub error: DlqError,
    pub first_failed_at: chrono::DateTime<chrono::Utc>,
    pub last_attempt_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Halted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub received: u64,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub email_id: String,
    pub stage: String,
    pub class: ErrorClass2,
    pub severity: Severity,
    pub message: String,
    pub remediation_hint: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

/// Serializable mirror of [`ErrorClass`]; kept distinct because `ErrorClass`
/// is an in-flight decision type and intentionally carries no serde impls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass2 {
    Transient,
    Permanent,
    Critical,
}

impl From<ErrorClass> for ErrorClass2 {
    fn from(c: ErrorClass) -> Self {
        match c {
            ErrorClass::Transient => ErrorClass2::Transient,
            ErrorClass::Permanent => ErrorClass2::Permanent,
            ErrorClass::Critical => ErrorClass2::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub errors: Vec<ErrorRecord>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), started_at: chrono::Utc::now(), ended_at: None, status: RunStatus::Running, counters: RunCounters::default(), errors: Vec::new() }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(chrono::Utc::now());
    }
}
