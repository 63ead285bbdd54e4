//! Per-email state machine, bounded worker pool, and the daemon loop that
//! drives a cycle of fetch -> normalize -> extract -> link -> classify ->
//! write -> validate.

use crate::classifier::{self, LlmClassificationInput};
use crate::domain::{CompanyRecord, ExtractedEntities, Intensity, RunRecord, RunStatus};
use crate::dlq::Dlq;
use crate::error::{ClassifiedError, ErrorClass};
use crate::fuzzy_linker;
use crate::idempotency::ProcessedIndex;
use crate::normalizer;
use crate::ports::{KnowledgeBasePort, MailSourcePort, OnDuplicate, Record, Schema};
use crate::provider_orchestrator::ProviderOrchestrator;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetched,
    Normalized,
    Extracted,
    Linked,
    Classified,
    Written,
    Validated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    Empty,
}

#[derive(Debug)]
pub enum EmailOutcome {
    Completed,
    Failed { stage: Stage, error: ClassifiedError },
    Skipped { reason: SkipReason },
    Cancelled,
}

/// Cooperative cancellation, threaded from the controller into the
/// orchestrator and adapters. A hand-rolled `AtomicBool` flag rather than
/// `tokio_util::sync::CancellationToken`, since the latter isn't part of
/// this crate's dependency stack.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn severity_for(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Transient => "medium",
        ErrorClass::Permanent => "low",
        ErrorClass::Critical => "critical",
    }
}

/// Deterministic stand-in for the orchestrator's dedicated classification
/// call (§4.10): deriving intensity/summary from the already-extracted
/// fields rather than issuing a second structured-output round trip through
/// the same vendor contract `ProviderAdapter` already covers for extraction.
fn derive_classification_input(entities: &ExtractedEntities) -> LlmClassificationInput {
    let details_lower = entities.details.as_deref().unwrap_or("").to_lowercase();
    let intensity = if details_lower.contains("acqui") {
        Intensity::Acquire
    } else if details_lower.contains("invest") || details_lower.contains("round") {
        Intensity::Invest
    } else if details_lower.contains("partner") || details_lower.contains("cooperat") {
        Intensity::Cooperate
    } else {
        Intensity::Understand
    };
    let summary = format!(
        "{} and {} discussed {}.",
        entities.person.as_deref().unwrap_or("someone"),
        entities.startup.as_deref().unwrap_or("a company"),
        entities.details.as_deref().unwrap_or("a collaboration")
    );
    LlmClassificationInput { intensity, intensity_confidence: entities.confidence.overall(), summary }
}

fn field_str(fields: &HashMap<String, Value>, key: &str) -> Option<String> {
    fields.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Re-reads the just-written record and checks the five core fields and the
/// linked company identifier (if any) round-trip exactly.
fn validate_write(written: &Record, entities: &ExtractedEntities, company_id: &Option<String>) -> bool {
    let date_str = entities.date.map(|d| d.format("%Y-%m-%d").to_string());
    field_str(&written.fields, "person") == entities.person
        && field_str(&written.fields, "startup") == entities.startup
        && field_str(&written.fields, "partner") == entities.partner
        && field_str(&written.fields, "details") == entities.details
        && field_str(&written.fields, "date") == date_str
        && match company_id {
            Some(id) => field_str(&written.fields, "company_id").as_ref() == Some(id),
            None => true,
        }
}

/// Drives a single email through the full state machine. Stateless aside
/// from the shared ports/trackers/indexes it's built with.
pub struct Pipeline {
    pub mail: Arc<dyn MailSourcePort>,
    pub kb: Arc<dyn KnowledgeBasePort>,
    pub orchestrator: Arc<ProviderOrchestrator>,
    pub processed: Arc<ProcessedIndex>,
    pub dlq: Arc<Dlq>,
    pub db_id: String,
    pub on_duplicate: OnDuplicate,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Pipeline {
    pub async fn process_email(
        &self,
        raw: crate::domain::RawMessage,
        companies: &[CompanyRecord],
        workspace_users: &[(String, String)],
        schema: &Schema,
        cancel: &CancellationToken,
    ) -> EmailOutcome {
        if self.processed.contains(&raw.id) && self.on_duplicate == OnDuplicate::Skip {
            return EmailOutcome::Skipped { reason: SkipReason::Duplicate };
        }
        if cancel.is_cancelled() {
            return EmailOutcome::Cancelled;
        }

        let cleaned = normalizer::clean(&raw);
        if cleaned.is_empty {
            return EmailOutcome::Skipped { reason: SkipReason::Empty };
        }

        let entities = match self.orchestrator.extract(&cleaned.body, None, &raw.id, schema).await {
            Ok(e) => e,
            Err(e) if e.class == ErrorClass::Permanent => return EmailOutcome::Skipped { reason: SkipReason::Empty },
            Err(e) if e.class == ErrorClass::Critical => return EmailOutcome::Failed { stage: Stage::Extracted, error: e },
            Err(e) => {
                let _ = self.dlq.record_failure(
                    severity_for(e.class),
                    &raw.id,
                    "extract",
                    json!({"body": cleaned.body}),
                    crate::domain::DlqError { error_type: e.class.to_string(), message: e.message.clone(), http_status: e.http_status, retry_count: 0 },
                );
                self.telemetry.record(TelemetryEvent::DlqWrite { email_id: raw.id.clone(), stage: "extract".to_string(), severity: severity_for(e.class).to_string() }).await;
                return EmailOutcome::Failed { stage: Stage::Extracted, error: e };
            }
        };
        self.telemetry.record(TelemetryEvent::StageTransition { email_id: raw.id.clone(), stage: "Extracted".to_string() }).await;

        if cancel.is_cancelled() {
            return EmailOutcome::Cancelled;
        }

        let company_match = entities.startup.as_deref().map(|name| fuzzy_linker::resolve_company(name, companies));
        let (company_id, hint) = match &company_match {
            Some(m) if m.decision == crate::domain::MatchDecision::AutoCreate => {
                let mut payload = HashMap::new();
                payload.insert("name".to_string(), Value::String(m.query.clone()));
                payload.insert("is_affiliate".to_string(), Value::Bool(false));
                payload.insert("is_portfolio".to_string(), Value::Bool(false));
                payload.insert("source".to_string(), Value::String("auto".to_string()));
                match self.kb.create_record(&self.db_id, payload).await {
                    Ok(record) => (Some(record.id), crate::domain::ClassificationHint::Neither),
                    Err(e) => return EmailOutcome::Failed { stage: Stage::Linked, error: e },
                }
            }
            Some(m) => {
                let hint = companies.iter().find(|c| Some(&c.id) == m.matched_id.as_ref()).map(|c| c.classification_hint()).unwrap_or(crate::domain::ClassificationHint::Neither);
                (m.matched_id.clone(), hint)
            }
            None => (None, crate::domain::ClassificationHint::Neither),
        };
        let person_id = entities.person.as_deref().and_then(|name| fuzzy_linker::resolve_person(name, workspace_users));

        let classification = classifier::classify(&entities, hint, &schema.type_tags, derive_classification_input(&entities));

        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("person".to_string(), entities.person.clone().map(Value::String).unwrap_or(Value::Null));
        payload.insert("startup".to_string(), entities.startup.clone().map(Value::String).unwrap_or(Value::Null));
        payload.insert("partner".to_string(), entities.partner.clone().map(Value::String).unwrap_or(Value::Null));
        payload.insert("details".to_string(), entities.details.clone().map(Value::String).unwrap_or(Value::Null));
        payload.insert("date".to_string(), entities.date.map(|d| Value::String(d.format("%Y-%m-%d").to_string())).unwrap_or(Value::Null));
        payload.insert("company_id".to_string(), company_id.clone().map(Value::String).unwrap_or(Value::Null));
        payload.insert("person_id".to_string(), person_id.map(Value::String).unwrap_or(Value::Null));
        payload.insert("type_tag".to_string(), Value::String(classification.type_tag.clone()));
        payload.insert("intensity".to_string(), json!(classification.intensity));
        payload.insert("summary".to_string(), Value::String(classification.summary.clone()));

        let written = match self.kb.upsert_record(&self.db_id, &raw.id, payload.clone(), self.on_duplicate).await {
            Ok(r) => r,
            Err(e) => {
                let _ = self.dlq.record_failure(
                    severity_for(e.class),
                    &raw.id,
                    "write",
                    Value::Object(payload.clone().into_iter().collect()),
                    crate::domain::DlqError { error_type: e.class.to_string(), message: e.message.clone(), http_status: e.http_status, retry_count: 0 },
                );
                self.telemetry.record(TelemetryEvent::DlqWrite { email_id: raw.id.clone(), stage: "write".to_string(), severity: severity_for(e.class).to_string() }).await;
                return EmailOutcome::Failed { stage: Stage::Written, error: e };
            }
        };

        if let Err(e) = self.processed.mark_processed(&raw.id) {
            tracing::warn!(email_id = %raw.id, error = %e, "failed to persist idempotency index after write");
        }

        if !validate_write(&written, &entities, &company_id) {
            let _ = self.dlq.record_failure(
                "high",
                &raw.id,
                "validate",
                Value::Object(payload.into_iter().collect()),
                crate::domain::DlqError { error_type: "validation".to_string(), message: "written record did not round-trip".to_string(), http_status: None, retry_count: 0 },
            );
            self.telemetry.record(TelemetryEvent::DlqWrite { email_id: raw.id.clone(), stage: "validate".to_string(), severity: "high".to_string() }).await;
            return EmailOutcome::Failed { stage: Stage::Validated, error: ClassifiedError::permanent("validation failed: fields did not round-trip") };
        }

        self.telemetry.record(TelemetryEvent::StageTransition { email_id: raw.id, stage: "Validated".to_string() }).await;
        EmailOutcome::Completed
    }
}

/// Runs a bounded worker pool over a batch of fetched emails, tracking
/// counters in a [`RunRecord`]. A single `Critical` failure halts the cycle:
/// in-flight work finishes, no further emails are dequeued.
pub struct PipelineController {
    pub pipeline: Arc<Pipeline>,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl PipelineController {
    pub async fn run_cycle(
        &self,
        query: &str,
        limit: usize,
        companies: Arc<Vec<CompanyRecord>>,
        workspace_users: Arc<Vec<(String, String)>>,
        schema: Arc<Schema>,
    ) -> RunRecord {
        let mut run = RunRecord::new(chrono::Utc::now().to_rfc3339());
        let messages = match self.pipeline.mail.list_new(query, limit).await {
            Ok(m) => m,
            Err(e) => {
                run.counters.failed += 1;
                run.errors.push(crate::domain::ErrorRecord {
                    email_id: String::new(),
                    stage: "fetch".to_string(),
                    class: e.class.into(),
                    severity: if e.class == ErrorClass::Critical { crate::error::Severity::Critical } else { crate::error::Severity::Medium },
                    message: e.message,
                    remediation_hint: "check mail source connectivity/credentials".to_string(),
                    occurred_at: chrono::Utc::now(),
                });
                run.finish(if e.class == ErrorClass::Critical { RunStatus::Halted } else { RunStatus::Completed });
                return run;
            }
        };
        run.counters.received = messages.len() as u64;

        let (tx, rx) = tokio::sync::mpsc::channel(self.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let run = Arc::new(Mutex::new(run));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::new();
        for _ in 0..self.workers.max(1) {
            let pipeline = self.pipeline.clone();
            let companies = companies.clone();
            let workspace_users = workspace_users.clone();
            let schema = schema.clone();
            let cancel = cancel.clone();
            let run = run.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(raw) = next else { break };
                    let outcome = pipeline.process_email(raw, &companies, &workspace_users, &schema, &cancel).await;
                    let mut run = run.lock().expect("run record mutex poisoned");
                    match outcome {
                        EmailOutcome::Completed => run.counters.processed += 1,
                        EmailOutcome::Skipped { .. } => run.counters.skipped += 1,
                        EmailOutcome::Cancelled => {}
                        EmailOutcome::Failed { stage, error } => {
                            run.counters.failed += 1;
                            if error.class == ErrorClass::Critical {
                                cancel.cancel();
                            }
                            run.errors.push(crate::domain::ErrorRecord {
                                email_id: String::new(),
                                stage: format!("{:?}", stage),
                                class: error.class.into(),
                                severity: if error.class == ErrorClass::Critical { crate::error::Severity::Critical } else { crate::error::Severity::Medium },
                                message: error.message,
                                remediation_hint: "inspect DLQ entry for this email/stage".to_string(),
                                occurred_at: chrono::Utc::now(),
                            });
                        }
                    }
                }
            }));
        }

        for raw in messages {
            if cancel.is_cancelled() {
                break;
            }
            if tx.send(raw).await.is_err() {
                break;
            }
        }
        drop(tx);

        for handle in handles {
            let _ = handle.await;
        }

        let mut run = Arc::try_unwrap(run).map(|m| m.into_inner().expect("run record mutex poisoned")).unwrap_or_else(|arc| arc.lock().expect("run record mutex poisoned").clone());
        run.finish(if cancel.is_cancelled() { RunStatus::Halted } else { RunStatus::Completed });
        run
    }

    /// Wakes on `interval`, runs one cycle, and waits for drain before the
    /// next wakeup (§4.10). A `Halted` cycle (critical failure) stops the
    /// daemon from fetching new mail, but the loop keeps ticking rather than
    /// returning, matching "does not exit" in §4.10's error model.
    ///
    /// Returns once `shutdown.is_cancelled()`, so a caller owns the lifetime
    /// of the daemon via the same cancellation token threaded into the
    /// pipeline.
    pub async fn run_daemon(
        &self,
        query: &str,
        limit: usize,
        interval: std::time::Duration,
        companies: Arc<Vec<CompanyRecord>>,
        workspace_users: Arc<Vec<(String, String)>>,
        schema: Arc<Schema>,
        shutdown: CancellationToken,
    ) -> Vec<RunRecord> {
        let mut ticker = tokio::time::interval(interval);
        let mut halted = false;
        let mut runs = Vec::new();

        loop {
            ticker.tick().await;
            if shutdown.is_cancelled() {
                break;
            }
            if halted {
                tracing::warn!("daemon halted after a critical failure; skipping fetch until restarted");
                continue;
            }
            let run = self.run_cycle(query, limit, companies.clone(), workspace_users.clone(), schema.clone()).await;
            if run.status == RunStatus::Halted {
                halted = true;
            }
            runs.push(run);
        }

        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::config::Strategy;
    use crate::cost_tracker::CostTracker;
    use crate::domain::RawMessage;
    use crate::health_tracker::HealthTracker;
    use crate::ports::{FakeKnowledgeBase, FakeLlmVendor, FakeMailSource, LlmVendorPort};
    use crate::provider_orchestrator::ProviderSpec;
    use crate::quality_tracker::QualityTracker;
    use crate::retry_executor::RetryConfig;
    use serde_json::json;
    use std::time::Duration;

    fn temp_root(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("collabiq-pipeline-test-{}-{}", tag, std::process::id()))
    }

    fn raw(id: &str, body: &str) -> RawMessage {
        RawMessage { id: id.to_string(), sender: "a@example.com".to_string(), subject: "hi".to_string(), body: body.to_string(), received_at: chrono::Utc::now(), attachments: vec![] }
    }

    fn make_pipeline(tag: &str, vendor_response: Result<(Value, u64, u64), ClassifiedError>) -> Pipeline {
        make_pipeline_with_inbox(tag, vec![vendor_response], vec![])
    }

    fn make_pipeline_with_inbox(tag: &str, vendor_responses: Vec<Result<(Value, u64, u64), ClassifiedError>>, inbox: Vec<RawMessage>) -> Pipeline {
        let root = temp_root(tag);
        let vendor: Arc<dyn LlmVendorPort> = Arc::new(FakeLlmVendor::new(vendor_responses));
        let spec = ProviderSpec {
            name: "gemini",
            vendor,
            price_per_million_in: 0.0,
            price_per_million_out: 0.0,
            retry_config: RetryConfig::new(1, Duration::from_millis(1), Duration::from_millis(5)),
            breaker_config: CircuitBreakerConfig::default_service(),
            bulkhead_capacity: 4,
        };
        let orchestrator = Arc::new(ProviderOrchestrator::build(
            vec![spec],
            Arc::new(HealthTracker::new(&root)),
            Arc::new(CostTracker::new(&root)),
            Arc::new(QualityTracker::new(&root)),
            false,
            Strategy::Failover,
        ));

        Pipeline {
            mail: Arc::new(FakeMailSource::new(inbox)),
            kb: Arc::new(FakeKnowledgeBase::new(Schema::default())),
            orchestrator,
            processed: Arc::new(ProcessedIndex::new(&root)),
            dlq: Arc::new(Dlq::new(&root)),
            db_id: "db1".to_string(),
            on_duplicate: OnDuplicate::Skip,
            telemetry: Arc::new(crate::telemetry::NoopSink),
        }
    }

    #[tokio::test]
    async fn happy_path_completes_and_round_trips() {
        let pipeline = make_pipeline(
            "happy",
            Ok((
                json!({"person": "Jane Doe", "startup": "Acme", "details": "seed round", "confidence": {"person": 0.9, "startup": 0.9, "partner": 0.0, "details": 0.8, "date": 0.0}}),
                50,
                30,
            )),
        );
        let outcome = pipeline.process_email(raw("E1", "Jane Doe discussed a seed round for Acme."), &[], &[], &Schema::default(), &CancellationToken::new()).await;
        assert!(matches!(outcome, EmailOutcome::Completed));
        assert!(pipeline.processed.contains("E1"));
    }

    #[tokio::test]
    async fn duplicate_email_is_skipped() {
        let pipeline = make_pipeline("duplicate", Ok((json!({"person": "Jane", "confidence": {"person": 0.9, "startup": 0.0, "partner": 0.0, "details": 0.0, "date": 0.0}}), 10, 10)));
        pipeline.processed.mark_processed("E1").unwrap();
        let outcome = pipeline.process_email(raw("E1", "body"), &[], &[], &Schema::default(), &CancellationToken::new()).await;
        assert!(matches!(outcome, EmailOutcome::Skipped { reason: SkipReason::Duplicate }));
    }

    #[tokio::test]
    async fn empty_after_cleaning_is_skipped() {
        let pipeline = make_pipeline("empty", Ok((json!({}), 1, 1)));
        let outcome = pipeline.process_email(raw("E1", "-- \nJane Doe"), &[], &[], &Schema::default(), &CancellationToken::new()).await;
        assert!(matches!(outcome, EmailOutcome::Skipped { reason: SkipReason::Empty }));
    }

    #[tokio::test]
    async fn critical_extraction_failure_is_reported() {
        let pipeline = make_pipeline("critical", Err(ClassifiedError::critical("unauthorized")));
        let outcome = pipeline.process_email(raw("E1", "some real content here"), &[], &[], &Schema::default(), &CancellationToken::new()).await;
        match outcome {
            EmailOutcome::Failed { stage, error } => {
                assert_eq!(stage, Stage::Extracted);
                assert_eq!(error.class, ErrorClass::Critical);
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn transient_extraction_failure_routes_to_dlq() {
        let pipeline = make_pipeline("dlq", Err(ClassifiedError::transient("rate limited")));
        let outcome = pipeline.process_email(raw("E1", "some real content here"), &[], &[], &Schema::default(), &CancellationToken::new()).await;
        assert!(matches!(outcome, EmailOutcome::Failed { stage: Stage::Extracted, .. }));
        assert_eq!(pipeline.dlq.keys(), vec![("medium".to_string(), "E1".to_string(), "extract".to_string())]);
    }

    #[tokio::test]
    async fn run_cycle_drains_batch_and_reports_counters() {
        let inbox = vec![raw("E1", "Jane Doe discussed a seed round for Acme."), raw("E2", "-- \nsignature only")];
        let pipeline = make_pipeline_with_inbox(
            "cycle",
            vec![
                Ok((json!({"person": "Jane Doe", "startup": "Acme", "details": "seed round", "confidence": {"person": 0.9, "startup": 0.9, "partner": 0.0, "details": 0.8, "date": 0.0}}), 50, 30)),
                Ok((json!({}), 1, 1)),
            ],
            inbox,
        );
        let controller = PipelineController { pipeline: Arc::new(pipeline), workers: 2, queue_capacity: 4 };
        let run = controller.run_cycle("to:group@example.com", 10, Arc::new(vec![]), Arc::new(vec![]), Arc::new(Schema::default())).await;

        assert_eq!(run.counters.received, 2);
        assert_eq!(run.counters.processed, 1);
        assert_eq!(run.counters.skipped, 1);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn run_daemon_ticks_until_shutdown() {
        let pipeline = make_pipeline_with_inbox("daemon", vec![], vec![]);
        let controller = PipelineController { pipeline: Arc::new(pipeline), workers: 1, queue_capacity: 4 };
        let shutdown = CancellationToken::new();
        let shutdown_for_timer = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            shutdown_for_timer.cancel();
        });

        let runs = controller.run_daemon("to:group@example.com", 10, Duration::from_millis(5), Arc::new(vec![]), Arc::new(vec![]), Arc::new(Schema::default()), shutdown).await;
        assert!(!runs.is_empty());
        assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    }
}
