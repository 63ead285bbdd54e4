//! Library-level CLI dispatch surface (§6): one function per invocation an
//! external CLI collaborator needs to wire a flag/subcommand to, so the
//! actual argument parsing and terminal output stay outside this crate (§1)
//! while every operation it performs lives here and is tested here.
//!
//! [`AppContext`] is the one place that wires [`Settings`] and the four
//! external ports (supplied by the caller, since the wire-level clients
//! themselves are out of scope) into the trackers, the KB cache, and the
//! provider orchestrator every other function in this module operates on.

use crate::cost_tracker::CostTracker;
use crate::dlq::Dlq;
use crate::domain::{BreakerState, CompanyRecord, DlqEntry, ProviderCost, ProviderHealth, ProviderQuality, RunRecord};
use crate::error::{ClassifiedError, CollabError};
use crate::health_tracker::HealthTracker;
use crate::idempotency::ProcessedIndex;
use crate::normalizer;
use crate::pipeline::{CancellationToken, EmailOutcome, Pipeline, PipelineController};
use crate::ports::{KnowledgeBasePort, LlmVendorPort, MailSourcePort, OnDuplicate as PortOnDuplicate, Record, Schema};
use crate::provider_orchestrator::ProviderOrchestrator;
use crate::quality_tracker::QualityTracker;
use crate::telemetry::TelemetrySink;
use crate::{cache::CachedKnowledgeBase, config::Settings, domain::RawMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Unifies every failure this module's functions can return onto the exit
/// codes §6 requires: `1` generic, `2` config, `3` external API, `4`
/// validation. `0` success has no corresponding variant.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error("{0}")]
    External(ClassifiedError),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl ApiError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ApiError::Collab(CollabError::Config(_)) => 2,
            ApiError::Collab(CollabError::External(_)) => 3,
            ApiError::Collab(_) => 1,
            ApiError::External(_) => 3,
            ApiError::Validation(_) => 4,
        }
    }
}

impl From<ClassifiedError> for ApiError {
    fn from(e: ClassifiedError) -> Self {
        ApiError::External(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn on_duplicate_port(o: crate::config::OnDuplicate) -> PortOnDuplicate {
    match o {
        crate::config::OnDuplicate::Skip => PortOnDuplicate::Skip,
        crate::config::OnDuplicate::Update => PortOnDuplicate::Update,
    }
}

/// Everything one CLI dispatch needs, built once per process from a loaded
/// [`Settings`] and the caller's port implementations.
pub struct AppContext {
    pub settings: Settings,
    pub health: Arc<HealthTracker>,
    pub cost: Arc<CostTracker>,
    pub quality: Arc<QualityTracker>,
    pub orchestrator: Arc<ProviderOrchestrator>,
    pub dlq: Arc<Dlq>,
    pub processed: Arc<ProcessedIndex>,
    pub mail: Arc<dyn MailSourcePort>,
    kb_cache: Arc<CachedKnowledgeBase<Arc<dyn KnowledgeBasePort>>>,
    pub kb: Arc<dyn KnowledgeBasePort>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl AppContext {
    /// `vendors` must have one entry per `settings.providers[].name`
    /// (`ProviderOrchestrator::from_settings` enforces this, surfacing a
    /// missing vendor as a `Config` error -> exit code 2).
    pub fn build(
        settings: Settings,
        mail: Arc<dyn MailSourcePort>,
        kb: Arc<dyn KnowledgeBasePort>,
        vendors: HashMap<String, Arc<dyn LlmVendorPort>>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> ApiResult<Self> {
        let health = Arc::new(HealthTracker::with_telemetry(&settings.data_root, telemetry.clone()));
        let cost = Arc::new(CostTracker::new(&settings.data_root));
        let quality = Arc::new(QualityTracker::new(&settings.data_root));
        let orchestrator =
            Arc::new(ProviderOrchestrator::from_settings(&settings, &vendors, health.clone(), cost.clone(), quality.clone())?);
        let dlq = Arc::new(Dlq::new(&settings.data_root));
        let processed = Arc::new(ProcessedIndex::new(&settings.data_root));
        let kb_cache = Arc::new(CachedKnowledgeBase::new(
            kb,
            &settings.data_root,
            Duration::from_secs(settings.kb.cache_ttl_schema_secs),
            Duration::from_secs(settings.kb.cache_ttl_data_secs),
        ));
        let kb: Arc<dyn KnowledgeBasePort> = kb_cache.clone();
        Ok(Self { settings, health, cost, quality, orchestrator, dlq, processed, mail, kb_cache, kb, telemetry })
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline {
            mail: self.mail.clone(),
            kb: self.kb.clone(),
            orchestrator: self.orchestrator.clone(),
            processed: self.processed.clone(),
            dlq: self.dlq.clone(),
            db_id: self.settings.notion_db_id.clone(),
            on_duplicate: on_duplicate_port(self.settings.on_duplicate),
            telemetry: self.telemetry.clone(),
        }
    }

    fn run_path(&self, run_id: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.settings.data_root).join("runs").join(format!("{run_id}.json"))
    }
}

/// `run [--daemon --interval N]`. A single cycle returns its [`RunRecord`];
/// daemon mode returns every cycle run before `shutdown` fired. Either way
/// each record is persisted to `runs/<run_id>.json` (§6) before returning.
pub async fn run(
    ctx: &AppContext,
    daemon: bool,
    interval: Option<Duration>,
    companies: Arc<Vec<CompanyRecord>>,
    workspace_users: Arc<Vec<(String, String)>>,
    schema: Arc<Schema>,
    shutdown: CancellationToken,
) -> ApiResult<Vec<RunRecord>> {
    let controller = PipelineController { pipeline: Arc::new(ctx.pipeline()), workers: ctx.settings.workers, queue_capacity: ctx.settings.workers.max(1) * 4 };
    let query = ctx.settings.mail_query.clone();
    let limit = ctx.settings.fetch_limit;

    let runs = if daemon {
        controller
            .run_daemon(&query, limit, interval.unwrap_or(Duration::from_secs(ctx.settings.daemon_interval_secs)), companies, workspace_users, schema, shutdown)
            .await
    } else {
        vec![controller.run_cycle(&query, limit, companies, workspace_users, schema).await]
    };

    for record in &runs {
        crate::persistence::write_json_atomic(&ctx.run_path(&record.run_id), record)?;
    }
    Ok(runs)
}

pub mod email {
    use super::*;

    pub async fn fetch(ctx: &AppContext, query: &str, limit: usize) -> ApiResult<Vec<RawMessage>> {
        Ok(ctx.mail.list_new(query, limit).await?)
    }

    pub fn clean(raw: &RawMessage) -> crate::domain::CleanedMessage {
        normalizer::clean(raw)
    }

    /// Every email id this data root has durably recorded as processed.
    pub fn list(ctx: &AppContext) -> Vec<String> {
        ctx.processed.ids()
    }

    pub async fn process(
        ctx: &AppContext,
        raw: RawMessage,
        companies: &[CompanyRecord],
        workspace_users: &[(String, String)],
        schema: &Schema,
    ) -> EmailOutcome {
        ctx.pipeline().process_email(raw, companies, workspace_users, schema, &CancellationToken::new()).await
    }

    /// Read-only dry run: extracts and classifies but never touches the
    /// knowledge base or the processed index, for an operator checking what
    /// a given email *would* produce before committing to `process`.
    pub async fn verify(ctx: &AppContext, raw: &RawMessage, schema: &Schema) -> ApiResult<crate::domain::ExtractedEntities> {
        let cleaned = normalizer::clean(raw);
        if cleaned.is_empty {
            return Err(ApiError::Validation(format!("email {} has no content after cleaning", raw.id)));
        }
        Ok(ctx.orchestrator.extract(&cleaned.body, None, &raw.id, schema).await?)
    }
}

pub mod notion {
    use super::*;

    pub async fn verify(ctx: &AppContext) -> ApiResult<()> {
        ctx.kb.discover_schema(&ctx.settings.notion_db_id, false).await?;
        Ok(())
    }

    pub async fn schema(ctx: &AppContext, force_refresh: bool) -> ApiResult<Schema> {
        Ok(ctx.kb.discover_schema(&ctx.settings.notion_db_id, force_refresh).await?)
    }

    /// Writes a single sentinel record so an operator can confirm write
    /// credentials/permissions without running a full pipeline cycle.
    pub async fn test_write(ctx: &AppContext) -> ApiResult<Record> {
        let mut payload = HashMap::new();
        payload.insert("source".to_string(), serde_json::Value::String("notion-test-write".to_string()));
        Ok(ctx.kb.create_record(&ctx.settings.notion_db_id, payload).await?)
    }

    /// Drops the schema/data cache for the configured database so the next
    /// read goes straight to the live KB.
    pub fn cleanup(ctx: &AppContext) {
        ctx.kb_cache.invalidate(&ctx.settings.notion_db_id);
    }
}

/// Aggregate standing of every configured LLM provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub breaker: Option<BreakerState>,
    pub health: Option<ProviderHealth>,
    pub cost: Option<ProviderCost>,
    pub quality: Option<ProviderQuality>,
}

pub mod llm {
    use super::*;

    pub(super) fn provider_statuses(ctx: &AppContext) -> Vec<ProviderStatus> {
        let health = ctx.health.snapshot();
        let cost = ctx.cost.snapshot();
        let quality = ctx.quality.snapshot();
        let breakers: HashMap<String, BreakerState> = ctx.health.breaker_snapshot().into_iter().map(|(name, state)| (name, state.into())).collect();

        let mut names: Vec<String> = health.keys().chain(cost.keys()).chain(quality.keys()).cloned().collect();
        names.sort();
        names.dedup();

        names
            .into_iter()
            .map(|name| ProviderStatus {
                breaker: breakers.get(&name).copied(),
                health: health.get(&name).cloned(),
                cost: cost.get(&name).cloned(),
                quality: quality.get(&name).cloned(),
                name,
            })
            .collect()
    }

    pub fn status(ctx: &AppContext) -> Vec<ProviderStatus> {
        provider_statuses(ctx)
    }

    /// Same data as `status`, named for the CLI's comparison view: the
    /// underlying snapshot is already side-by-side per provider.
    pub fn compare(ctx: &AppContext) -> Vec<ProviderStatus> {
        provider_statuses(ctx)
    }

    pub fn set_strategy(ctx: &AppContext, strategy: crate::config::Strategy) {
        ctx.orchestrator.set_strategy(strategy);
    }

    pub fn set_quality_routing(ctx: &AppContext, enabled: bool) {
        ctx.orchestrator.set_quality_routing(enabled);
    }

    /// Drives one extraction through the orchestrator exactly as a real
    /// email would, honoring the currently configured strategy/routing.
    pub async fn test(ctx: &AppContext, sample_text: &str, schema: &Schema) -> ApiResult<crate::domain::ExtractedEntities> {
        Ok(ctx.orchestrator.extract(sample_text, None, "llm-test-probe", schema).await?)
    }
}

pub mod errors {
    use super::*;

    pub fn list(ctx: &AppContext) -> Vec<DlqEntry> {
        ctx.dlq.list()
    }

    /// Reconstructs the stored payload and replays it through the same KB
    /// write path the pipeline itself uses (§4.9). On success the entry is
    /// archived; on failure it stays dead-lettered with its retry count
    /// incremented.
    pub async fn retry(ctx: &AppContext, severity: &str, email_id: &str, stage: &str) -> ApiResult<()> {
        let db_id = ctx.settings.notion_db_id.clone();
        let on_duplicate = on_duplicate_port(ctx.settings.on_duplicate);
        let kb = ctx.kb.clone();
        let email_id_owned = email_id.to_string();
        Ok(ctx
            .dlq
            .replay(severity, email_id, stage, move |payload| async move {
                let fields: HashMap<String, serde_json::Value> =
                    serde_json::from_value(payload).map_err(|e| ClassifiedError::permanent(format!("stored DLQ payload is not a record: {e}")))?;
                kb.upsert_record(&db_id, &email_id_owned, fields, on_duplicate).await.map(|_| ())
            })
            .await?)
    }

    /// Archives one entry, or every entry currently dead-lettered when
    /// `target` is `None`.
    pub fn clear(ctx: &AppContext, target: Option<(&str, &str, &str)>) -> ApiResult<usize> {
        let keys = match target {
            Some((severity, email_id, stage)) => vec![(severity.to_string(), email_id.to_string(), stage.to_string())],
            None => ctx.dlq.keys(),
        };
        let mut cleared = 0;
        for (severity, email_id, stage) in &keys {
            ctx.dlq.archive(severity, email_id, stage)?;
            cleared += 1;
        }
        Ok(cleared)
    }
}

/// Cross-cutting snapshot for the top-level `status` command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub providers: Vec<ProviderStatus>,
    pub processed_count: usize,
    pub dlq_count: usize,
    pub dlq_by_severity: HashMap<String, usize>,
}

pub fn status(ctx: &AppContext) -> StatusReport {
    let mut dlq_by_severity = HashMap::new();
    for (severity, _, _) in ctx.dlq.keys() {
        *dlq_by_severity.entry(severity).or_insert(0) += 1;
    }
    StatusReport {
        providers: llm::provider_statuses(ctx),
        processed_count: ctx.processed.len(),
        dlq_count: ctx.dlq.keys().len(),
        dlq_by_severity,
    }
}

pub mod config {
    use super::*;

    pub fn show(ctx: &AppContext) -> Settings {
        ctx.settings.clone()
    }

    /// Loads and validates `config_path` (or defaults + env, when `None`)
    /// without constructing a full [`AppContext`] — `config test` needs to
    /// work even before a mail/KB/vendor implementation exists to wire one.
    pub fn test(config_path: Option<&str>) -> ApiResult<Settings> {
        Ok(Settings::load(config_path)?)
    }
}

pub mod test {
    use super::*;

    /// Validates the effective configuration, then confirms the knowledge
    /// base is reachable with the configured credentials.
    pub async fn validate(ctx: &AppContext) -> ApiResult<()> {
        super::notion::verify(ctx).await
    }

    /// Same fetch `email fetch` performs, kept as a distinct entry point so
    /// a test harness can select a sample batch without it counting toward
    /// `email list`'s processed bookkeeping.
    pub async fn select_emails(ctx: &AppContext, query: &str, limit: usize) -> ApiResult<Vec<RawMessage>> {
        super::email::fetch(ctx, query, limit).await
    }

    /// Runs exactly one pipeline cycle end-to-end and returns its record,
    /// for a harness asserting on real counters rather than mocked ones.
    pub async fn e2e(ctx: &AppContext, companies: Arc<Vec<CompanyRecord>>, workspace_users: Arc<Vec<(String, String)>>, schema: Arc<Schema>) -> ApiResult<RunRecord> {
        let mut runs = super::run(ctx, false, None, companies, workspace_users, schema, CancellationToken::new()).await?;
        runs.pop().ok_or_else(|| ApiError::Validation("run_cycle produced no record".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, Strategy};
    use crate::ports::{FakeKnowledgeBase, FakeLlmVendor, FakeMailSource};
    use crate::telemetry::NoopSink;
    use serde_json::json;

    fn temp_root(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("collabiq-api-test-{}-{}", tag, std::process::id()))
    }

    fn raw(id: &str, body: &str) -> RawMessage {
        RawMessage { id: id.to_string(), sender: "a@example.com".to_string(), subject: "hi".to_string(), body: body.to_string(), received_at: chrono::Utc::now(), attachments: vec![] }
    }

    fn ok_response(person: &str) -> Result<(serde_json::Value, u64, u64), ClassifiedError> {
        Ok((
            json!({"person": person, "startup": "Acme", "details": "seed round", "confidence": {"person": 0.9, "startup": 0.9, "partner": 0.0, "details": 0.8, "date": 0.0}}),
            50,
            30,
        ))
    }

    fn make_ctx(tag: &str, inbox: Vec<RawMessage>, vendor_responses: Vec<Result<(serde_json::Value, u64, u64), ClassifiedError>>) -> (AppContext, std::path::PathBuf) {
        let root = temp_root(tag);
        let mut settings = Settings::default();
        settings.data_root = root.display().to_string();
        settings.providers = vec![ProviderConfig { name: "gemini".to_string(), price_per_million_in: 0.0, price_per_million_out: 0.0 }];
        settings.notion_db_id = "db1".to_string();
        settings.workers = 1;

        let mail: Arc<dyn MailSourcePort> = Arc::new(FakeMailSource::new(inbox));
        let kb: Arc<dyn KnowledgeBasePort> = Arc::new(FakeKnowledgeBase::new(Schema::default()));
        let mut vendors: HashMap<String, Arc<dyn LlmVendorPort>> = HashMap::new();
        vendors.insert("gemini".to_string(), Arc::new(FakeLlmVendor::new(vendor_responses)));
        let telemetry: Arc<dyn TelemetrySink> = Arc::new(NoopSink);

        let ctx = AppContext::build(settings, mail, kb, vendors, telemetry).unwrap();
        (ctx, root)
    }

    #[tokio::test]
    async fn email_fetch_process_and_list_round_trip() {
        let (ctx, root) = make_ctx("email", vec![raw("E1", "Jane Doe discussed a seed round for Acme.")], vec![ok_response("Jane Doe")]);
        let query = ctx.settings.mail_query.clone();
        let fetched = email::fetch(&ctx, &query, 10).await.unwrap();
        assert_eq!(fetched.len(), 1);

        let outcome = email::process(&ctx, fetched.into_iter().next().unwrap(), &[], &[], &Schema::default()).await;
        assert!(matches!(outcome, EmailOutcome::Completed));
        assert_eq!(email::list(&ctx), vec!["E1".to_string()]);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn email_verify_is_read_only_and_does_not_mark_processed() {
        let (ctx, root) = make_ctx("verify", vec![], vec![ok_response("Jane Doe")]);
        let entities = email::verify(&ctx, &raw("E1", "Jane Doe discussed a seed round for Acme."), &Schema::default()).await.unwrap();
        assert_eq!(entities.person.as_deref(), Some("Jane Doe"));
        assert!(!ctx.processed.contains("E1"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn email_verify_rejects_empty_body() {
        let (ctx, root) = make_ctx("verify-empty", vec![], vec![]);
        let result = email::verify(&ctx, &raw("E1", "-- \nsignature only"), &Schema::default()).await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn run_persists_run_record_to_disk() {
        let (ctx, root) = make_ctx("run", vec![raw("E1", "Jane Doe discussed a seed round for Acme.")], vec![ok_response("Jane Doe")]);
        let runs = run(&ctx, false, None, Arc::new(vec![]), Arc::new(vec![]), Arc::new(Schema::default()), CancellationToken::new()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(ctx.run_path(&runs[0].run_id).exists());
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn notion_cleanup_drops_cached_schema() {
        let (ctx, root) = make_ctx("cleanup", vec![], vec![]);
        notion::schema(&ctx, false).await.unwrap();
        let cache_path = root.join("notion_cache").join("schema_db1.json");
        assert!(cache_path.exists());
        notion::cleanup(&ctx);
        assert!(!cache_path.exists());
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn notion_test_write_creates_a_sentinel_record() {
        let (ctx, root) = make_ctx("test-write", vec![], vec![]);
        let record = notion::test_write(&ctx).await.unwrap();
        assert_eq!(record.fields.get("source").and_then(|v| v.as_str()), Some("notion-test-write"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn llm_status_reflects_recorded_attempts() {
        let (ctx, root) = make_ctx("llm-status", vec![], vec![ok_response("Jane")]);
        ctx.orchestrator.extract("body", None, "E1", &Schema::default()).await.unwrap();
        let statuses = llm::status(&ctx);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, "gemini");
        assert!(statuses[0].health.as_ref().unwrap().success_count >= 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn llm_set_strategy_and_quality_routing_take_effect() {
        let (ctx, root) = make_ctx("llm-toggle", vec![], vec![]);
        llm::set_strategy(&ctx, Strategy::BestMatch);
        assert_eq!(ctx.orchestrator.strategy(), Strategy::BestMatch);
        llm::set_quality_routing(&ctx, true);
        assert!(ctx.orchestrator.quality_routing());
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn errors_retry_archives_entry_on_successful_write() {
        let (ctx, root) = make_ctx("errors-retry", vec![], vec![]);
        ctx.dlq
            .record_failure(
                "high",
                "E1",
                "write",
                json!({"startup": "Acme"}),
                crate::domain::DlqError { error_type: "transient".to_string(), message: "timeout".to_string(), http_status: None, retry_count: 1 },
            )
            .unwrap();
        assert_eq!(errors::list(&ctx).len(), 1);

        errors::retry(&ctx, "high", "E1", "write").await.unwrap();
        assert!(errors::list(&ctx).is_empty());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn errors_clear_archives_every_entry_when_no_target_given() {
        let (ctx, root) = make_ctx("errors-clear", vec![], vec![]);
        let failure = || crate::domain::DlqError { error_type: "permanent".to_string(), message: "bad".to_string(), http_status: None, retry_count: 0 };
        ctx.dlq.record_failure("low", "E1", "extract", json!({}), failure()).unwrap();
        ctx.dlq.record_failure("low", "E2", "extract", json!({}), failure()).unwrap();

        let cleared = errors::clear(&ctx, None).unwrap();
        assert_eq!(cleared, 2);
        assert!(ctx.dlq.keys().is_empty());
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn status_reports_processed_and_dlq_counts() {
        let (ctx, root) = make_ctx("status", vec![], vec![]);
        ctx.processed.mark_processed("E1").unwrap();
        ctx.dlq
            .record_failure(
                "medium",
                "E2",
                "extract",
                json!({}),
                crate::domain::DlqError { error_type: "transient".to_string(), message: "busy".to_string(), http_status: None, retry_count: 0 },
            )
            .unwrap();

        let report = status(&ctx);
        assert_eq!(report.processed_count, 1);
        assert_eq!(report.dlq_count, 1);
        assert_eq!(report.dlq_by_severity.get("medium"), Some(&1));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn config_show_returns_the_settings_built_with() {
        let (ctx, root) = make_ctx("config-show", vec![], vec![]);
        assert_eq!(config::show(&ctx).notion_db_id, "db1");
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn config_test_loads_validated_defaults() {
        let settings = config::test(None).unwrap();
        assert_eq!(settings.workers, 4);
    }

    #[tokio::test]
    async fn test_select_emails_does_not_mark_processed() {
        let (ctx, root) = make_ctx("select-emails", vec![raw("E1", "body")], vec![]);
        let query = ctx.settings.mail_query.clone();
        let selected = test::select_emails(&ctx, &query, 10).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert!(!ctx.processed.contains("E1"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_e2e_runs_one_full_cycle() {
        let (ctx, root) = make_ctx("e2e", vec![raw("E1", "Jane Doe discussed a seed round for Acme.")], vec![ok_response("Jane Doe")]);
        let record = test::e2e(&ctx, Arc::new(vec![]), Arc::new(vec![]), Arc::new(Schema::default())).await.unwrap();
        assert_eq!(record.counters.processed, 1);
        std::fs::remove_dir_all(&root).ok();
    }
}
