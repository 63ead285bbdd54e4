//! Composes Strategy x RetryExecutor x CircuitBreaker x Trackers into one
//! `extract` call over however many LLM vendors the caller configured.
//!
//! Each configured provider carries its own [`ResiliencePipeline`] (bulkhead
//! + retry + breaker), built once at startup from [`crate::config::Settings`]
//! and shared [`HealthTracker`]/[`CostTracker`]/[`QualityTracker`] instances.

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::{Settings, Strategy};
use crate::cost_tracker::CostTracker;
use crate::domain::ExtractedEntities;
use crate::error::{ClassifiedError, CollabError};
use crate::health_tracker::HealthTracker;
use crate::ports::{LlmVendorPort, Schema};
use crate::provider_adapter::ProviderAdapter;
use crate::quality_tracker::QualityTracker;
use crate::retry_executor::RetryConfig;
use crate::stack::ResiliencePipeline;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One configured provider: its adapter plus the resilience envelope it runs
/// every call through.
pub struct ProviderEntry {
    pub adapter: ProviderAdapter,
    pub pipeline: ResiliencePipeline,
}

/// Construction inputs for one provider, consumed by
/// [`ProviderOrchestrator::build`]. Kept separate from [`ProviderEntry`] so
/// the breaker itself is always sourced from the shared `HealthTracker`
/// registry rather than built ad hoc by the caller — `HealthTracker::allow`
/// and the provider's `ResiliencePipeline` must share the exact same
/// [`crate::circuit_breaker::CircuitBreakerPolicy`] instance, or the health
/// check in `failover` never reflects the breaker that actually gates calls.
pub struct ProviderSpec {
    pub name: &'static str,
    pub vendor: Arc<dyn LlmVendorPort>,
    pub price_per_million_in: f64,
    pub price_per_million_out: f64,
    pub retry_config: RetryConfig,
    pub breaker_config: CircuitBreakerConfig,
    pub bulkhead_capacity: usize,
}

pub struct ProviderOrchestrator {
    providers: Vec<ProviderEntry>,
    health: Arc<HealthTracker>,
    cost: Arc<CostTracker>,
    quality: Arc<QualityTracker>,
    quality_routing: AtomicBool,
    /// Switchable at runtime by `llm set-strategy` (§6) without rebuilding
    /// the provider pipelines/breakers that `build` constructed once.
    strategy: Mutex<Strategy>,
}

#[derive(Clone)]
struct Attempt {
    provider: String,
    entities: ExtractedEntities,
}

impl ProviderOrchestrator {
    pub fn new(
        providers: Vec<ProviderEntry>,
        health: Arc<HealthTracker>,
        cost: Arc<CostTracker>,
        quality: Arc<QualityTracker>,
        quality_routing: bool,
        strategy: Strategy,
    ) -> Self {
        Self { providers, health, cost, quality, quality_routing: AtomicBool::new(quality_routing), strategy: Mutex::new(strategy) }
    }

    pub fn strategy(&self) -> Strategy {
        *self.strategy.lock().expect("orchestrator strategy mutex poisoned")
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.lock().expect("orchestrator strategy mutex poisoned") = strategy;
    }

    pub fn quality_routing(&self) -> bool {
        self.quality_routing.load(Ordering::Relaxed)
    }

    pub fn set_quality_routing(&self, enabled: bool) {
        self.quality_routing.store(enabled, Ordering::Relaxed);
    }

    /// Builds one `ProviderEntry` per spec, obtaining each breaker from
    /// `health`'s registry (§4.2, §4.3) so `failover`'s `health.allow(name)`
    /// pre-check and the breaker each pipeline actually executes calls
    /// through are the same shared instance.
    pub fn build(
        specs: Vec<ProviderSpec>,
        health: Arc<HealthTracker>,
        cost: Arc<CostTracker>,
        quality: Arc<QualityTracker>,
        quality_routing: bool,
        strategy: Strategy,
    ) -> Self {
        let providers = specs
            .into_iter()
            .map(|spec| {
                let breaker = health.breaker_with_config(spec.name, spec.breaker_config);
                let adapter = ProviderAdapter::new(spec.name, spec.vendor, spec.price_per_million_in, spec.price_per_million_out);
                let pipeline = ResiliencePipeline::new(spec.name, spec.retry_config, breaker, BulkheadPolicy::new(spec.bulkhead_capacity));
                ProviderEntry { adapter, pipeline }
            })
            .collect();
        Self::new(providers, health, cost, quality, quality_routing, strategy)
    }

    /// Builds an orchestrator straight from a loaded [`Settings`] and a map
    /// of vendor implementations keyed by provider name (the wire-level SDK
    /// clients themselves are out of scope for this crate, §1). Every
    /// `settings.providers` entry must have a matching vendor, or this
    /// returns a `CollabError::Config`. Provider names are leaked to
    /// `&'static str` once at process startup, matching the rest of the
    /// resilience layer's `service: &'static str` convention, which is safe
    /// since `settings.providers` is fixed for the life of a run.
    pub fn from_settings(
        settings: &Settings,
        vendors: &HashMap<String, Arc<dyn LlmVendorPort>>,
        health: Arc<HealthTracker>,
        cost: Arc<CostTracker>,
        quality: Arc<QualityTracker>,
    ) -> Result<Self, CollabError> {
        let mut specs = Vec::with_capacity(settings.providers.len());
        for provider in &settings.providers {
            let vendor = vendors
                .get(&provider.name)
                .cloned()
                .ok_or_else(|| CollabError::Config(format!("no vendor configured for provider '{}'", provider.name)))?;
            let name: &'static str = Box::leak(provider.name.clone().into_boxed_str());
            specs.push(ProviderSpec {
                name,
                vendor,
                price_per_million_in: provider.price_per_million_in,
                price_per_million_out: provider.price_per_million_out,
                retry_config: RetryConfig::new(3, Duration::from_millis(200), Duration::from_secs(5)),
                breaker_config: CircuitBreakerConfig::default_service(),
                bulkhead_capacity: 8,
            });
        }
        Ok(Self::build(specs, health, cost, quality, settings.quality_routing, settings.strategy))
    }

    pub async fn extract(&self, cleaned_text: &str, context: Option<&str>, email_id: &str, schema: &Schema) -> Result<ExtractedEntities, ClassifiedError> {
        match self.strategy() {
            Strategy::Failover => self.failover(cleaned_text, context, email_id, schema).await,
            Strategy::Consensus => self.consensus(cleaned_text, context, email_id, schema).await,
            Strategy::BestMatch => self.best_match(cleaned_text, context, email_id, schema).await,
            Strategy::AllProviders => self.all_providers(cleaned_text, context, email_id, schema).await,
        }
    }

    fn costs_by_name(&self) -> HashMap<String, f64> {
        let costs = self.cost.snapshot();
        self.providers
            .iter()
            .map(|p| (p.adapter.name.to_string(), costs.get(p.adapter.name).map(|c| c.avg_cost_per_call).unwrap_or(0.0)))
            .collect()
    }

    /// Quality-selected top, then the configured priority list minus that
    /// top; falls back to configured order when quality routing is off or no
    /// provider has metrics yet.
    fn failover_order(&self) -> Vec<&ProviderEntry> {
        let configured: Vec<&ProviderEntry> = self.providers.iter().collect();
        if !self.quality_routing() {
            return configured;
        }
        let names: Vec<String> = configured.iter().map(|p| p.adapter.name.to_string()).collect();
        let costs = self.costs_by_name();
        match self.quality.select_by_quality(&names, &costs) {
            Some(top) => {
                let mut ordered: Vec<&ProviderEntry> = configured.iter().copied().filter(|p| p.adapter.name != top).collect();
                if let Some(top_entry) = configured.iter().find(|p| p.adapter.name == top) {
                    ordered.insert(0, top_entry);
                }
                ordered
            }
            None => configured,
        }
    }

    async fn failover(&self, cleaned_text: &str, context: Option<&str>, email_id: &str, schema: &Schema) -> Result<ExtractedEntities, ClassifiedError> {
        let order = self.failover_order();
        let mut last_err = ClassifiedError::permanent("no providers configured");
        for entry in order {
            if !self.health.allow(entry.adapter.name) {
                continue;
            }
            match self.attempt(entry, cleaned_text, context, email_id, schema).await {
                Ok(entities) => return Ok(entities),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Invokes every healthy provider concurrently, returning all successful attempts.
    async fn attempt_all_healthy(&self, cleaned_text: &str, context: Option<&str>, email_id: &str, schema: &Schema) -> Vec<Attempt> {
        let futures = self.providers.iter().filter(|entry| self.health.allow(entry.adapter.name)).map(|entry| async move {
            self.attempt(entry, cleaned_text, context, email_id, schema).await.ok().map(|entities| Attempt { provider: entry.adapter.name.to_string(), entities })
        });
        futures::future::join_all(futures).await.into_iter().flatten().collect()
    }

    /// Majority vote per field, breaking ties by higher per-field confidence.
    async fn consensus(&self, cleaned_text: &str, context: Option<&str>, email_id: &str, schema: &Schema) -> Result<ExtractedEntities, ClassifiedError> {
        let attempts = self.attempt_all_healthy(cleaned_text, context, email_id, schema).await;
        let Some(first) = attempts.first() else {
            return Err(ClassifiedError::critical("no provider produced a result"));
        };

        let (person, person_conf) = vote(attempts.iter().map(|a| (a.entities.person.clone(), a.entities.confidence.person)));
        let (startup, startup_conf) = vote(attempts.iter().map(|a| (a.entities.startup.clone(), a.entities.confidence.startup)));
        let (partner, partner_conf) = vote(attempts.iter().map(|a| (a.entities.partner.clone(), a.entities.confidence.partner)));
        let (details, details_conf) = vote(attempts.iter().map(|a| (a.entities.details.clone(), a.entities.confidence.details)));
        let (date, date_conf) = vote(attempts.iter().map(|a| (a.entities.date.map(|d| d.format("%Y-%m-%d").to_string()), a.entities.confidence.date)));

        Ok(ExtractedEntities {
            person,
            startup,
            partner,
            details,
            date: date.and_then(|s| chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
            confidence: crate::domain::FieldConfidence { person: person_conf, startup: startup_conf, partner: partner_conf, details: details_conf, date: date_conf },
            provider: "consensus".to_string(),
            email_id: email_id.to_string(),
            extracted_at: first.entities.extracted_at,
        })
    }

    async fn best_match(&self, cleaned_text: &str, context: Option<&str>, email_id: &str, schema: &Schema) -> Result<ExtractedEntities, ClassifiedError> {
        let attempts = self.attempt_all_healthy(cleaned_text, context, email_id, schema).await;
        attempts
            .into_iter()
            .max_by(|a, b| a.entities.confidence.overall().partial_cmp(&b.entities.confidence.overall()).unwrap_or(std::cmp::Ordering::Equal))
            .map(|a| a.entities)
            .ok_or_else(|| ClassifiedError::critical("no provider produced a result"))
    }

    /// Like `best_match`, but every attempted provider's quality metrics are
    /// already recorded by `attempt`; the result returned is the provider
    /// with the best standing `quality_score`, not necessarily this call's
    /// highest-confidence attempt (per the resolved Open Question).
    async fn all_providers(&self, cleaned_text: &str, context: Option<&str>, email_id: &str, schema: &Schema) -> Result<ExtractedEntities, ClassifiedError> {
        let attempts = self.attempt_all_healthy(cleaned_text, context, email_id, schema).await;
        if attempts.is_empty() {
            return Err(ClassifiedError::critical("no provider produced a result"));
        }
        let names: Vec<String> = attempts.iter().map(|a| a.provider.clone()).collect();
        let costs = self.costs_by_name();
        let winner = self.quality.select_by_quality(&names, &costs);
        let chosen = match winner {
            Some(name) => attempts.clone().into_iter().find(|a| a.provider == name),
            None => None,
        };
        match chosen {
            Some(a) => Ok(a.entities),
            None => attempts_best_effort(attempts),
        }
    }

    async fn attempt(&self, entry: &ProviderEntry, cleaned_text: &str, context: Option<&str>, email_id: &str, schema: &Schema) -> Result<ExtractedEntities, ClassifiedError> {
        let started = Instant::now();
        let adapter = entry.adapter.clone();
        let cleaned_text = cleaned_text.to_string();
        let context = context.map(str::to_string);
        let email_id = email_id.to_string();
        let schema = schema.clone();
        let result = entry
            .pipeline
            .execute(move || {
                let adapter = adapter.clone();
                let cleaned_text = cleaned_text.clone();
                let context = context.clone();
                let email_id = email_id.clone();
                let schema = schema.clone();
                async move { adapter.extract(&cleaned_text, context.as_deref(), &schema, &email_id).await.map(|(entities, usage)| (entities, usage.in_tokens, usage.out_tokens)) }
            })
            .await;

        match result {
            Ok((entities, in_tokens, out_tokens)) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                let _ = self.health.record_success(entry.adapter.name, latency_ms);
                let _ = self.cost.record_usage(entry.adapter.name, in_tokens, out_tokens, entry.adapter.price_per_million_in, entry.adapter.price_per_million_out);
                let _ = self.quality.record_extraction(entry.adapter.name, &entities, true);
                Ok(entities)
            }
            Err(e) => {
                let _ = self.health.record_failure(entry.adapter.name, &e.message);
                Err(e)
            }
        }
    }
}

/// Picks any attempt when the quality tracker has no standing for the group
/// (e.g. the very first run, before any provider has metrics).
fn attempts_best_effort(attempts: Vec<Attempt>) -> Result<ExtractedEntities, ClassifiedError> {
    attempts.into_iter().next().map(|a| a.entities).ok_or_else(|| ClassifiedError::critical("no provider produced a result"))
}

/// Groups `(value, confidence)` pairs by value, returns the majority value
/// (ties broken by the higher mean confidence within the group) and the
/// mean confidence of the contributing members.
fn vote<T: Clone + PartialEq>(items: impl Iterator<Item = (Option<T>, f64)>) -> (Option<T>, f64) {
    let mut groups: Vec<(Option<T>, Vec<f64>)> = Vec::new();
    for (value, confidence) in items {
        match groups.iter_mut().find(|(v, _)| *v == value) {
            Some((_, confs)) => confs.push(confidence),
            None => groups.push((value, vec![confidence])),
        }
    }
    groups
        .into_iter()
        .max_by(|(_, a), (_, b)| {
            let count = a.len().cmp(&b.len());
            if count != std::cmp::Ordering::Equal {
                return count;
            }
            let mean_a = a.iter().sum::<f64>() / a.len() as f64;
            let mean_b = b.iter().sum::<f64>() / b.len() as f64;
            mean_a.partial_cmp(&mean_b).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(value, confs)| (value, confs.iter().sum::<f64>() / confs.len() as f64))
        .unwrap_or((None, 0.0))
}
