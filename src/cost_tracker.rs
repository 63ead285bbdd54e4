//! Per-provider token & USD accounting, persisted atomically after every call.

use crate::domain::ProviderCost;
use crate::error::CollabError;
use crate::persistence::{read_json_or_default, write_json_atomic};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct CostTracker {
    costs: Mutex<HashMap<String, ProviderCost>>,
    path: PathBuf,
}

impl CostTracker {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        let path = data_root.as_ref().join("llm_health").join("cost_metrics.json");
        let costs: HashMap<String, ProviderCost> = read_json_or_default(&path);
        Self { costs: Mutex::new(costs), path }
    }

    /// `cost_usd = in_tokens*price_in + out_tokens*price_out` (prices per
    /// million); free providers pass `0.0` for both prices.
    pub fn record_usage(
        &self,
        provider: &str,
        in_tokens: u64,
        out_tokens: u64,
        price_per_million_in: f64,
        price_per_million_out: f64,
    ) -> Result<(), CollabError> {
        let mut costs = self.costs.lock().expect("cost tracker mutex poisoned");
        let entry = costs.entry(provider.to_string()).or_insert_with(|| ProviderCost::new(provider));
        entry.calls += 1;
        entry.in_tokens += in_tokens;
        entry.out_tokens += out_tokens;
        let call_cost = (in_tokens as f64 / 1_000_000.0) * price_per_million_in + (out_tokens as f64 / 1_000_000.0) * price_per_million_out;
        entry.cost_usd += call_cost;
        entry.avg_cost_per_call = entry.cost_usd / entry.calls as f64;
        entry.updated_at = chrono::Utc::now();
        write_json_atomic(&self.path, &*costs)
    }

    pub fn snapshot(&self) -> HashMap<String, ProviderCost> {
        self.costs.lock().expect("cost tracker mutex poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("collabiq-cost-test-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn computes_cost_from_per_million_prices() {
        let root = temp_root("basic");
        let tracker = CostTracker::new(&root);
        tracker.record_usage("claude", 1_000_000, 1_000_000, 3.0, 15.0).unwrap();
        let snapshot = tracker.snapshot();
        let cost = snapshot.get("claude").unwrap();
        assert!((cost.cost_usd - 18.0).abs() < 1e-9);
        assert!((cost.avg_cost_per_call - 18.0).abs() < 1e-9);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn free_provider_accrues_zero_cost() {
        let root = temp_root("free");
        let tracker = CostTracker::new(&root);
        tracker.record_usage("gemini", 500_000, 500_000, 0.0, 0.0).unwrap();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.get("gemini").unwrap().cost_usd, 0.0);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn avg_cost_per_call_tracks_multiple_calls() {
        let root = temp_root("avg");
        let tracker = CostTracker::new(&root);
        tracker.record_usage("openai", 1_000_000, 0, 2.0, 0.0).unwrap();
        tracker.record_usage("openai", 2_000_000, 0, 2.0, 0.0).unwrap();
        let snapshot = tracker.snapshot();
        let cost = snapshot.get("openai").unwrap();
        assert_eq!(cost.calls, 2);
        assert!((cost.avg_cost_per_call - 3.0).abs() < 1e-9);
        std::fs::remove_dir_all(&root).ok();
    }
}
