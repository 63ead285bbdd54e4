//! Per-provider extraction quality: running confidence/completeness stats
//! via Welford's recurrence, validation counters, and a trend signal over
//! the last 50 extractions.

use crate::domain::{ExtractedEntities, ProviderQuality, Trend};
use crate::error::CollabError;
use crate::persistence::{read_json_or_default, write_json_atomic};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TREND_WINDOW: usize = 50;
const TREND_HALF: usize = 25;
const TREND_THRESHOLD: f64 = 0.05;

#[derive(Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }
}

struct ProviderState {
    quality: ProviderQuality,
    confidence_stats: RunningStats,
    completeness_mean: f64,
    fields_mean: f64,
    per_field_stats: [RunningStats; 5],
    confidence_window: VecDeque<f64>,
}

impl ProviderState {
    fn new(name: &str) -> Self {
        Self {
            quality: ProviderQuality::new(name),
            confidence_stats: RunningStats::default(),
            completeness_mean: 0.0,
            fields_mean: 0.0,
            per_field_stats: Default::default(),
            confidence_window: VecDeque::with_capacity(TREND_WINDOW),
        }
    }
}

pub struct QualityTracker {
    providers: Mutex<HashMap<String, ProviderState>>,
    path: PathBuf,
}

impl QualityTracker {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        let path = data_root.as_ref().join("llm_health").join("quality_metrics.json");
        let persisted: HashMap<String, ProviderQuality> = read_json_or_default(&path);
        let providers = persisted
            .into_iter()
            .map(|(name, quality)| {
                let mut state = ProviderState::new(&name);
                state.quality = quality;
                (name, state)
            })
            .collect();
        Self { providers: Mutex::new(providers), path }
    }

    pub fn record_extraction(&self, provider: &str, entities: &ExtractedEntities, validation_passed: bool) -> Result<(), CollabError> {
        let mut providers = self.providers.lock().expect("quality tracker mutex poisoned");
        let state = providers.entry(provider.to_string()).or_insert_with(|| ProviderState::new(provider));

        let overall = entities.confidence.overall();
        let completeness = entities.completeness();
        let fields_extracted = entities.fields_extracted() as f64;

        state.confidence_stats.update(overall);
        state.quality.extractions += 1;
        let n = state.quality.extractions as f64;
        state.completeness_mean += (completeness - state.completeness_mean) / n;
        state.fields_mean += (fields_extracted - state.fields_mean) / n;

        for (stat, value) in state.per_field_stats.iter_mut().zip(entities.confidence.as_array()) {
            stat.update(value);
        }

        if validation_passed {
            state.quality.validations_passed += 1;
        } else {
            state.quality.validations_failed += 1;
        }

        if state.confidence_window.len() == TREND_WINDOW {
            state.confidence_window.pop_front();
        }
        state.confidence_window.push_back(overall);

        state.quality.avg_confidence = state.confidence_stats.mean;
        state.quality.stddev_confidence = state.confidence_stats.variance().sqrt();
        state.quality.avg_completeness = state.completeness_mean;
        state.quality.avg_fields_extracted = state.fields_mean;
        for (i, stat) in state.per_field_stats.iter().enumerate() {
            state.quality.per_field_avg_confidence[i] = stat.mean;
        }
        state.quality.trend = compute_trend(&state.confidence_window);
        state.quality.last_updated = chrono::Utc::now();

        self.persist(&providers)
    }

    /// Returns the provider with the highest quality score among those with
    /// at least one recorded extraction, breaking ties by lower average
    /// cost; `None` if no provider qualifies.
    pub fn select_by_quality(&self, candidates: &[String], costs: &HashMap<String, f64>) -> Option<String> {
        let providers = self.providers.lock().expect("quality tracker mutex poisoned");
        candidates
            .iter()
            .filter_map(|name| providers.get(name).filter(|s| s.quality.extractions > 0).map(|s| (name.clone(), s.quality.quality_score())))
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        let cost_a = costs.get(&a.0).copied().unwrap_or(f64::MAX);
                        let cost_b = costs.get(&b.0).copied().unwrap_or(f64::MAX);
                        cost_b.partial_cmp(&cost_a).unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
            .map(|(name, _)| name)
    }

    pub fn snapshot(&self) -> HashMap<String, ProviderQuality> {
        self.providers.lock().expect("quality tracker mutex poisoned").iter().map(|(k, v)| (k.clone(), v.quality.clone())).collect()
    }

    fn persist(&self, providers: &HashMap<String, ProviderState>) -> Result<(), CollabError> {
        let snapshot: HashMap<String, ProviderQuality> = providers.iter().map(|(k, v)| (k.clone(), v.quality.clone())).collect();
        write_json_atomic(&self.path, &snapshot)
    }
}

/// `improving`/`degrading` if the mean of the last 25 samples differs from
/// the mean of the previous 25 by more than 0.05; `stable` otherwise or
/// while the window hasn't filled.
fn compute_trend(window: &VecDeque<f64>) -> Trend {
    if window.len() < TREND_WINDOW {
        return Trend::Stable;
    }
    let samples: Vec<f64> = window.iter().copied().collect();
    let previous: f64 = samples[..TREND_HALF].iter().sum::<f64>() / TREND_HALF as f64;
    let recent: f64 = samples[TREND_HALF..].iter().sum::<f64>() / TREND_HALF as f64;
    let diff = recent - previous;
    if diff > TREND_THRESHOLD {
        Trend::Improving
    } else if diff < -TREND_THRESHOLD {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}
