//! Pluggable telemetry sink (§4.12). Every retry attempt, breaker
//! transition, and pipeline stage transition already emits a `tracing`
//! event; a [`TelemetrySink`] additionally lets a caller capture the same
//! events as structured records, e.g. for a JSONL audit trail under
//! `<data_root>/telemetry/<run_id>.jsonl`. The default sink is a no-op so
//! tests never touch disk unless they opt in.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    RetryAttempt { provider: String, attempt: u32, delay_ms: u128 },
    RetryExhausted { provider: String, attempts: u32 },
    BreakerOpened { provider: String, failure_count: u32 },
    BreakerHalfOpen { provider: String },
    BreakerClosed { provider: String },
    StageTransition { email_id: String, stage: String },
    DlqWrite { email_id: String, stage: String, severity: String },
    CriticalFailure { provider: String, message: String },
}

/// Implementors receive every [`TelemetryEvent`] the pipeline emits. Errors
/// are logged and otherwise swallowed: a broken telemetry sink must never
/// fail an email.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, event: TelemetryEvent);
}

/// The default: does nothing. Used whenever a caller doesn't configure a
/// sink.
#[derive(Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    async fn record(&self, _event: TelemetryEvent) {}
}

/// Appends one JSON object per line to `<data_root>/telemetry/<run_id>.jsonl`.
/// Opens the file in append mode on every call rather than holding it open,
/// trading a little overhead for resilience against the directory moving or
/// being rotated out from under a long-running daemon.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(data_root: impl AsRef<Path>, run_id: &str) -> Self {
        Self { path: data_root.as_ref().join("telemetry").join(format!("{run_id}.jsonl")) }
    }
}

#[async_trait]
impl TelemetrySink for JsonlSink {
    async fn record(&self, event: TelemetryEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            tracing::warn!("failed to serialize telemetry event");
            return;
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, "failed to create telemetry directory");
                return;
            }
        }
        let write = async {
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        };
        if let Err(e) = write.await {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to append telemetry event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_sink_accepts_any_event() {
        let sink = NoopSink;
        sink.record(TelemetryEvent::BreakerClosed { provider: "gemini".to_string() }).await;
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_event() {
        let root = std::env::temp_dir().join(format!("collabiq-telemetry-test-{}", std::process::id()));
        let sink = JsonlSink::new(&root, "run-1");
        sink.record(TelemetryEvent::StageTransition { email_id: "E1".to_string(), stage: "Extracted".to_string() }).await;
        sink.record(TelemetryEvent::DlqWrite { email_id: "E1".to_string(), stage: "extract".to_string(), severity: "high".to_string() }).await;

        let contents = tokio::fs::read_to_string(root.join("telemetry").join("run-1.jsonl")).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().contains("stage_transition"));

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
