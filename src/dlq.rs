//! Dead-letter queue: persists failed write payloads keyed by
//! `(email_id, stage)`, with a replay API for operator-triggered retries.

use crate::domain::{DlqEntry, DlqError};
use crate::error::{ClassifiedError, CollabError};
use crate::persistence::write_json_atomic;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct Dlq {
    root: PathBuf,
    index: Mutex<Vec<(String, String, String)>>,
}

fn entry_path(root: &Path, severity: &str, email_id: &str, stage: &str) -> PathBuf {
    root.join(severity).join(format!("{email_id}_{stage}.json"))
}

impl Dlq {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        let root = data_root.as_ref().join("dlq");
        let mut index = Vec::new();
        if let Ok(severities) = std::fs::read_dir(&root) {
            for severity_dir in severities.flatten() {
                let Some(severity) = severity_dir.file_name().to_str().map(str::to_string) else { continue };
                if let Ok(entries) = std::fs::read_dir(severity_dir.path()) {
                    for entry in entries.flatten() {
                        if let Some(name) = entry.file_name().to_str() {
                            if let Some((email_id, stage)) = name.trim_end_matches(".json").rsplit_once('_') {
                                index.push((severity.clone(), email_id.to_string(), stage.to_string()));
                            }
                        }
                    }
                }
            }
        }
        Self { root, index: Mutex::new(index) }
    }

    /// Append (or overwrite, on a later failure for the same key) a DLQ entry.
    pub fn record_failure(
        &self,
        severity: &str,
        email_id: &str,
        stage: &str,
        payload: serde_json::Value,
        error: DlqError,
    ) -> Result<DlqEntry, CollabError> {
        let now = chrono::Utc::now();
        let entry = DlqEntry {
            dlq_id: format!("{email_id}_{stage}"),
            email_id: email_id.to_string(),
            stage: stage.to_string(),
            payload,
            error,
            first_failed_at: now,
            last_attempt_at: now,
        };
        write_json_atomic(&entry_path(&self.root, severity, email_id, stage), &entry)?;
        let mut index = self.index.lock().expect("dlq index mutex poisoned");
        index.retain(|(_, e, s)| !(e == email_id && s == stage));
        index.push((severity.to_string(), email_id.to_string(), stage.to_string()));
        Ok(entry)
    }

    /// Archive (delete) the on-disk entry for `(email_id, stage)` after a
    /// successful replay.
    pub fn archive(&self, severity: &str, email_id: &str, stage: &str) -> Result<(), CollabError> {
        let path = entry_path(&self.root, severity, email_id, stage);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| CollabError::Persistence { path: path.display().to_string(), source })?;
        }
        let mut index = self.index.lock().expect("dlq index mutex poisoned");
        index.retain(|(_, e, s)| !(e == email_id && s == stage));
        Ok(())
    }

    /// Every currently dead-lettered `(severity, email_id, stage)` key.
    pub fn keys(&self) -> Vec<(String, String, String)> {
        self.index.lock().expect("dlq index mutex poisoned").clone()
    }

    /// Every currently dead-lettered entry, read back off disk. Entries that
    /// fail to read (e.g. removed out-of-band) are skipped rather than
    /// failing the whole listing.
    pub fn list(&self) -> Vec<DlqEntry> {
        self.keys()
            .into_iter()
            .filter_map(|(severity, email_id, stage)| self.read_entry(&severity, &email_id, &stage).ok())
            .collect()
    }

    fn read_entry(&self, severity: &str, email_id: &str, stage: &str) -> Result<DlqEntry, CollabError> {
        let path = entry_path(&self.root, severity, email_id, stage);
        let raw = std::fs::read_to_string(&path).map_err(|source| CollabError::Persistence { path: path.display().to_string(), source })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Reconstructs the stored payload for `(email_id, stage)` and hands it
    /// to `writer` (§4.9). On success the entry is archived; on failure it is
    /// re-persisted with `last_attempt_at` refreshed and `retry_count`
    /// incremented, and stays in the index for a later retry.
    pub async fn replay<F, Fut>(&self, severity: &str, email_id: &str, stage: &str, writer: F) -> Result<(), CollabError>
    where
        F: FnOnce(serde_json::Value) -> Fut,
        Fut: Future<Output = Result<(), ClassifiedError>>,
    {
        let mut entry = self.read_entry(severity, email_id, stage)?;
        match writer(entry.payload.clone()).await {
            Ok(()) => self.archive(severity, email_id, stage),
            Err(e) => {
                entry.last_attempt_at = chrono::Utc::now();
                entry.error.retry_count += 1;
                entry.error.message = e.message;
                write_json_atomic(&entry_path(&self.root, severity, email_id, stage), &entry)?;
                Err(CollabError::External(format!("replay of {email_id}/{stage} failed: {}", entry.error.message)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("collabiq-dlq-test-{}-{}", tag, std::process::id()))
    }

    fn err() -> DlqError {
        DlqError { error_type: "transient".to_string(), message: "timeout".to_string(), http_status: None, retry_count: 2 }
    }

    #[test]
    fn record_then_archive_removes_from_index() {
        let root = temp_root("archive");
        let dlq = Dlq::new(&root);
        dlq.record_failure("high", "E1", "write", serde_json::json!({"a": 1}), err()).unwrap();
        assert_eq!(dlq.keys(), vec![("high".to_string(), "E1".to_string(), "write".to_string())]);

        dlq.archive("high", "E1", "write").unwrap();
        assert!(dlq.keys().is_empty());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn later_failure_overwrites_same_key() {
        let root = temp_root("overwrite");
        let dlq = Dlq::new(&root);
        dlq.record_failure("medium", "E2", "write", serde_json::json!({"a": 1}), err()).unwrap();
        dlq.record_failure("medium", "E2", "write", serde_json::json!({"a": 2}), err()).unwrap();
        assert_eq!(dlq.keys().len(), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn reloading_from_disk_rebuilds_index() {
        let root = temp_root("reload");
        {
            let dlq = Dlq::new(&root);
            dlq.record_failure("low", "E3", "classify", serde_json::json!({}), err()).unwrap();
        }
        let reloaded = Dlq::new(&root);
        assert_eq!(reloaded.keys(), vec![("low".to_string(), "E3".to_string(), "classify".to_string())]);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn replay_archives_entry_on_successful_writer() {
        let root = temp_root("replay-ok");
        let dlq = Dlq::new(&root);
        dlq.record_failure("high", "E4", "write", serde_json::json!({"company": "Acme"}), err()).unwrap();

        let result = dlq.replay("high", "E4", "write", |payload| async move {
            assert_eq!(payload["company"], "Acme");
            Ok(())
        }).await;

        assert!(result.is_ok());
        assert!(dlq.keys().is_empty());
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn replay_increments_retry_count_and_keeps_entry_on_failure() {
        let root = temp_root("replay-fail");
        let dlq = Dlq::new(&root);
        dlq.record_failure("high", "E5", "write", serde_json::json!({}), err()).unwrap();

        let result = dlq.replay("high", "E5", "write", |_| async { Err(ClassifiedError::transient("still down")) }).await;

        assert!(result.is_err());
        assert_eq!(dlq.keys(), vec![("high".to_string(), "E5".to_string(), "write".to_string())]);
        let reloaded = dlq.read_entry("high", "E5", "write").unwrap();
        assert_eq!(reloaded.error.retry_count, 3);
        assert_eq!(reloaded.error.message, "still down");
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn replay_of_missing_entry_errors() {
        let root = temp_root("replay-missing");
        let dlq = Dlq::new(&root);
        let result = dlq.replay("high", "nope", "write", |_| async { Ok(()) }).await;
        assert!(result.is_err());
        std::fs::remove_dir_all(&root).ok();
    }
}
