//! Processed-email index: consulted before every knowledge-base write so a
//! replayed or re-fetched email never produces a second record.

use crate::error::CollabError;
use crate::persistence::{read_json_or_default, write_json_atomic};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct ProcessedIndex {
    processed: Mutex<HashSet<String>>,
    path: PathBuf,
}

impl ProcessedIndex {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        let path = data_root.as_ref().join("processed_ids.json");
        let processed: HashSet<String> = read_json_or_default(&path);
        Self { processed: Mutex::new(processed), path }
    }

    pub fn contains(&self, email_id: &str) -> bool {
        self.processed.lock().expect("processed index mutex poisoned").contains(email_id)
    }

    /// Mark `email_id` processed, in the same persistence transaction as the
    /// write acknowledgment the caller just received.
    pub fn mark_processed(&self, email_id: &str) -> Result<(), CollabError> {
        let mut processed = self.processed.lock().expect("processed index mutex poisoned");
        processed.insert(email_id.to_string());
        write_json_atomic(&self.path, &*processed)
    }

    pub fn len(&self) -> usize {
        self.processed.lock().expect("processed index mutex poisoned").len()
    }

    /// Every processed email id, for `email list`; no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.processed.lock().expect("processed index mutex poisoned").iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("collabiq-idempotency-test-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn unmarked_email_is_not_processed() {
        let root = temp_root("unmarked");
        let index = ProcessedIndex::new(&root);
        assert!(!index.contains("E1"));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn marking_is_idempotent() {
        let root = temp_root("idempotent");
        let index = ProcessedIndex::new(&root);
        index.mark_processed("E1").unwrap();
        index.mark_processed("E1").unwrap();
        assert_eq!(index.len(), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn persists_across_instances() {
        let root = temp_root("persist");
        {
            let index = ProcessedIndex::new(&root);
            index.mark_processed("E1").unwrap();
        }
        let reloaded = ProcessedIndex::new(&root);
        assert!(reloaded.contains("E1"));
        std::fs::remove_dir_all(&root).ok();
    }
}
