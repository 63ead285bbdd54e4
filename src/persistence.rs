//! Atomic temp-file + rename persistence for every tracker and store file.
//!
//! Every writer in this crate (health/cost/quality trackers, the DLQ, the
//! processed index) goes through [`write_json_atomic`]/[`read_json_or_default`]
//! instead of writing its own file. Readers tolerate missing or corrupt
//! files by falling back to a default and logging a warning, per the
//! "file-based persistence" re-architecture guidance: a half-written file
//! left by a killed process must never be mistaken for valid state.

use crate::error::CollabError;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Write `value` to `path` via a sibling temp file + rename, so concurrent
/// readers only ever see a fully-written previous or new version.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CollabError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| CollabError::Persistence { path: dir.display().to_string(), source })?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension(format!("{}.tmp", std::process::id()));
    std::fs::write(&tmp_path, &body).map_err(|source| CollabError::Persistence { path: tmp_path.display().to_string(), source })?;
    std::fs::rename(&tmp_path, path).map_err(|source| CollabError::Persistence { path: path.display().to_string(), source })?;
    Ok(())
}

/// Read and deserialize `path`, returning `T::default()` (and logging a
/// warning) if the file is missing or fails to parse.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "persisted file corrupt, using default");
                T::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read persisted file, using default");
            T::default()
        }
    }
}
