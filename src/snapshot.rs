//! Snapshot persistence
//!
//! The whole engine state is one JSON document. Loads tolerate a missing
//! file and missing keys; writes go through a temp file and rename so a
//! crash mid-write never corrupts the previous snapshot.

use crate::engine::EngineState;
use std::path::Path;

#[derive(Debug)]
pub enum SnapshotError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err)
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err)
    }
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Io(e) => write!(f, "IO error: {}", e),
            SnapshotError::Serialization(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Load engine state from the snapshot path. A missing file yields the
/// empty default state; missing document keys are re-initialized by the
/// serde defaults and the post-load normalization pass.
pub fn load_state(path: &Path) -> Result<EngineState, SnapshotError> {
    if !path.exists() {
        log::info!("no existing snapshot at {}", path.display());
        return Ok(EngineState::default());
    }
    let json = std::fs::read_to_string(path)?;
    let mut state: EngineState = serde_json::from_str(&json)?;
    state.normalize();
    log::info!(
        "loaded snapshot: {} sessions, {} item keys, {} queries",
        state.sessions.len(),
        state.item_events.len(),
        state.queries.len()
    );
    Ok(state)
}

/// Write the serialized snapshot atomically: temp file in the same
/// directory, then rename over the target.
pub fn write_atomic(path: &Path, json: &[u8]) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
