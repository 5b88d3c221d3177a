//! Durable scan progress.
//!
//! The state file is JSON `{version, last_scanned_block, processed_transactions}`. Writes go to
//! `<path>.tmp`, are synced, then renamed over `<path>`, so a crash leaves either the old or the
//! new state readable. An unknown `version` is a configuration error, never a silent reset.

use crate::error::{ConfigurationError, PersistenceError, ScanError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Schema version written by this build.
pub const STATE_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u64,
    pub last_scanned_block: u64,
    pub processed_transactions: Vec<String>,
}

impl PersistedState {
    pub fn new(last_scanned_block: u64, processed_transactions: Vec<String>) -> Self {
        Self {
            version: STATE_VERSION,
            last_scanned_block,
            processed_transactions,
        }
    }
}

pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when no state has been saved yet.
    fn load(&self) -> Result<Option<PersistedState>, ScanError>;

    /// Either fully lands or leaves the previous state readable.
    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u64,
}

/// Parse a state file body, checking the version before the rest of the schema.
pub fn decode_state(contents: &str) -> Result<PersistedState, ScanError> {
    let header: VersionHeader =
        serde_json::from_str(contents).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
    if header.version != STATE_VERSION {
        return Err(ConfigurationError::UnsupportedStateVersion {
            found: header.version,
            expected: STATE_VERSION,
        }
        .into());
    }
    let state = serde_json::from_str(contents).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
    Ok(state)
}

/// JSON file store with atomic replace.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<PersistedState>, ScanError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.display().to_string(),
                    source,
                }
                .into())
            }
        };
        let state = decode_state(&contents)?;
        tracing::info!(
            path = %self.path.display(),
            last_scanned_block = state.last_scanned_block,
            processed = state.processed_transactions.len(),
            "loaded state"
        );
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let write_err = |path: &Path, source: std::io::Error| PersistenceError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).map_err(|e| write_err(temp.as_path(), e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| write_err(temp.as_path(), e))?;
        file.sync_all().map_err(|e| write_err(temp.as_path(), e))?;
        drop(file);
        fs::rename(&temp, &self.path).map_err(|source| PersistenceError::Rename {
            from: temp.display().to_string(),
            to: self.path.display().to_string(),
            source,
        })?;
        tracing::debug!(
            path = %self.path.display(),
            last_scanned_block = state.last_scanned_block,
            "saved state"
        );
        Ok(())
    }
}

/// In-memory store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<Option<PersistedState>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(state))),
        }
    }

    /// Last saved state.
    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<PersistedState>, ScanError> {
        let state = self.snapshot();
        if let Some(s) = &state {
            if s.version != STATE_VERSION {
                return Err(ConfigurationError::UnsupportedStateVersion {
                    found: s.version,
                    expected: STATE_VERSION,
                }
                .into());
            }
        }
        Ok(state)
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }
}
