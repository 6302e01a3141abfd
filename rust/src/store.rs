//! Persistence for WID generator state.
//!
//! State is a `{ lastTick, sequence }` record stored under
//! `"<namespace>:wid:<unit>"`. Ticks of different units are not comparable,
//! so `sec` and `ms` generators in one namespace keep separate floors.
//! The in-memory store lives as long as the process; the file store is the
//! durable key-value analogue of browser local storage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::warn;

use crate::wid::TimeUnit;

/// Errors raised by state stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt state file: {0}")]
    Corrupt(String),
}

/// Last-used tick and the sequence issued within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidState {
    pub last_tick: i64,
    pub sequence: i64,
}

impl WidState {
    pub fn is_valid(&self) -> bool {
        self.last_tick >= 0 && self.sequence >= 0
    }
}

/// Storage key for a generator namespace and tick unit.
pub fn state_key(namespace: &str, time_unit: TimeUnit) -> String {
    format!("{namespace}:wid:{}", time_unit.as_str())
}

/// Pluggable load/save of generator state.
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when nothing was saved under `key`.
    fn load(&self, key: &str) -> Result<Option<WidState>, StoreError>;

    fn save(&self, key: &str, state: &WidState) -> Result<(), StoreError>;
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, WidState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<WidState>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).copied())
    }

    fn save(&self, key: &str, state: &WidState) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), *state);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    entries: BTreeMap<String, WidState>,
    #[serde(default)]
    checksum: String,
}

fn entries_checksum(entries: &BTreeMap<String, WidState>) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(entries)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// JSON key-value file holding the state of every namespace.
///
/// The document carries a SHA-256 of its entries so a torn or hand-edited
/// file is reported as corrupt instead of silently lowering the floor.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at `<dir>/wid_state.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("wid_state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where a corrupt state file is moved before it is replaced.
    pub fn quarantine_path(&self) -> PathBuf {
        self.path.with_extension("json.corrupt")
    }

    fn read_document(&self) -> Result<StateDocument, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateDocument::default());
            }
            Err(e) => return Err(e.into()),
        };
        let doc: StateDocument = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))?;
        if doc.checksum != entries_checksum(&doc.entries)? {
            return Err(StoreError::Corrupt(format!(
                "{}: checksum mismatch",
                self.path.display()
            )));
        }
        Ok(doc)
    }

    fn write_document(&self, doc: &StateDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<WidState>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let doc = self.read_document()?;
        Ok(doc.entries.get(key).copied())
    }

    fn save(&self, key: &str, state: &WidState) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        // A corrupt document is moved aside so later saves are not blocked
        // and the other entries stay recoverable by hand.
        let mut doc = match self.read_document() {
            Ok(doc) => doc,
            Err(StoreError::Corrupt(msg)) => {
                let aside = self.quarantine_path();
                fs::rename(&self.path, &aside)?;
                warn!(
                    quarantined = %aside.display(),
                    "corrupt state file moved aside, starting a new one: {msg}"
                );
                StateDocument::default()
            }
            Err(e) => return Err(e),
        };
        doc.entries.insert(key.to_string(), *state);
        doc.checksum = entries_checksum(&doc.entries)?;
        self.write_document(&doc)
    }
}
