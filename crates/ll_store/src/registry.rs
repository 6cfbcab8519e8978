//! Durable map of display name -> `DatabaseRecord`.
//!
//! Records are never deleted. Every replaced version is appended to history, so a
//! superseded address can still be resolved to the list it became.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ll_proto::DatabaseRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::StoreError;

pub trait Registry: Send + Sync {
    fn get(&self, display_name: &str) -> Result<Option<DatabaseRecord>, StoreError>;

    /// Current record for `address`, following supersession from historical addresses.
    fn find_by_address(&self, address: &str) -> Result<Option<DatabaseRecord>, StoreError>;

    /// Insert or replace; a replaced record goes to history.
    fn put(&self, record: DatabaseRecord) -> Result<(), StoreError>;

    /// Replace the record for `new.display_name` and file `old` (already marked
    /// `superseded_by`) in history, in one write.
    fn supersede(&self, old: DatabaseRecord, new: DatabaseRecord) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<DatabaseRecord>, StoreError>;

    fn history(&self, display_name: &str) -> Result<Vec<DatabaseRecord>, StoreError>;

    /// Look up by display name, then by address.
    fn resolve(&self, database_id: &str) -> Result<Option<DatabaseRecord>, StoreError> {
        match self.get(database_id)? {
            Some(record) => Ok(Some(record)),
            None => self.find_by_address(database_id),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    records: BTreeMap<String, DatabaseRecord>,
    #[serde(default)]
    history: Vec<DatabaseRecord>,
}

impl RegistryState {
    fn find_by_address(&self, address: &str) -> Option<DatabaseRecord> {
        if let Some(record) = self.records.values().find(|r| r.address == address) {
            return Some(record.clone());
        }
        let old = self
            .history
            .iter()
            .rev()
            .find(|r| r.address == address && r.superseded_by.is_some())?;
        self.records.get(&old.display_name).cloned()
    }

    /// Journal-only changes (`pending_migration`) do not produce a history entry.
    fn put(&mut self, mut record: DatabaseRecord) {
        record.updated_at = Utc::now();
        let changed = self
            .records
            .get(&record.display_name)
            .map(|previous| !same_version(previous, &record));
        if let Some(mut previous) = self.records.insert(record.display_name.clone(), record) {
            if changed.unwrap_or(false) {
                previous.pending_migration = None;
                self.history.push(previous);
            }
        }
    }

    fn supersede(&mut self, old: DatabaseRecord, mut new: DatabaseRecord) {
        new.updated_at = Utc::now();
        self.records.insert(new.display_name.clone(), new);
        self.history.push(old);
    }

    fn history(&self, display_name: &str) -> Vec<DatabaseRecord> {
        self.history
            .iter()
            .filter(|r| r.display_name == display_name)
            .cloned()
            .collect()
    }
}

fn same_version(a: &DatabaseRecord, b: &DatabaseRecord) -> bool {
    a.address == b.address
        && a.encryption_enabled == b.encryption_enabled
        && a.encryption_method == b.encryption_method
        && a.epoch == b.epoch
        && a.threshold_policy == b.threshold_policy
        && a.kdf == b.kdf
        && a.key_ref == b.key_ref
        && a.superseded_by == b.superseded_by
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for MemoryRegistry {
    fn get(&self, display_name: &str) -> Result<Option<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().records.get(display_name).cloned())
    }

    fn find_by_address(&self, address: &str) -> Result<Option<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().find_by_address(address))
    }

    fn put(&self, record: DatabaseRecord) -> Result<(), StoreError> {
        self.state.lock().put(record);
        Ok(())
    }

    fn supersede(&self, old: DatabaseRecord, new: DatabaseRecord) -> Result<(), StoreError> {
        self.state.lock().supersede(old, new);
        Ok(())
    }

    fn list(&self) -> Result<Vec<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    fn history(&self, display_name: &str) -> Result<Vec<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().history(display_name))
    }
}

/// Registry persisted as one JSON document, rewritten atomically on every mutation.
pub struct JsonRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

impl JsonRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            RegistryState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, state: &RegistryState) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(state)?)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut RegistryState)) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        f(&mut next);
        self.write(&next)?;
        *state = next;
        Ok(())
    }
}

impl Registry for JsonRegistry {
    fn get(&self, display_name: &str) -> Result<Option<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().records.get(display_name).cloned())
    }

    fn find_by_address(&self, address: &str) -> Result<Option<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().find_by_address(address))
    }

    fn put(&self, record: DatabaseRecord) -> Result<(), StoreError> {
        self.mutate(|state| state.put(record))
    }

    fn supersede(&self, old: DatabaseRecord, new: DatabaseRecord) -> Result<(), StoreError> {
        self.mutate(|state| state.supersede(old, new))
    }

    fn list(&self) -> Result<Vec<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    fn history(&self, display_name: &str) -> Result<Vec<DatabaseRecord>, StoreError> {
        Ok(self.state.lock().history(display_name))
    }
}
