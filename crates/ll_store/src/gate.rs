//! The encryption gate: decides whether a list can be opened and with which key.
//!
//! Decision order for `open`:
//! 1. Registry record says `none` -> open directly.
//! 2. Record says encrypted -> classify what is synced. The record is authoritative, but
//!    readable or mixed entries under an encrypted record fail closed.
//! 3. Encrypted -> use a live cached credential if one verifies, otherwise
//!    `NeedsCredential` (or the last ceremony failure for threshold lists).
//! 4. No record (cold open by address) -> the classifier decides.
//!
//! `unlock` verifies a credential by opening one sealed entry. Each failure counts; after
//! `max_unlock_attempts` the gate refuses until `reset_attempts`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ll_crypto::SecretKey;
use ll_proto::{entry::index_view, CeremonyPhase, DatabaseRecord, EncryptionMethod, EntryBody, Manifest, StoredEntry};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cipher::{resolve_key, EntryKey};
use crate::classifier::{classify_log, Ambiguous};
use crate::config::StoreConfig;
use crate::credentials::{Credential, CredentialStore};
use crate::error::{GateError, StoreError};
use crate::lease::LeaseTable;
use crate::log::{LogProvider, ReplicatedLog};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An opened list. Reads fold the log into its key-value view.
pub struct Handle {
    database_id: String,
    record: Option<DatabaseRecord>,
    log: Arc<dyn ReplicatedLog>,
    key: Option<EntryKey>,
    mode: OpenMode,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("database_id", &self.database_id)
            .field("address", &self.log.address())
            .field("encrypted", &self.key.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}

impl Handle {
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn address(&self) -> &str {
        self.log.address()
    }

    pub fn record(&self) -> Option<&DatabaseRecord> {
        self.record.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn read(&self, entry: &StoredEntry) -> Result<Option<Value>, StoreError> {
        match (&entry.body, &self.key) {
            (EntryBody::Sealed { .. }, Some(key)) => key.open(entry),
            (EntryBody::Sealed { .. }, None) => Err(StoreError::MissingKey(entry.key.clone())),
            (EntryBody::Plain { value }, _) => Ok(Some(value.clone())),
            (EntryBody::Delete, _) => Ok(None),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.log.entries().await?;
        match index_view(&entries).iter().find(|e| e.key == key) {
            Some(entry) => self.read(entry),
            None => Ok(None),
        }
    }

    /// Every live key with its value, in first-insertion order.
    pub async fn entries(&self) -> Result<Vec<(String, Value)>, StoreError> {
        let entries = self.log.entries().await?;
        let mut out = Vec::new();
        for entry in index_view(&entries) {
            if let Some(value) = self.read(&entry)? {
                out.push((entry.key.clone(), value));
            }
        }
        Ok(out)
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StoreError::ReadOnly(self.database_id.clone()));
        }
        let body = match &self.key {
            Some(entry_key) => entry_key.seal(key, &value)?,
            None => EntryBody::Plain { value },
        };
        self.log.append(key, body).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StoreError::ReadOnly(self.database_id.clone()));
        }
        self.log.append(key, EntryBody::Delete).await?;
        Ok(())
    }
}

pub struct EncryptionGate {
    registry: Arc<dyn Registry>,
    logs: Arc<dyn LogProvider>,
    credentials: Arc<CredentialStore>,
    leases: LeaseTable,
    config: StoreConfig,
    attempts: Mutex<HashMap<String, u32>>,
    ceremony_failures: Mutex<HashMap<String, CeremonyPhase>>,
}

impl EncryptionGate {
    pub fn new(registry: Arc<dyn Registry>, logs: Arc<dyn LogProvider>, config: StoreConfig) -> Self {
        Self {
            registry,
            logs,
            credentials: Arc::new(CredentialStore::new()),
            leases: LeaseTable::new(),
            config,
            attempts: Mutex::new(HashMap::new()),
            ceremony_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<dyn LogProvider> {
        &self.logs
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create an empty unencrypted list, or return the existing record.
    pub async fn create(&self, display_name: &str) -> Result<DatabaseRecord, GateError> {
        if let Some(existing) = self.registry.get(display_name)? {
            return Ok(existing);
        }
        let log = self.logs.create(&Manifest::keyvalue(display_name)).await?;
        let record = DatabaseRecord::new_unencrypted(display_name, log.address());
        self.registry.put(record.clone())?;
        info!(database = display_name, address = log.address(), "list created");
        Ok(record)
    }

    pub async fn open(&self, database_id: &str, mode: OpenMode) -> Result<Handle, GateError> {
        let Some(record) = self.registry.resolve(database_id)? else {
            return self.open_unregistered(database_id, mode).await;
        };
        self.ensure_not_migrating(&record)?;
        let log = self.logs.open(&record.address).await?;

        if !record.is_encrypted() {
            debug!(database = %record.display_name, "registry says unencrypted");
            return Ok(self.handle(record.display_name.clone(), Some(record), log, None, mode));
        }
        self.ensure_method_enabled(record.encryption_method)?;

        let entries = log.entries().await?;
        let classification = classify_log(&entries)?;
        if !classification.encrypted && classification.entries > 0 {
            warn!(database = %record.display_name, "readable entries under an encrypted record");
            return Err(GateError::DetectionAmbiguous(Ambiguous {
                readable: classification.entries,
                cipher_only: 0,
                malformed: 0,
            }));
        }

        let slot = record.display_name.clone();
        if let Some(credential) = self.credentials.get(&slot) {
            match resolve_key(&record, &credential) {
                Ok(key) if key_matches(&record, &key, &entries) => {
                    debug!(database = %slot, "reopened with cached credential");
                    return Ok(self.handle(slot, Some(record), log, Some(key), mode));
                }
                Ok(_) | Err(GateError::StaleSession { .. }) | Err(GateError::CredentialMismatch { .. }) => {
                    debug!(database = %slot, "cached credential no longer valid");
                    self.credentials.invalidate(&slot);
                }
                Err(err) => return Err(err),
            }
        }

        if record.encryption_method == EncryptionMethod::ThresholdV1 {
            if let Some(phase) = self.ceremony_failures.lock().get(&slot).copied() {
                return Err(GateError::CeremonyError { phase });
            }
        }
        Err(GateError::NeedsCredential { database: slot })
    }

    async fn open_unregistered(&self, address: &str, mode: OpenMode) -> Result<Handle, GateError> {
        let log = match self.logs.open(address).await {
            Ok(log) => log,
            Err(StoreError::NotFound(_)) => return Err(GateError::UnknownDatabase(address.to_string())),
            Err(err) => return Err(err.into()),
        };
        let classification = classify_log(&log.entries().await?)?;
        debug!(address, ?classification, "cold open without registry record");
        if classification.encrypted {
            return Err(GateError::NeedsCredential {
                database: address.to_string(),
            });
        }
        Ok(self.handle(address.to_string(), None, log, None, mode))
    }

    /// Supply a credential for an encrypted list.
    pub async fn unlock(&self, database_id: &str, credential: Credential) -> Result<Handle, GateError> {
        let record = self
            .registry
            .resolve(database_id)?
            .ok_or_else(|| GateError::UnknownDatabase(database_id.to_string()))?;
        let slot = record.display_name.clone();
        self.ensure_not_migrating(&record)?;

        let max = self.config.max_unlock_attempts;
        if self.attempts(&slot) >= max {
            return Err(GateError::AttemptsExhausted { database: slot });
        }
        if !record.is_encrypted() {
            return self.open(&slot, OpenMode::ReadWrite).await;
        }
        self.ensure_method_enabled(record.encryption_method)?;

        let key = resolve_key(&record, &credential)?;
        let log = self.logs.open(&record.address).await?;
        let entries = log.entries().await?;
        if record.key_id.is_some() || has_sealed(&entries) {
            if !key_matches(&record, &key, &entries) {
                let attempt = {
                    let mut attempts = self.attempts.lock();
                    let counter = attempts.entry(slot.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                warn!(database = %slot, attempt, max, "wrong credential");
                return Err(GateError::WrongCredential { attempt, max });
            }
        } else {
            debug!(database = %slot, "nothing to check the credential against; trusting registry");
        }

        self.attempts.lock().remove(&slot);
        self.ceremony_failures.lock().remove(&slot);
        self.credentials
            .put(&slot, credential, self.config.credential_ttl());
        info!(database = %slot, method = %record.encryption_method, "unlocked");
        Ok(self.handle(slot, Some(record), log, Some(key), OpenMode::ReadWrite))
    }

    pub fn attempts(&self, database_id: &str) -> u32 {
        self.attempts.lock().get(database_id).copied().unwrap_or(0)
    }

    /// Explicit user retry after the attempt limit.
    pub fn reset_attempts(&self, database_id: &str) {
        self.attempts.lock().remove(database_id);
    }

    /// Forget the cached credential for a list.
    pub fn lock(&self, database_id: &str) {
        self.credentials.invalidate(database_id);
    }

    /// Cache a threshold session key produced by a completed unlock ceremony.
    pub fn install_session(
        &self,
        database_id: &str,
        key: SecretKey,
        epoch: u64,
        ttl: Option<Duration>,
    ) -> Result<(), GateError> {
        let record = self
            .registry
            .resolve(database_id)?
            .ok_or_else(|| GateError::UnknownDatabase(database_id.to_string()))?;
        if record.encryption_method == EncryptionMethod::ThresholdV1 && epoch < record.epoch {
            return Err(GateError::StaleSession {
                held: epoch,
                current: record.epoch,
            });
        }
        self.ceremony_failures.lock().remove(&record.display_name);
        self.credentials
            .put(&record.display_name, Credential::SessionKey { key, epoch }, ttl);
        info!(database = %record.display_name, epoch, "threshold session ready");
        Ok(())
    }

    /// Remember that the ceremony for a list ended in `phase`; `open` reports it.
    pub fn report_ceremony_failure(&self, database_id: &str, phase: CeremonyPhase) {
        warn!(database = database_id, %phase, "threshold ceremony failed");
        self.ceremony_failures.lock().insert(database_id.to_string(), phase);
    }

    fn ensure_not_migrating(&self, record: &DatabaseRecord) -> Result<(), GateError> {
        if record.pending_migration.is_some() || self.leases.is_held(&record.display_name) {
            return Err(GateError::MigrationInProgress {
                database: record.display_name.clone(),
            });
        }
        Ok(())
    }

    fn ensure_method_enabled(&self, method: EncryptionMethod) -> Result<(), GateError> {
        if method == EncryptionMethod::ThresholdV1 && !self.config.threshold_enabled {
            return Err(GateError::ThresholdDisabled);
        }
        Ok(())
    }

    fn handle(
        &self,
        database_id: String,
        record: Option<DatabaseRecord>,
        log: Arc<dyn ReplicatedLog>,
        key: Option<EntryKey>,
        mode: OpenMode,
    ) -> Handle {
        Handle {
            database_id,
            record,
            log,
            key,
            mode,
        }
    }
}

fn has_sealed(entries: &[StoredEntry]) -> bool {
    index_view(entries).iter().any(|e| e.body.is_sealed())
}

/// The key is the one the record pins, and opens the first sealed entry of the view.
pub(crate) fn key_matches(record: &DatabaseRecord, key: &EntryKey, entries: &[StoredEntry]) -> bool {
    let pinned = record.key_id.as_deref().map_or(true, |id| id == key.key_id());
    pinned && first_sealed_opens(key, entries)
}

/// The key opens one sealed entry of the current view, or there is none to check.
fn first_sealed_opens(key: &EntryKey, entries: &[StoredEntry]) -> bool {
    match index_view(entries).iter().find(|e| e.body.is_sealed()) {
        Some(entry) => key.verifies(entry),
        None => true,
    }
}
