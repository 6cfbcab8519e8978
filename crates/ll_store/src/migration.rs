//! Moving a list between encryption methods without losing entries.
//!
//! A migration runs under the list's exclusive lease and is journaled in the registry
//! (`pending_migration`) before the first write. Source entries are never rewritten:
//! preserve-address mode appends re-keyed entries to the same log, relocate mode copies
//! into a fresh log at the next manifest generation. The registry only switches method,
//! epoch and address after the target has been checked to contain every source entry.
//!
//! Retrying with the same target resumes from the journal and skips entries already in
//! target form. Retrying with a different key ignores entries sealed under the abandoned
//! key, so the restart reads only the untouched source.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use ll_crypto::kdf::{derive_passphrase_key, generate_salt};
use ll_crypto::{Passphrase, SecretKey};
use ll_proto::{
    entry::index_view, DatabaseRecord, EncryptionMethod, EntryBody, KdfDescriptor, MigrationMode,
    PendingMigration, StoredEntry, ThresholdPolicy,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cipher::{resolve_key, EntryKey, KeyRing};
use crate::credentials::Credential;
use crate::error::MigrationError;
use crate::gate::{key_matches, EncryptionGate};
use crate::log::ReplicatedLog;

/// Target method together with the credential that opens it.
#[derive(Debug, Clone)]
pub enum MigrationTarget {
    Unencrypted,
    Password(Passphrase),
    Threshold {
        session_key: SecretKey,
        epoch: u64,
        policy: ThresholdPolicy,
        key_ref: String,
    },
}

impl MigrationTarget {
    pub fn method(&self) -> EncryptionMethod {
        match self {
            MigrationTarget::Unencrypted => EncryptionMethod::None,
            MigrationTarget::Password(_) => EncryptionMethod::Password,
            MigrationTarget::Threshold { .. } => EncryptionMethod::ThresholdV1,
        }
    }

    fn credential(&self) -> Option<Credential> {
        match self {
            MigrationTarget::Unencrypted => None,
            MigrationTarget::Password(pw) => Some(Credential::Passphrase(pw.clone())),
            MigrationTarget::Threshold {
                session_key, epoch, ..
            } => Some(Credential::SessionKey {
                key: session_key.clone(),
                epoch: *epoch,
            }),
        }
    }
}

pub struct MigrationEngine {
    gate: Arc<EncryptionGate>,
}

impl MigrationEngine {
    pub fn new(gate: Arc<EncryptionGate>) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &Arc<EncryptionGate> {
        &self.gate
    }

    /// Migrate `database_id` to `target`. Moving to a weaker method is refused.
    pub async fn migrate(
        &self,
        database_id: &str,
        target: MigrationTarget,
        mode: MigrationMode,
    ) -> Result<DatabaseRecord, MigrationError> {
        self.run(database_id, target, mode, false).await
    }

    /// Like `migrate`, with explicit consent to a weaker method.
    pub async fn migrate_allowing_downgrade(
        &self,
        database_id: &str,
        target: MigrationTarget,
        mode: MigrationMode,
    ) -> Result<DatabaseRecord, MigrationError> {
        self.run(database_id, target, mode, true).await
    }

    async fn run(
        &self,
        database_id: &str,
        target: MigrationTarget,
        mode: MigrationMode,
        allow_downgrade: bool,
    ) -> Result<DatabaseRecord, MigrationError> {
        let registry = self.gate.registry();
        let name = registry
            .resolve(database_id)?
            .ok_or_else(|| MigrationError::NotFound(database_id.to_string()))?
            .display_name;
        let _lease = self
            .gate
            .leases()
            .try_acquire(&name)
            .ok_or_else(|| MigrationError::LeaseHeld(name.clone()))?;
        let record = registry
            .get(&name)?
            .ok_or_else(|| MigrationError::NotFound(name.clone()))?;

        let source_method = if record.is_encrypted() {
            record.encryption_method
        } else {
            EncryptionMethod::None
        };
        let target_method = target.method();
        if target_method == EncryptionMethod::ThresholdV1 && !self.gate.config().threshold_enabled {
            return Err(MigrationError::ThresholdDisabled);
        }
        if target_method.rank() < source_method.rank() && !allow_downgrade {
            return Err(MigrationError::Downgrade {
                from: source_method,
                to: target_method,
            });
        }

        let source_log = self.gate.logs().open(&record.address).await?;
        let source_entries = source_log.entries().await?;

        if record.pending_migration.is_none() && source_method == target_method {
            let done = match target.credential() {
                None => true,
                Some(credential) => resolve_key(&record, &credential)
                    .map(|key| key_matches(&record, &key, &source_entries))
                    .unwrap_or(false),
            };
            if done {
                info!(database = %name, method = %target_method, "already migrated");
                return Ok(record);
            }
        }

        // Journal entry for this target, if the last attempt aimed at the same thing.
        let pending = record
            .pending_migration
            .clone()
            .filter(|p| p.target_method == target_method && p.mode == mode);

        let (target_key, target_kdf) = match &target {
            MigrationTarget::Unencrypted => (None, None),
            MigrationTarget::Password(pw) => {
                let kdf = match pending.as_ref().and_then(|p| p.target_kdf.clone()) {
                    Some(kdf) => kdf,
                    None => KdfDescriptor {
                        salt: generate_salt().to_vec(),
                        params: self.gate.config().kdf,
                    },
                };
                let key = EntryKey::new(derive_passphrase_key(pw, &kdf.salt, &kdf.params)?);
                (Some(key), Some(kdf))
            }
            MigrationTarget::Threshold { session_key, .. } => {
                (Some(EntryKey::new(session_key.clone())), None)
            }
        };
        let target_key_id = target_key.as_ref().map(|k| k.key_id().to_string());
        let target_epoch = match &target {
            MigrationTarget::Threshold { epoch, .. } => *epoch,
            _ => record.epoch,
        };

        let mut ring = KeyRing::new();
        if source_method.is_encrypted() {
            let credential = self
                .gate
                .credentials()
                .get(&name)
                .ok_or_else(|| MigrationError::SourceLocked(name.clone()))?;
            let source_key = resolve_key(&record, &credential)?;
            let pinned = record.key_id.as_deref().map_or(true, |id| id == source_key.key_id());
            if !pinned || !source_key_matches(&source_key, &source_entries) {
                self.gate.credentials().invalidate(&name);
                return Err(MigrationError::SourceLocked(name.clone()));
            }
            ring.insert(source_key);
        }
        if let Some(key) = &target_key {
            ring.insert(key.clone());
        }
        let source_values = readable_values(&source_entries, &ring)?;

        let target_address = match mode {
            MigrationMode::PreserveAddress => record.address.clone(),
            MigrationMode::Relocate => source_log.manifest().relocated().address(),
        };
        let resuming = pending
            .as_ref()
            .map(|p| p.target_key_id == target_key_id && p.target_address == target_address)
            .unwrap_or(false);
        if resuming {
            info!(database = %name, to = %target_method, ?mode, "resuming migration");
        } else {
            let mut journaled = record.clone();
            journaled.pending_migration = Some(PendingMigration {
                target_method,
                mode,
                target_address: target_address.clone(),
                target_epoch,
                target_key_id: target_key_id.clone(),
                target_kdf: target_kdf.clone(),
                started_at: Utc::now(),
            });
            registry.put(journaled)?;
            info!(
                database = %name,
                from = %source_method,
                to = %target_method,
                ?mode,
                entries = source_values.len(),
                "migration started"
            );
        }

        let target_log: Arc<dyn ReplicatedLog> = match mode {
            MigrationMode::PreserveAddress => source_log.clone(),
            MigrationMode::Relocate => {
                self.gate
                    .logs()
                    .create(&source_log.manifest().relocated())
                    .await?
            }
        };

        let existing = target_log.entries().await?;
        let latest: HashMap<String, StoredEntry> = index_view(&existing)
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        let total = source_values.len();
        let mut copied = 0;
        for (key, value) in &source_values {
            let in_place = latest
                .get(key)
                .map(|e| holds_value(e, target_key.as_ref(), value))
                .unwrap_or(false);
            if !in_place {
                let body = match &target_key {
                    Some(entry_key) => entry_key.seal(key, value)?,
                    None => EntryBody::Plain {
                        value: value.clone(),
                    },
                };
                if let Err(source) = target_log.append(key, body).await {
                    warn!(database = %name, copied, total, "migration interrupted");
                    return Err(MigrationError::Interrupted {
                        copied,
                        total,
                        source,
                    });
                }
            }
            copied += 1;
        }

        verify_target(&target_log.entries().await?, target_key.as_ref(), &source_values)?;
        debug!(database = %name, entries = total, "target verified");

        let mut committed = record.clone();
        committed.pending_migration = None;
        committed.address = target_address.clone();
        committed.encryption_method = target_method;
        committed.encryption_enabled = target_method.is_encrypted();
        committed.epoch = target_epoch;
        committed.kdf = target_kdf;
        committed.key_id = target_key_id;
        match &target {
            MigrationTarget::Threshold {
                policy, key_ref, ..
            } => {
                committed.threshold_policy = Some(*policy);
                committed.key_ref = Some(key_ref.clone());
            }
            _ => {
                committed.threshold_policy = None;
            }
        }

        match mode {
            MigrationMode::PreserveAddress => registry.put(committed.clone())?,
            MigrationMode::Relocate => {
                let mut superseded = record.clone();
                superseded.pending_migration = None;
                superseded.superseded_by = Some(target_address.clone());
                registry.supersede(superseded, committed.clone())?;
            }
        }

        match target.credential() {
            Some(credential) => {
                self.gate
                    .credentials()
                    .put(&name, credential, self.gate.config().credential_ttl())
            }
            None => self.gate.credentials().invalidate(&name),
        }
        self.gate.reset_attempts(&name);
        info!(
            database = %name,
            method = %committed.encryption_method,
            epoch = committed.epoch,
            address = %committed.address,
            "migration committed"
        );
        Ok(committed)
    }
}

/// Some entry sealed under `key` exists and opens, or nothing was sealed under it yet.
fn source_key_matches(key: &EntryKey, entries: &[StoredEntry]) -> bool {
    let mut sealed_under_key = entries.iter().rev().filter(|e| match &e.body {
        EntryBody::Sealed { key_id, .. } => key_id == key.key_id(),
        _ => false,
    });
    match sealed_under_key.next() {
        Some(entry) => key.verifies(entry),
        None => !entries.iter().any(|e| e.body.is_sealed()),
    }
}

/// Key-value view restricted to entries the ring can read, decrypted.
fn readable_values(entries: &[StoredEntry], ring: &KeyRing) -> Result<Vec<(String, Value)>, MigrationError> {
    let readable: Vec<StoredEntry> = entries.iter().filter(|e| ring.can_read(e)).cloned().collect();
    let mut values = Vec::new();
    for entry in index_view(&readable) {
        if let Some(value) = ring.open(&entry)? {
            values.push((entry.key.clone(), value));
        }
    }
    Ok(values)
}

/// `entry` is in target form and carries `value`.
fn holds_value(entry: &StoredEntry, target_key: Option<&EntryKey>, value: &Value) -> bool {
    match (&entry.body, target_key) {
        (EntryBody::Plain { value: stored }, None) => stored == value,
        (EntryBody::Sealed { key_id, .. }, Some(key)) if key_id == key.key_id() => {
            matches!(key.open(entry), Ok(Some(ref stored)) if stored == value)
        }
        _ => false,
    }
}

fn verify_target(
    entries: &[StoredEntry],
    target_key: Option<&EntryKey>,
    source_values: &[(String, Value)],
) -> Result<(), MigrationError> {
    let view: HashMap<String, StoredEntry> = index_view(entries)
        .into_iter()
        .map(|e| (e.key.clone(), e))
        .collect();
    if view.len() != source_values.len() {
        return Err(MigrationError::VerificationFailed(format!(
            "target has {} live keys, source has {}",
            view.len(),
            source_values.len()
        )));
    }
    for (key, value) in source_values {
        let ok = view
            .get(key)
            .map(|e| holds_value(e, target_key, value))
            .unwrap_or(false);
        if !ok {
            return Err(MigrationError::VerificationFailed(format!("entry {key}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::gate::OpenMode;
    use crate::log::MemoryLogProvider;
    use crate::registry::MemoryRegistry;
    use crate::GateError;
    use serde_json::json;

    fn engine() -> MigrationEngine {
        let gate = EncryptionGate::new(
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryLogProvider::new()),
            StoreConfig::for_tests(),
        );
        MigrationEngine::new(Arc::new(gate))
    }

    async fn seeded(engine: &MigrationEngine) {
        let gate = engine.gate();
        gate.create("groceries").await.unwrap();
        let handle = gate.open("groceries", OpenMode::ReadWrite).await.unwrap();
        handle.put("milk", json!({"qty": 1})).await.unwrap();
        handle.put("eggs", json!({"qty": 12})).await.unwrap();
        handle.put("bread", json!(null)).await.unwrap();
        handle.delete("bread").await.unwrap();
    }

    #[tokio::test]
    async fn preserve_mode_keeps_address() {
        let engine = engine();
        seeded(&engine).await;
        let before = engine.gate().registry().get("groceries").unwrap().unwrap();

        let record = engine
            .migrate(
                "groceries",
                MigrationTarget::Password("pw".into()),
                MigrationMode::PreserveAddress,
            )
            .await
            .unwrap();
        assert_eq!(record.address, before.address);
        assert_eq!(record.encryption_method, EncryptionMethod::Password);
        assert!(record.pending_migration.is_none());

        let handle = engine.gate().open("groceries", OpenMode::ReadOnly).await.unwrap();
        assert!(handle.is_encrypted());
        assert_eq!(
            handle.entries().await.unwrap(),
            vec![
                ("milk".to_string(), json!({"qty": 1})),
                ("eggs".to_string(), json!({"qty": 12})),
            ]
        );
    }

    #[tokio::test]
    async fn relocate_mode_supersedes_old_record() {
        let engine = engine();
        seeded(&engine).await;
        let before = engine.gate().registry().get("groceries").unwrap().unwrap();

        let record = engine
            .migrate(
                "groceries",
                MigrationTarget::Password("pw".into()),
                MigrationMode::Relocate,
            )
            .await
            .unwrap();
        assert_ne!(record.address, before.address);

        let history = engine.gate().registry().history("groceries").unwrap();
        assert_eq!(history.last().unwrap().superseded_by.as_deref(), Some(record.address.as_str()));

        // The old address resolves to the new record and its key.
        let handle = engine.gate().open(&before.address, OpenMode::ReadOnly).await.unwrap();
        assert_eq!(handle.address(), record.address);
        assert_eq!(handle.get("eggs").await.unwrap(), Some(json!({"qty": 12})));
    }

    #[tokio::test]
    async fn downgrade_requires_consent() {
        let engine = engine();
        seeded(&engine).await;
        engine
            .migrate("groceries", MigrationTarget::Password("pw".into()), MigrationMode::PreserveAddress)
            .await
            .unwrap();

        let err = engine
            .migrate("groceries", MigrationTarget::Unencrypted, MigrationMode::PreserveAddress)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Downgrade { .. }));

        let record = engine
            .migrate_allowing_downgrade("groceries", MigrationTarget::Unencrypted, MigrationMode::PreserveAddress)
            .await
            .unwrap();
        assert_eq!(record.encryption_method, EncryptionMethod::None);
        assert!(record.kdf.is_none());
        let handle = engine.gate().open("groceries", OpenMode::ReadOnly).await.unwrap();
        assert_eq!(handle.get("milk").await.unwrap(), Some(json!({"qty": 1})));
    }

    #[tokio::test]
    async fn locked_source_is_refused() {
        let engine = engine();
        seeded(&engine).await;
        engine
            .migrate("groceries", MigrationTarget::Password("pw".into()), MigrationMode::PreserveAddress)
            .await
            .unwrap();
        engine.gate().lock("groceries");

        let err = engine
            .migrate("groceries", MigrationTarget::Password("new".into()), MigrationMode::PreserveAddress)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::SourceLocked(_)));
    }

    #[tokio::test]
    async fn held_lease_blocks_migration_and_gate() {
        let engine = engine();
        seeded(&engine).await;
        let _lease = engine.gate().leases().try_acquire("groceries").unwrap();

        assert!(matches!(
            engine
                .migrate("groceries", MigrationTarget::Password("pw".into()), MigrationMode::PreserveAddress)
                .await,
            Err(MigrationError::LeaseHeld(_))
        ));
        assert!(matches!(
            engine.gate().open("groceries", OpenMode::ReadOnly).await,
            Err(GateError::MigrationInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn passphrase_change_rekeys_entries() {
        let engine = engine();
        seeded(&engine).await;
        engine
            .migrate("groceries", MigrationTarget::Password("old".into()), MigrationMode::PreserveAddress)
            .await
            .unwrap();
        engine
            .migrate("groceries", MigrationTarget::Password("new".into()), MigrationMode::PreserveAddress)
            .await
            .unwrap();

        let gate = engine.gate();
        gate.lock("groceries");
        assert!(matches!(
            gate.unlock("groceries", Credential::Passphrase("old".into())).await,
            Err(GateError::WrongCredential { attempt: 1, .. })
        ));
        let handle = gate
            .unlock("groceries", Credential::Passphrase("new".into()))
            .await
            .unwrap();
        assert_eq!(handle.entries().await.unwrap().len(), 2);
    }
}
