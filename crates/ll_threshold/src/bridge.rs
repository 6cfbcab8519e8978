//! Hands ceremony results to the encryption gate and migration engine.

use std::sync::Arc;

use async_trait::async_trait;
use ll_proto::{MigrationMode, ShareEnvelope};
use ll_store::{MigrationEngine, MigrationTarget, StoreError};
use tracing::{info, warn};

use crate::coordinator::Effect;
use crate::error::ThresholdError;
use crate::keystore::DeviceKeystore;
use crate::runner::EffectSink;

pub struct StoreBridge {
    engine: Arc<MigrationEngine>,
    keystore: Option<DeviceKeystore>,
}

impl StoreBridge {
    pub fn new(engine: Arc<MigrationEngine>) -> Self {
        Self {
            engine,
            keystore: None,
        }
    }

    pub fn with_keystore(mut self, keystore: DeviceKeystore) -> Self {
        self.keystore = Some(keystore);
        self
    }

    /// Name of the list whose threshold key is `key_ref`.
    pub fn database_for(&self, key_ref: &str) -> Result<String, ThresholdError> {
        self.engine
            .gate()
            .registry()
            .list()?
            .into_iter()
            .find(|r| r.threshold_key_ref() == key_ref)
            .map(|r| r.display_name)
            .ok_or_else(|| StoreError::NotFound(key_ref.to_string()).into())
    }

    fn persist(&self, envelope: &ShareEnvelope) -> Result<(), ThresholdError> {
        let Some(keystore) = &self.keystore else {
            return Ok(());
        };
        keystore.store_envelope(envelope)?;
        let pruned = keystore.prune(&envelope.key_ref, envelope.epoch)?;
        if pruned > 0 {
            info!(key_ref = %envelope.key_ref, pruned, "dropped shares of older epochs");
        }
        Ok(())
    }
}

#[async_trait]
impl EffectSink for StoreBridge {
    async fn apply(&self, effect: &Effect) -> Result<(), ThresholdError> {
        let gate = self.engine.gate();
        match effect {
            Effect::KeyEstablished {
                key_ref,
                epoch,
                key,
                policy,
                previous_epoch,
            } => {
                let database = self.database_for(key_ref)?;
                let target = MigrationTarget::Threshold {
                    session_key: key.clone(),
                    epoch: *epoch,
                    policy: *policy,
                    key_ref: key_ref.clone(),
                };
                let record = self
                    .engine
                    .migrate(&database, target, MigrationMode::PreserveAddress)
                    .await?;
                info!(database = %database, epoch = record.epoch, ?previous_epoch, "list re-keyed to threshold epoch");
            }
            Effect::SessionReady { key_ref, epoch, key, ttl } => {
                let database = self.database_for(key_ref)?;
                gate.install_session(&database, key.clone(), *epoch, Some(*ttl))?;
            }
            Effect::SessionExpired { key_ref } => {
                if let Ok(database) = self.database_for(key_ref) {
                    gate.lock(&database);
                }
            }
            Effect::CeremonyFailed { key_ref, phase, reason } => {
                warn!(key_ref = %key_ref, %phase, ?reason, "ceremony failed");
                if let Ok(database) = self.database_for(key_ref) {
                    gate.report_ceremony_failure(&database, *phase);
                }
            }
            Effect::PersistEnvelope(envelope) => self.persist(envelope)?,
            Effect::ApprovalRequired {
                key_ref,
                request_id,
                requester,
                epoch,
                recovery,
            } => {
                info!(key_ref = %key_ref, request = %request_id, requester = %requester, epoch, recovery, "approval required");
            }
            Effect::RequestExpired { key_ref, request_id } => {
                warn!(key_ref = %key_ref, request = %request_id, "request expired");
            }
            Effect::Publish(_) | Effect::Broadcast(_) => {}
        }
        Ok(())
    }
}
