//! Registry records.
//!
//! One `DatabaseRecord` per logical list, keyed by display name. Records are mutated by
//! migration and rotation and never deleted; replaced versions go to registry history.

use chrono::{DateTime, Utc};
use ll_crypto::KdfParams;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionMethod {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "threshold-v1")]
    ThresholdV1,
}

impl EncryptionMethod {
    /// Strength ordering; moving to a lower rank is a downgrade.
    pub fn rank(self) -> u8 {
        match self {
            EncryptionMethod::None => 0,
            EncryptionMethod::Password => 1,
            EncryptionMethod::ThresholdV1 => 2,
        }
    }

    pub fn is_encrypted(self) -> bool {
        self != EncryptionMethod::None
    }
}

impl std::fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EncryptionMethod::None => "none",
            EncryptionMethod::Password => "password",
            EncryptionMethod::ThresholdV1 => "threshold-v1",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub t: u8,
    pub n: u8,
}

impl ThresholdPolicy {
    pub fn new(t: u8, n: u8) -> Result<Self, ProtoError> {
        let policy = Self { t, n };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.t == 0 || self.n == 0 || self.t > self.n {
            return Err(ProtoError::InvalidPolicy {
                t: self.t,
                n: self.n,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ThresholdPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-of-{}", self.t, self.n)
    }
}

/// Salt and Argon2 costs for password mode. Not secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfDescriptor {
    #[serde(with = "ll_crypto::encoding::b64")]
    pub salt: Vec<u8>,
    pub params: KdfParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    PreserveAddress,
    Relocate,
}

/// Journal of a migration that has started but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMigration {
    pub target_method: EncryptionMethod,
    pub mode: MigrationMode,
    pub target_address: String,
    pub target_epoch: u64,
    /// Public id of the target key; a retry with a different key restarts from scratch.
    pub target_key_id: Option<String>,
    /// Salt and costs chosen for a password target, reused when resuming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_kdf: Option<KdfDescriptor>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRecord {
    pub display_name: String,
    pub address: String,
    pub encryption_enabled: bool,
    pub encryption_method: EncryptionMethod,
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_policy: Option<ThresholdPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfDescriptor>,
    /// Public id of the key entries are sealed under. Lets a credential be checked before
    /// anything has been written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Threshold key reference, e.g. `db:my-list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_migration: Option<PendingMigration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseRecord {
    pub fn new_unencrypted(display_name: impl Into<String>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            display_name: display_name.into(),
            address: address.into(),
            encryption_enabled: false,
            encryption_method: EncryptionMethod::None,
            epoch: 0,
            threshold_policy: None,
            kdf: None,
            key_id: None,
            key_ref: None,
            pending_migration: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_enabled && self.encryption_method.is_encrypted()
    }

    /// Key reference used by the threshold ceremony for this list.
    pub fn threshold_key_ref(&self) -> String {
        self.key_ref
            .clone()
            .unwrap_or_else(|| format!("db:{}", self.display_name))
    }
}
