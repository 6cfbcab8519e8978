use ll_proto::{CeremonyPhase, EncryptionMethod};
use thiserror::Error;

use crate::classifier::Ambiguous;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] ll_crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ll_proto::ProtoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Log {address} is corrupt at line {line}: {reason}")]
    CorruptLog {
        address: String,
        line: usize,
        reason: String,
    },

    #[error("Handle for {0} is read-only")]
    ReadOnly(String),

    #[error("No key for sealed entry {0}")]
    MissingKey(String),
}

/// Typed results of the encryption gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Database {database} is encrypted; a credential is required")]
    NeedsCredential { database: String },

    #[error("Wrong credential (attempt {attempt} of {max})")]
    WrongCredential { attempt: u32, max: u32 },

    #[error("Unlock attempts exhausted for {database}; reset required")]
    AttemptsExhausted { database: String },

    #[error("Credential kind does not match {method} database")]
    CredentialMismatch { method: EncryptionMethod },

    #[error("Session key for epoch {held} is stale; database is at epoch {current}")]
    StaleSession { held: u64, current: u64 },

    #[error("Encryption state is ambiguous: {0}")]
    DetectionAmbiguous(#[from] Ambiguous),

    #[error("Migration in progress for {database}; retry later")]
    MigrationInProgress { database: String },

    #[error("Threshold ceremony failed in phase {phase}")]
    CeremonyError { phase: CeremonyPhase },

    #[error("Threshold encryption is disabled")]
    ThresholdDisabled,

    #[error("No registry record for {0}")]
    UnknownDatabase(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ll_crypto::CryptoError> for GateError {
    fn from(err: ll_crypto::CryptoError) -> Self {
        GateError::Store(StoreError::Crypto(err))
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("No registry record for {0}")]
    NotFound(String),

    #[error("Migration lease for {0} is held by another task")]
    LeaseHeld(String),

    #[error("Refusing to downgrade {from} -> {to} without explicit consent")]
    Downgrade {
        from: EncryptionMethod,
        to: EncryptionMethod,
    },

    #[error("Source database {0} is locked; unlock it before migrating")]
    SourceLocked(String),

    #[error("Migration interrupted after {copied} of {total} entries: {source}")]
    Interrupted {
        copied: usize,
        total: usize,
        #[source]
        source: StoreError,
    },

    #[error("Target failed verification: {0}")]
    VerificationFailed(String),

    #[error("Threshold encryption is disabled")]
    ThresholdDisabled,

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ll_crypto::CryptoError> for MigrationError {
    fn from(err: ll_crypto::CryptoError) -> Self {
        MigrationError::Store(StoreError::Crypto(err))
    }
}
