use ll_proto::CeremonyPhase;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("Epoch {epoch} of {key_ref} is revoked (current epoch {current})")]
    EpochRevoked {
        key_ref: String,
        epoch: u64,
        current: u64,
    },

    #[error("Epoch {epoch} of {key_ref} is not established")]
    UnknownEpoch { key_ref: String, epoch: u64 },

    #[error("No threshold key {0}")]
    UnknownKey(String),

    #[error("Share from {device} failed verification")]
    ShareVerificationFailed { device: String },

    #[error("Ceremony timed out in phase {phase}")]
    CeremonyTimeout { phase: CeremonyPhase },

    #[error("Ceremony for {key_ref} was cancelled")]
    CeremonyCancelled { key_ref: String },

    #[error("A ceremony for {key_ref} is already running")]
    CeremonyBusy { key_ref: String },

    #[error("Replayed event from {sender}: counter {counter} <= {last}")]
    Replay { sender: String, counter: u64, last: u64 },

    #[error("Bad signature: {0}")]
    BadSignature(String),

    #[error("Unknown sender {0}")]
    UnknownSender(String),

    #[error("Device {device} presented a different key than the one pinned")]
    KeyConflict { device: String },

    #[error("{device} is not a member of {key_ref}")]
    NotMember { device: String, key_ref: String },

    #[error("This device holds no share for {key_ref} epoch {epoch}")]
    NoShare { key_ref: String, epoch: u64 },

    #[error("Only {have} devices remain; {need} are required")]
    NotEnoughSurvivors { have: usize, need: usize },

    #[error("Rejected {event}: {reason}")]
    InvalidTransition { event: &'static str, reason: String },

    #[error("Transport closed")]
    TransportClosed,

    #[error("Crypto error: {0}")]
    Crypto(#[from] ll_crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ll_proto::ProtoError),

    #[error("Store error: {0}")]
    Store(#[from] ll_store::StoreError),

    #[error("Gate error: {0}")]
    Gate(#[from] ll_store::GateError),

    #[error("Migration error: {0}")]
    Migration(#[from] ll_store::MigrationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl ThresholdError {
    pub(crate) fn invalid(event: &'static str, reason: impl Into<String>) -> Self {
        ThresholdError::InvalidTransition {
            event,
            reason: reason.into(),
        }
    }
}
