//! ll_proto: Registry records, log entries and ceremony wire types for Listlock
//!
//! Everything here is plain serialisable data. Secret material never appears in these
//! types: shares travel only inside `SealedBox`es addressed to one device.
//!
//! # Modules
//! - `record`: `DatabaseRecord` as persisted by the registry
//! - `entry`: replicated log entries, the key-value view, database manifests
//! - `ceremony`: durable coordination events (`threshold.*`) and the signed envelope
//! - `liveness`: ephemeral heartbeat / presence messages
//! - `error`: protocol-level validation errors

pub mod ceremony;
pub mod entry;
pub mod error;
pub mod liveness;
pub mod record;

pub use ceremony::{
    AbortReason, CeremonyAbort, CeremonyEvent, CeremonyFinalize, CeremonyInit, CeremonyJoin, CeremonyKind,
    CeremonyPhase, DeviceId, DeviceStatus, RecoveryRequest, RotateCommit, ShareAck, ShareEnvelope,
    ShareEnvelopeHeader, ShareReject, SignedEvent, UnlockApproval, UnlockRequest,
};
pub use entry::{index_view, AccessPolicy, EntryBody, LogEntry, Manifest, StoredEntry};
pub use error::ProtoError;
pub use liveness::LivenessMessage;
pub use record::{DatabaseRecord, EncryptionMethod, KdfDescriptor, MigrationMode, PendingMigration, ThresholdPolicy};
