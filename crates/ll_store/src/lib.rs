//! ll_store: Per-database encryption for Listlock
//!
//! The store layer owns everything a single device needs to open a list:
//! the registry of `DatabaseRecord`s, the seam to the replicated log, the
//! classifier that inspects synced entries, the in-memory credential cache,
//! the encryption gate that decides whether a list can be opened, and the
//! migration engine that moves a list between encryption methods.
//!
//! # Module layout
//! - `registry`: durable `DatabaseRecord` map with history (JSON file / memory)
//! - `log`: `ReplicatedLog` / `LogProvider` seam (memory, JSONL file)
//! - `classifier`: encrypted / unencrypted / ambiguous detection
//! - `credentials`: TTL-bounded credential cache, never persisted
//! - `cipher`: sealing entry values under a database key
//! - `gate`: `EncryptionGate::open` / `unlock` and the read/write `Handle`
//! - `lease`: exclusive per-database migration lease
//! - `migration`: `MigrationEngine::migrate`
//! - `config`: `StoreConfig`
//! - `error`: `StoreError`, `GateError`, `MigrationError`

pub mod cipher;
pub mod classifier;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gate;
pub mod lease;
pub mod log;
pub mod migration;
pub mod registry;

pub use classifier::{classify, Classification, Confidence};
pub use config::StoreConfig;
pub use credentials::{Credential, CredentialStore};
pub use error::{GateError, MigrationError, StoreError};
pub use gate::{EncryptionGate, Handle, OpenMode};
pub use lease::{Lease, LeaseTable};
pub use log::{FileLogProvider, LogProvider, MemoryLogProvider, ReplicatedLog};
pub use migration::{MigrationEngine, MigrationTarget};
pub use registry::{JsonRegistry, MemoryRegistry, Registry};
