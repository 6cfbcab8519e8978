//! ll_threshold: Multi-device threshold key ceremonies for Listlock
//!
//! A list protected with `threshold-v1` is opened with a session key derived from a secret
//! that no single device holds. Devices agree on who holds which share, and at which
//! epoch, by folding one totally ordered stream of signed durable events. A separate
//! best-effort liveness channel only feeds presence display and timeouts.
//!
//! # Modules
//! - `state`: deterministic reducer (`Ledger`) over durable events
//! - `coordinator`: per-device reactions: join, deal, verify, approve, reconstruct
//! - `liveness`: presence overlay (`offline`, `timed_out`)
//! - `session`: session-key derivation and commitments
//! - `keystore`: passphrase-sealed device identity and wrapped share envelopes
//! - `transport`: durable / liveness channel traits, in-memory bus, log-backed channel
//! - `runner`: tokio task driving a coordinator
//! - `bridge`: applies ceremony results to the encryption gate and migrations
//! - `config`: timeouts and intervals

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod keystore;
pub mod liveness;
pub mod runner;
pub mod session;
pub mod state;
pub mod transport;

pub use bridge::StoreBridge;
pub use config::CeremonyConfig;
pub use coordinator::{Coordinator, Effect};
pub use error::ThresholdError;
pub use keystore::DeviceKeystore;
pub use liveness::LivenessTracker;
pub use runner::{EffectSink, Runner, RunnerHandle};
pub use state::{CeremonyState, KeyState, Ledger, Transition};
pub use transport::{DurableChannel, LivenessChannel, LogChannel, MemoryBus};
