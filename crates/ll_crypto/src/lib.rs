//! ll_crypto: Listlock cryptographic primitives
//!
//! # Design principles
//! - NO custom ciphers; AEAD, signatures, key agreement and KDFs come from audited crates.
//! - Secret material lives in newtypes that zeroize on drop and have no `Serialize` impl,
//!   so the persistence path cannot pick them up by accident.
//!
//! # Module layout
//! - `aead`: pluggable `Cipher` trait, XChaCha20-Poly1305 default
//! - `kdf`: Argon2id passphrase keys (stored cost parameters) and HKDF-SHA256
//! - `shamir`: (t, n) secret sharing over GF(256)
//! - `identity`: per-device Ed25519 signing + X25519 agreement keys
//! - `wrap`: seal a payload to one device's X25519 public key
//! - `secret`: `SecretKey`, `Passphrase` capability types
//! - `hash`: BLAKE3 helpers (entry hashes, addresses, commitments)
//! - `encoding`: base64url serde adapters for byte fields on the wire
//! - `error`: unified error type

pub mod aead;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod secret;
pub mod shamir;
pub mod wrap;

pub use aead::{cipher_for, Cipher, Sealed, XChaCha20Poly1305Cipher, DEFAULT_ALG};
pub use error::CryptoError;
pub use identity::{DeviceIdentity, DevicePublicKeys};
pub use kdf::KdfParams;
pub use secret::{Passphrase, SecretKey};
pub use shamir::RawShare;
pub use wrap::SealedBox;
