//! Deriving session keys from a reconstructed threshold secret.
//!
//! session key = HKDF-SHA256(ikm = secret, salt = "ll-threshold-v1", info = key_ref "|" epoch)
//!
//! The secret itself never leaves this crate; only the derived key is handed to the gate.

use ll_crypto::hash::commitment;
use ll_crypto::kdf::derive_key;
use ll_crypto::{CryptoError, SecretKey};

const SESSION_SALT: &[u8] = b"ll-threshold-v1";
const SECRET_CONTEXT: &str = "listlock 2024 threshold secret";

pub fn derive_session_key(secret: &[u8], key_ref: &str, epoch: u64) -> Result<SecretKey, CryptoError> {
    derive_key(secret, SESSION_SALT, format!("{key_ref}|{epoch}").as_bytes())
}

/// Public commitment published with `finalize`; reconstructions are checked against it.
pub fn secret_commitment(secret: &[u8], key_ref: &str, epoch: u64) -> String {
    let mut data = format!("{key_ref}|{epoch}|").into_bytes();
    data.extend_from_slice(secret);
    let out = commitment(SECRET_CONTEXT, &data);
    zeroize::Zeroize::zeroize(&mut data);
    out
}

/// Commitment context for the share held by `device`.
pub fn share_context(key_ref: &str, epoch: u64, device: &str) -> String {
    format!("listlock 2024 share {key_ref} {epoch} {device}")
}
