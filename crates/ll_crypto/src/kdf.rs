//! Key derivation functions
//!
//! `derive_passphrase_key`: Argon2id; derives the 32-byte database key in password mode.
//! The cost parameters travel with the salt in the registry record so a database created
//! on one device opens with identical parameters on every other device.
//!
//! `hkdf_expand` / `derive_key`: HKDF-SHA256 for session keys and share wrapping keys.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::CryptoError;
use crate::secret::{Passphrase, SecretKey};

pub const SALT_LEN: usize = 16;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    /// Tuned for interactive desktop use: 64 MiB, 3 passes, 1 lane.
    fn default() -> Self {
        Self {
            m_cost_kib: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Minimum parameters accepted by Argon2; for tests and fixtures only.
    pub fn minimal() -> Self {
        Self {
            m_cost_kib: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }

    fn to_argon2(self) -> Result<Params, CryptoError> {
        Params::new(self.m_cost_kib, self.t_cost, self.p_cost, Some(32))
            .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))
    }
}

/// Derive a database key from a passphrase + salt.
pub fn derive_passphrase_key(
    passphrase: &Passphrase,
    salt: &[u8],
    params: &KdfParams,
) -> Result<SecretKey, CryptoError> {
    if salt.len() < 8 {
        return Err(CryptoError::KeyDerivation("salt shorter than 8 bytes".into()));
    }
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase.expose().as_bytes(), salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let key = SecretKey::from_bytes(output);
    zeroize::Zeroize::zeroize(&mut output);
    Ok(key)
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// HKDF-SHA256 into a 32-byte [`SecretKey`].
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<SecretKey, CryptoError> {
    let mut out = [0u8; 32];
    hkdf_expand(ikm, Some(salt), info, &mut out)?;
    let key = SecretKey::from_bytes(out);
    zeroize::Zeroize::zeroize(&mut out);
    Ok(key)
}
