//! Authenticated Encryption with Associated Data
//!
//! The database payload cipher is pluggable: everything above this module talks to the
//! [`Cipher`] trait and records the algorithm name next to each ciphertext. The default
//! is XChaCha20-Poly1305 (32-byte key, 24-byte random nonce, 16-byte tag).

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const DEFAULT_ALG: &str = "xchacha20poly1305";
const XCHACHA_NONCE_LEN: usize = 24;

/// Nonce + ciphertext (tag included) produced by a [`Cipher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub alg: String,
    #[serde(with = "crate::encoding::b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::encoding::b64")]
    pub ciphertext: Vec<u8>,
}

pub trait Cipher: Send + Sync + std::fmt::Debug {
    fn alg(&self) -> &'static str;

    fn seal(&self, key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError>;

    fn open(
        &self,
        key: &[u8; 32],
        sealed: &Sealed,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XChaCha20Poly1305Cipher;

impl Cipher for XChaCha20Poly1305Cipher {
    fn alg(&self) -> &'static str {
        DEFAULT_ALG
    }

    fn seal(&self, key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
        let cipher =
            XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::AeadEncrypt)?;
        Ok(Sealed {
            alg: DEFAULT_ALG.to_string(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    fn open(
        &self,
        key: &[u8; 32],
        sealed: &Sealed,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if sealed.alg != DEFAULT_ALG {
            return Err(CryptoError::UnsupportedAlgorithm(sealed.alg.clone()));
        }
        if sealed.nonce.len() != XCHACHA_NONCE_LEN {
            return Err(CryptoError::AeadDecrypt);
        }
        let cipher =
            XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
        let nonce = XNonce::from_slice(&sealed.nonce);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed.ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AeadDecrypt)?;
        Ok(Zeroizing::new(plaintext))
    }
}

static XCHACHA: XChaCha20Poly1305Cipher = XChaCha20Poly1305Cipher;

/// Resolve the cipher recorded next to a ciphertext.
pub fn cipher_for(alg: &str) -> Result<&'static dyn Cipher, CryptoError> {
    match alg {
        DEFAULT_ALG => Ok(&XCHACHA),
        other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
    }
}
