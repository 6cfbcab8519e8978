//! Seal a payload to one device's X25519 public key.
//!
//!   EK           = fresh X25519 ephemeral keypair
//!   shared       = DH(EK, recipient_enc_pub)          (must be contributory)
//!   wrapping key = HKDF(ikm = shared, salt = EK_pub || recipient_enc_pub, info)
//!   box          = AEAD(wrapping key, payload, aad)
//!
//! Only the holder of the recipient's agreement secret can open the box.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

use crate::aead::{cipher_for, Cipher, Sealed, XChaCha20Poly1305Cipher};
use crate::error::CryptoError;
use crate::identity::DeviceIdentity;
use crate::kdf::derive_key;
use crate::secret::SecretKey;

const WRAP_INFO: &[u8] = b"ll-share-wrap-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "crate::encoding::b64_32")]
    pub ephemeral_pub: [u8; 32],
    pub sealed: Sealed,
}

fn wrapping_key(shared: &[u8], eph_pub: &[u8; 32], recipient: &[u8; 32]) -> Result<SecretKey, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph_pub);
    salt[32..].copy_from_slice(recipient);
    derive_key(shared, &salt, WRAP_INFO)
}

pub fn seal_to(recipient_enc_pub: &[u8; 32], payload: &[u8], aad: &[u8]) -> Result<SealedBox, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&X25519Public::from(*recipient_enc_pub));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    let key = wrapping_key(shared.as_bytes(), &ephemeral_pub, recipient_enc_pub)?;
    let sealed = XChaCha20Poly1305Cipher.seal(key.expose(), payload, aad)?;
    Ok(SealedBox {
        ephemeral_pub,
        sealed,
    })
}

pub fn open_with(
    identity: &DeviceIdentity,
    sealed_box: &SealedBox,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let shared = identity
        .agreement()
        .diffie_hellman(&X25519Public::from(sealed_box.ephemeral_pub));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    let own_pub = identity.public_keys().enc_pub;
    let key = wrapping_key(shared.as_bytes(), &sealed_box.ephemeral_pub, &own_pub)?;
    cipher_for(&sealed_box.sealed.alg)?.open(key.expose(), &sealed_box.sealed, aad)
}
