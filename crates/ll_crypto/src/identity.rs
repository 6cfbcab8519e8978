//! Device key management
//!
//! Every participating device owns one `DeviceIdentity`:
//! - an Ed25519 signing key, used to sign every durable ceremony event it publishes;
//! - an X25519 agreement key, the recipient key for share envelopes and unlock
//!   contributions sealed to this device.
//!
//! `DevicePublicKeys` is what other devices learn from the `join` event.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Public half of a device identity, as published on the coordination channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevicePublicKeys {
    pub device_id: String,
    #[serde(with = "crate::encoding::b64_32")]
    pub sign_pub: [u8; 32],
    #[serde(with = "crate::encoding::b64_32")]
    pub enc_pub: [u8; 32],
}

impl DevicePublicKeys {
    /// Short fingerprint for out-of-band comparison between devices.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sign_pub);
        hasher.update(self.enc_pub);
        hex::encode(&hasher.finalize()[..8])
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&self.sign_pub)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig: [u8; 64] = sig
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
        vk.verify_strict(msg, &Signature::from_bytes(&sig))
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

pub struct DeviceIdentity {
    device_id: String,
    signing: SigningKey,
    agreement: StaticSecret,
}

impl DeviceIdentity {
    pub fn generate(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            signing: SigningKey::generate(&mut OsRng),
            agreement: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn public_keys(&self) -> DevicePublicKeys {
        DevicePublicKeys {
            device_id: self.device_id.clone(),
            sign_pub: self.signing.verifying_key().to_bytes(),
            enc_pub: X25519Public::from(&self.agreement).to_bytes(),
        }
    }

    /// 64-byte Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }

    pub(crate) fn agreement(&self) -> &StaticSecret {
        &self.agreement
    }

    /// `signing_secret || agreement_secret`, for sealed local storage only.
    pub fn export_secret(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(64));
        out.extend_from_slice(&self.signing.to_bytes());
        out.extend_from_slice(&self.agreement.to_bytes());
        out
    }

    pub fn import_secret(device_id: impl Into<String>, bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidKey(format!(
                "device secret must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut sign = Zeroizing::new([0u8; 32]);
        sign.copy_from_slice(&bytes[..32]);
        let mut agree = Zeroizing::new([0u8; 32]);
        agree.copy_from_slice(&bytes[32..]);
        Ok(Self {
            device_id: device_id.into(),
            signing: SigningKey::from_bytes(&sign),
            agreement: StaticSecret::from(*agree),
        })
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.public_keys().fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let id = DeviceIdentity::generate("desktop");
        let keys = id.public_keys();
        let sig = id.sign(b"threshold.ceremony.join");
        keys.verify(b"threshold.ceremony.join", &sig).unwrap();
        assert!(matches!(
            keys.verify(b"tampered", &sig),
            Err(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn export_import_preserves_keys() {
        let id = DeviceIdentity::generate("phone-a");
        let restored = DeviceIdentity::import_secret("phone-a", &id.export_secret()).unwrap();
        assert_eq!(id.public_keys(), restored.public_keys());
        assert!(DeviceIdentity::import_secret("phone-a", &[0u8; 10]).is_err());
    }

    #[test]
    fn public_keys_json_shape() {
        let keys = DeviceIdentity::generate("phone-b").public_keys();
        let json = serde_json::to_value(&keys).unwrap();
        assert_eq!(json["device_id"], "phone-b");
        assert!(json["sign_pub"].is_string());
        let back: DevicePublicKeys = serde_json::from_value(json).unwrap();
        assert_eq!(back, keys);
    }
}
