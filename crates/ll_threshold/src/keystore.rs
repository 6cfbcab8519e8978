//! Local device keystore.
//!
//! `identity.lld` holds the device's long-term signing and agreement secrets sealed under a
//! passphrase-derived key. Layout (little endian, 64-byte header):
//!
//! ```text
//! [0..8)   magic "LLDEV01\0"
//! [8..12)  format version
//! [12..24) Argon2id m_cost_kib, t_cost, p_cost
//! [24..40) salt
//! [40..64) nonce
//! [64..)   XChaCha20-Poly1305 ciphertext of the JSON payload
//! ```
//!
//! Share envelopes addressed to this device are kept under `shares/` exactly as they
//! arrived: still sealed to the device key, so the raw share is never written to disk.

use std::fs;
use std::path::{Path, PathBuf};

use ll_crypto::kdf::{derive_passphrase_key, generate_salt, SALT_LEN};
use ll_crypto::{cipher_for, Cipher, CryptoError, DeviceIdentity, KdfParams, Passphrase, Sealed, XChaCha20Poly1305Cipher, DEFAULT_ALG};
use ll_proto::ShareEnvelope;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::ThresholdError;

const MAGIC: &[u8; 8] = b"LLDEV01\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;
const NONCE_LEN: usize = 24;
const IDENTITY_FILE: &str = "identity.lld";
const SHARES_DIR: &str = "shares";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    version: u32,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kdf.m_cost_kib.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf.t_cost.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf.p_cost.to_le_bytes());
        buf[24..40].copy_from_slice(&self.salt);
        buf[40..64].copy_from_slice(&self.nonce);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, ThresholdError> {
        let corrupt = |why: &str| CryptoError::InvalidKey(format!("keystore header: {why}"));
        if buf.len() < HEADER_SIZE {
            return Err(corrupt("truncated").into());
        }
        if &buf[..8] != MAGIC {
            return Err(corrupt("bad magic").into());
        }
        let word = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let version = word(8);
        if version != FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported version {version}")).into());
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[24..40]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[40..64]);
        Ok(Self {
            version,
            kdf: KdfParams {
                m_cost_kib: word(12),
                t_cost: word(16),
                p_cost: word(20),
            },
            salt,
            nonce,
        })
    }

    /// Everything but the nonce is authenticated.
    fn aad(&self) -> Vec<u8> {
        self.to_bytes()[..40].to_vec()
    }
}

#[derive(Serialize, Deserialize)]
struct Payload {
    device_id: String,
    #[serde(with = "ll_crypto::encoding::b64")]
    secret: Vec<u8>,
}

impl Drop for Payload {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.secret);
    }
}

#[derive(Debug, Clone)]
pub struct DeviceKeystore {
    root: PathBuf,
}

impl DeviceKeystore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.join(IDENTITY_FILE).exists()
    }

    /// Generate a fresh device identity and seal it under `passphrase`.
    pub fn create(
        &self,
        device_id: &str,
        passphrase: &Passphrase,
        kdf: KdfParams,
    ) -> Result<DeviceIdentity, ThresholdError> {
        if self.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("keystore already exists at {}", self.root.display()),
            )
            .into());
        }
        let identity = DeviceIdentity::generate(device_id);
        self.seal(&identity, passphrase, kdf)?;
        info!(device = device_id, fingerprint = %identity.public_keys().fingerprint(), "device identity created");
        Ok(identity)
    }

    pub fn unlock(&self, passphrase: &Passphrase) -> Result<DeviceIdentity, ThresholdError> {
        let raw = fs::read(self.root.join(IDENTITY_FILE))?;
        let header = Header::from_bytes(&raw)?;
        let key = derive_passphrase_key(passphrase, &header.salt, &header.kdf)?;
        let sealed = Sealed {
            alg: DEFAULT_ALG.to_string(),
            nonce: header.nonce.to_vec(),
            ciphertext: raw[HEADER_SIZE..].to_vec(),
        };
        let plaintext = cipher_for(DEFAULT_ALG)?.open(key.expose(), &sealed, &header.aad())?;
        let payload: Payload = serde_json::from_slice(&plaintext)?;
        Ok(DeviceIdentity::import_secret(payload.device_id.clone(), &payload.secret)?)
    }

    fn seal(&self, identity: &DeviceIdentity, passphrase: &Passphrase, kdf: KdfParams) -> Result<(), ThresholdError> {
        fs::create_dir_all(&self.root)?;
        let salt = generate_salt();
        let key = derive_passphrase_key(passphrase, &salt, &kdf)?;
        let payload = Payload {
            device_id: identity.device_id().to_string(),
            secret: identity.export_secret().to_vec(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);

        // The cipher picks the nonce; the header records it.
        let mut header = Header {
            version: FORMAT_VERSION,
            kdf,
            salt,
            nonce: [0u8; NONCE_LEN],
        };
        let sealed = XChaCha20Poly1305Cipher.seal(key.expose(), &plaintext, &header.aad())?;
        header.nonce.copy_from_slice(&sealed.nonce);

        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(&sealed.ciphertext);
        write_atomic(&self.root.join(IDENTITY_FILE), &out)
    }

    /// Persist an envelope addressed to this device, replacing any earlier one for the same epoch.
    pub fn store_envelope(&self, envelope: &ShareEnvelope) -> Result<(), ThresholdError> {
        let dir = self.root.join(SHARES_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(envelope_file(&envelope.key_ref, envelope.epoch));
        write_atomic(&path, &serde_json::to_vec_pretty(envelope)?)?;
        debug!(key_ref = %envelope.key_ref, epoch = envelope.epoch, "share envelope stored");
        Ok(())
    }

    pub fn envelopes(&self) -> Result<Vec<ShareEnvelope>, ThresholdError> {
        let dir = self.root.join(SHARES_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            out.push(serde_json::from_slice(&fs::read(&path)?)?);
        }
        out.sort_by(|a: &ShareEnvelope, b| (&a.key_ref, a.epoch).cmp(&(&b.key_ref, b.epoch)));
        Ok(out)
    }

    /// Drop envelopes for epochs of `key_ref` older than `keep_from`. Returns how many went.
    pub fn prune(&self, key_ref: &str, keep_from: u64) -> Result<usize, ThresholdError> {
        let mut removed = 0;
        for envelope in self.envelopes()? {
            if envelope.key_ref == key_ref && envelope.epoch < keep_from {
                fs::remove_file(self.root.join(SHARES_DIR).join(envelope_file(key_ref, envelope.epoch)))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn envelope_file(key_ref: &str, epoch: u64) -> String {
    format!("{}-{epoch}.json", hex::encode(key_ref.as_bytes()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ThresholdError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
