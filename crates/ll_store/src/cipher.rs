//! Sealing entry values under a database key.

use std::collections::HashMap;

use ll_crypto::kdf::derive_passphrase_key;
use ll_crypto::{cipher_for, Cipher, SecretKey, XChaCha20Poly1305Cipher};
use ll_proto::{DatabaseRecord, EncryptionMethod, EntryBody, StoredEntry};
use serde_json::Value;

use crate::credentials::Credential;
use crate::error::{GateError, StoreError};

fn entry_aad(key: &str) -> Vec<u8> {
    format!("ll-entry|{key}").into_bytes()
}

/// The key that opens one database, with its public id.
#[derive(Clone)]
pub struct EntryKey {
    key: SecretKey,
    key_id: String,
}

impl std::fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntryKey({})", self.key_id)
    }
}

impl EntryKey {
    pub fn new(key: SecretKey) -> Self {
        let key_id = key.key_id();
        Self { key, key_id }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn seal(&self, entry_key: &str, value: &Value) -> Result<EntryBody, StoreError> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = XChaCha20Poly1305Cipher.seal(self.key.expose(), &plaintext, &entry_aad(entry_key))?;
        Ok(EntryBody::Sealed {
            key_id: self.key_id.clone(),
            sealed,
        })
    }

    /// Value of `entry`; `None` for deletes.
    pub fn open(&self, entry: &StoredEntry) -> Result<Option<Value>, StoreError> {
        match &entry.body {
            EntryBody::Plain { value } => Ok(Some(value.clone())),
            EntryBody::Delete => Ok(None),
            EntryBody::Sealed { sealed, .. } => {
                let plaintext =
                    cipher_for(&sealed.alg)?.open(self.key.expose(), sealed, &entry_aad(&entry.key))?;
                Ok(Some(serde_json::from_slice(&plaintext)?))
            }
        }
    }

    /// True when `entry` is sealed under this key and opens.
    pub fn verifies(&self, entry: &StoredEntry) -> bool {
        match &entry.body {
            EntryBody::Sealed { key_id, .. } if key_id == &self.key_id => self.open(entry).is_ok(),
            _ => false,
        }
    }
}

/// Several keys by id. A migration reads with the source key and its own target key.
#[derive(Default, Clone)]
pub struct KeyRing {
    keys: HashMap<String, EntryKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: EntryKey) {
        self.keys.insert(key.key_id.clone(), key);
    }

    /// Whether `entry` is readable with the ring: plain, a delete, or sealed under a held key.
    pub fn can_read(&self, entry: &StoredEntry) -> bool {
        match &entry.body {
            EntryBody::Sealed { key_id, .. } => self.keys.contains_key(key_id),
            _ => true,
        }
    }

    pub fn open(&self, entry: &StoredEntry) -> Result<Option<Value>, StoreError> {
        match &entry.body {
            EntryBody::Sealed { key_id, .. } => match self.keys.get(key_id) {
                Some(key) => key.open(entry),
                None => Err(StoreError::MissingKey(entry.key.clone())),
            },
            EntryBody::Plain { value } => Ok(Some(value.clone())),
            EntryBody::Delete => Ok(None),
        }
    }
}

/// Derive the database key a credential stands for under `record`.
pub fn resolve_key(record: &DatabaseRecord, credential: &Credential) -> Result<EntryKey, GateError> {
    match (record.encryption_method, credential) {
        (EncryptionMethod::Password, Credential::Passphrase(passphrase)) => {
            let kdf = record
                .kdf
                .as_ref()
                .ok_or_else(|| StoreError::NotFound(format!("kdf parameters for {}", record.display_name)))?;
            let key = derive_passphrase_key(passphrase, &kdf.salt, &kdf.params)?;
            Ok(EntryKey::new(key))
        }
        (EncryptionMethod::ThresholdV1, Credential::SessionKey { key, epoch }) => {
            if *epoch != record.epoch {
                return Err(GateError::StaleSession {
                    held: *epoch,
                    current: record.epoch,
                });
            }
            Ok(EntryKey::new(key.clone()))
        }
        (method, _) => Err(GateError::CredentialMismatch { method }),
    }
}
