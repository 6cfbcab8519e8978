//! In-memory credential cache.
//!
//! Strictly keyed by database id. Nothing here is ever serialised; dropping a
//! `Credential` zeroizes it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ll_crypto::{Passphrase, SecretKey};
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Passphrase(Passphrase),
    /// Threshold session key for one epoch.
    SessionKey { key: SecretKey, epoch: u64 },
}

struct Slot {
    credential: Credential,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct CredentialStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, database_id: &str) -> Option<Credential> {
        let now = Instant::now();
        {
            let slots = self.slots.read();
            match slots.get(database_id) {
                Some(slot) if !slot.expired(now) => return Some(slot.credential.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.slots.write().remove(database_id);
        tracing::debug!(database = database_id, "credential expired");
        None
    }

    pub fn put(&self, database_id: &str, credential: Credential, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.slots.write().insert(
            database_id.to_string(),
            Slot {
                credential,
                expires_at,
            },
        );
    }

    pub fn invalidate(&self, database_id: &str) {
        if self.slots.write().remove(database_id).is_some() {
            tracing::debug!(database = database_id, "credential invalidated");
        }
    }

    /// Drop every expired credential; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| !slot.expired(now));
        before - slots.len()
    }

    /// Session end.
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_strictly_by_database() {
        let store = CredentialStore::new();
        store.put("groceries", Credential::Passphrase("pw".into()), None);
        assert!(store.get("groceries").is_some());
        assert!(store.get("chores").is_none());
        store.invalidate("groceries");
        assert!(store.get("groceries").is_none());
    }

    #[test]
    fn expired_credentials_are_not_returned() {
        let store = CredentialStore::new();
        store.put("groceries", Credential::Passphrase("pw".into()), Some(Duration::ZERO));
        store.put("chores", Credential::Passphrase("pw".into()), Some(Duration::ZERO));
        store.put("keep", Credential::Passphrase("pw".into()), None);
        assert!(store.get("groceries").is_none());
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn session_keys_carry_epoch() {
        let store = CredentialStore::new();
        let key = SecretKey::random();
        store.put("db", Credential::SessionKey { key: key.clone(), epoch: 2 }, None);
        assert_eq!(store.get("db"), Some(Credential::SessionKey { key, epoch: 2 }));
    }
}
