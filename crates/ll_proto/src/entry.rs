//! Replicated log entries.
//!
//! The external log stores `StoredEntry` values in append order. A key-value database is
//! the fold of that log into latest-value-per-key (`index_view`). A sealed entry has no
//! plaintext structure: seen without a key its `LogEntry::value` is `None`.

use ll_crypto::Sealed;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryBody {
    Plain { value: Value },
    Sealed { key_id: String, sealed: Sealed },
    Delete,
}

impl EntryBody {
    pub fn is_sealed(&self) -> bool {
        matches!(self, EntryBody::Sealed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub hash: String,
    pub seq: u64,
    pub key: String,
    pub body: EntryBody,
}

impl StoredEntry {
    pub fn new(seq: u64, key: impl Into<String>, body: EntryBody) -> Self {
        let key = key.into();
        let body_bytes = serde_json::to_vec(&body).unwrap_or_default();
        let hash = ll_crypto::hash::entry_hash(&key, &body_bytes, seq);
        Self {
            hash,
            seq,
            key,
            body,
        }
    }

    /// What the database exposes without a key.
    pub fn to_log_entry(&self) -> Option<LogEntry> {
        match &self.body {
            EntryBody::Plain { value } => Some(LogEntry {
                hash: self.hash.clone(),
                key: self.key.clone(),
                value: Some(value.clone()),
            }),
            EntryBody::Sealed { .. } => Some(LogEntry {
                hash: self.hash.clone(),
                key: self.key.clone(),
                value: None,
            }),
            EntryBody::Delete => None,
        }
    }
}

/// An entry as seen by the classifier and callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub hash: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Fold the log into the latest live entry per key, ordered by first insertion.
pub fn index_view(entries: &[StoredEntry]) -> Vec<StoredEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, &StoredEntry> = HashMap::new();
    for entry in entries {
        if !latest.contains_key(&entry.key) {
            order.push(entry.key.clone());
        }
        latest.insert(entry.key.clone(), entry);
    }
    order
        .into_iter()
        .filter_map(|key| latest.get(&key).copied())
        .filter(|entry| !matches!(entry.body, EntryBody::Delete))
        .cloned()
        .collect()
}

/// Access policy of a database: who may append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub write: Vec<String>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            write: vec!["*".to_string()],
        }
    }
}

/// The addressing input of a database. Encryption is not part of it, so re-keying in
/// place keeps the address; relocation bumps `generation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: String,
    pub access: AccessPolicy,
    #[serde(default)]
    pub generation: u32,
}

impl Manifest {
    pub fn keyvalue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_type: "keyvalue".to_string(),
            access: AccessPolicy::default(),
            generation: 0,
        }
    }

    pub fn address(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        ll_crypto::hash::address(&bytes)
    }

    pub fn relocated(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }
}
