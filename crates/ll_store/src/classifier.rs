//! Detect whether synced entries are encrypted.
//!
//! A cipher-only entry has a hash and no readable value. The classifier never guesses:
//! a mix of readable and cipher-only entries is an error.

use ll_proto::{entry::index_view, LogEntry, StoredEntry};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// No entries to look at; callers should prefer the registry.
    Empty,
    /// Every entry agreed.
    Unanimous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub encrypted: bool,
    pub confidence: Confidence,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{readable} readable, {cipher_only} cipher-only, {malformed} malformed entries")]
pub struct Ambiguous {
    pub readable: usize,
    pub cipher_only: usize,
    pub malformed: usize,
}

pub fn classify(entries: &[LogEntry]) -> Result<Classification, Ambiguous> {
    if entries.is_empty() {
        return Ok(Classification {
            encrypted: false,
            confidence: Confidence::Empty,
            entries: 0,
        });
    }
    let mut readable = 0;
    let mut cipher_only = 0;
    let mut malformed = 0;
    for entry in entries {
        match (&entry.value, entry.hash.is_empty()) {
            (Some(_), _) => readable += 1,
            (None, false) => cipher_only += 1,
            (None, true) => malformed += 1,
        }
    }
    if cipher_only == entries.len() {
        return Ok(Classification {
            encrypted: true,
            confidence: Confidence::Unanimous,
            entries: entries.len(),
        });
    }
    if readable == entries.len() {
        return Ok(Classification {
            encrypted: false,
            confidence: Confidence::Unanimous,
            entries: entries.len(),
        });
    }
    Err(Ambiguous {
        readable,
        cipher_only,
        malformed,
    })
}

/// Classify the key-value view of a raw log.
pub fn classify_log(stored: &[StoredEntry]) -> Result<Classification, Ambiguous> {
    let view: Vec<LogEntry> = index_view(stored)
        .iter()
        .filter_map(StoredEntry::to_log_entry)
        .collect();
    classify(&view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ll_crypto::Sealed;
    use ll_proto::EntryBody;
    use serde_json::json;

    fn readable(key: &str) -> LogEntry {
        LogEntry {
            hash: format!("h-{key}"),
            key: key.into(),
            value: Some(json!(key)),
        }
    }

    fn cipher(key: &str) -> LogEntry {
        LogEntry {
            hash: format!("h-{key}"),
            key: key.into(),
            value: None,
        }
    }

    #[test]
    fn empty_is_unencrypted_with_empty_confidence() {
        let c = classify(&[]).unwrap();
        assert!(!c.encrypted);
        assert_eq!(c.confidence, Confidence::Empty);
    }

    #[test]
    fn unanimous_sets() {
        assert!(classify(&[cipher("a"), cipher("b")]).unwrap().encrypted);
        assert!(!classify(&[readable("a"), readable("b")]).unwrap().encrypted);
    }

    #[test]
    fn mixed_is_ambiguous() {
        let err = classify(&[readable("a"), cipher("b")]).unwrap_err();
        assert_eq!(err.readable, 1);
        assert_eq!(err.cipher_only, 1);
    }

    #[test]
    fn missing_hash_is_never_encrypted() {
        let mut broken = cipher("a");
        broken.hash.clear();
        assert!(classify(&[broken, cipher("b")]).is_err());
    }

    #[test]
    fn log_view_ignores_superseded_plaintext() {
        let sealed = EntryBody::Sealed {
            key_id: "k".into(),
            sealed: Sealed {
                alg: "xchacha20poly1305".into(),
                nonce: vec![0; 24],
                ciphertext: vec![1, 2, 3],
            },
        };
        let log = vec![
            StoredEntry::new(1, "milk", EntryBody::Plain { value: json!(1) }),
            StoredEntry::new(2, "milk", sealed),
            StoredEntry::new(3, "gone", EntryBody::Plain { value: json!(2) }),
            StoredEntry::new(4, "gone", EntryBody::Delete),
        ];
        let c = classify_log(&log).unwrap();
        assert!(c.encrypted);
        assert_eq!(c.entries, 1);
    }
}
