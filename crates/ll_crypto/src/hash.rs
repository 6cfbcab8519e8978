//! BLAKE3-based hash utilities
//!
//! - Log entry hashes (content addressing of replicated entries)
//! - Database addresses derived from a manifest
//! - Commitments to shares and secrets

/// Domain-separated hash of a replicated log entry.
pub fn entry_hash(key: &str, body: &[u8], seq: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ll-entry-v1\x00");
    hasher.update(key.as_bytes());
    hasher.update(b"\x00");
    hasher.update(&seq.to_le_bytes());
    hasher.update(b"\x00");
    hasher.update(body);
    hex::encode(hasher.finalize().as_bytes())
}

/// Database address from canonical manifest bytes.
pub fn address(manifest: &[u8]) -> String {
    let digest = blake3::derive_key("listlock 2024 database address", manifest);
    format!("/listlock/{}", hex::encode(&digest[..20]))
}

/// Commitment to secret material under a context string. Safe to publish.
pub fn commitment(context: &str, data: &[u8]) -> String {
    hex::encode(blake3::derive_key(context, data))
}

/// Constant-time comparison of equal-length byte strings.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
