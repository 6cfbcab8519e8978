use std::path::Path;
use std::time::Duration;

use ll_crypto::KdfParams;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_attempts")]
    pub max_unlock_attempts: u32,
    /// Lifetime of cached passphrase credentials; `None` keeps them until session end.
    #[serde(default)]
    pub credential_ttl_secs: Option<u64>,
    #[serde(default)]
    pub threshold_enabled: bool,
    #[serde(default)]
    pub kdf: KdfParams,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_unlock_attempts: default_max_attempts(),
            credential_ttl_secs: None,
            threshold_enabled: false,
            kdf: KdfParams::default(),
        }
    }
}

impl StoreConfig {
    /// Cheap Argon2 costs, threshold mode on. For tests.
    pub fn for_tests() -> Self {
        Self {
            threshold_enabled: true,
            kdf: KdfParams::minimal(),
            ..Self::default()
        }
    }

    pub fn credential_ttl(&self) -> Option<Duration> {
        self.credential_ttl_secs.map(Duration::from_secs)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: StoreConfig = serde_json::from_str(r#"{"threshold_enabled": true}"#).unwrap();
        assert!(cfg.threshold_enabled);
        assert_eq!(cfg.max_unlock_attempts, 3);
        assert_eq!(cfg.kdf, KdfParams::default());
        assert!(cfg.credential_ttl().is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::load(&dir.path().join("config.json")).unwrap();
        assert!(!cfg.threshold_enabled);
    }
}
