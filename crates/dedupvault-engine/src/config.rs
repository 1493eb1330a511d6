//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, Result};
use crate::fingerprint::{HashAlgorithm, DEFAULT_CHUNK_SIZE};

/// What happens when a canonical record that still has duplicates is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse the delete.
    #[default]
    Forbid,
    /// Make the oldest duplicate canonical and re-point the rest at it.
    PromoteOldest,
}

/// Configuration for a `DedupEngine`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the record store and blobs.
    pub data_dir: PathBuf,
    /// Fingerprint hash function; fixed once a store is created.
    pub hash_algorithm: HashAlgorithm,
    /// Read size while streaming content.
    pub read_chunk_size: usize,
    /// Uploads larger than this are rejected.
    pub max_ingest_bytes: Option<u64>,
    /// Delete behaviour for referenced canonical records.
    pub delete_policy: DeletePolicy,
    /// Keep canonical content bytes in the blob store.
    pub store_content: bool,
    /// WAL appends between automatic checkpoints; 0 disables them.
    pub checkpoint_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./dedupvault-data"),
            hash_algorithm: HashAlgorithm::default(),
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            max_ingest_bytes: None,
            delete_policy: DeletePolicy::default(),
            store_content: true,
            checkpoint_interval: 1024,
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DedupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| DedupError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| DedupError::Config(e.to_string()))?
            }
            _ => {
                return Err(DedupError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        if self.read_chunk_size == 0 {
            return Err(DedupError::Config("read_chunk_size must be > 0".to_string()));
        }
        if self.max_ingest_bytes == Some(0) {
            return Err(DedupError::Config("max_ingest_bytes must be > 0".to_string()));
        }
        if self.store_content && self.data_dir.as_os_str().is_empty() {
            return Err(DedupError::Config(
                "data_dir is required when store_content is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.delete_policy, DeletePolicy::Forbid);
        assert!(config.store_content);
    }

    #[test]
    fn test_from_toml_with_partial_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dvault.toml");
        fs::write(
            &path,
            "data_dir = \"/var/lib/dvault\"\nhash_algorithm = \"blake3\"\ndelete_policy = \"promote_oldest\"\nmax_ingest_bytes = 1048576\n",
        )
        .unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/dvault"));
        assert_eq!(config.hash_algorithm, HashAlgorithm::Blake3);
        assert_eq!(config.delete_policy, DeletePolicy::PromoteOldest);
        assert_eq!(config.max_ingest_bytes, Some(1_048_576));
        assert_eq!(config.read_chunk_size, 4096);
    }

    #[test]
    fn test_from_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dvault.json");
        fs::write(&path, r#"{"store_content": false, "checkpoint_interval": 0}"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert!(!config.store_content);
        assert_eq!(config.checkpoint_interval, 0);
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dvault.toml");
        fs::write(&path, "read_chunk_size = 0\n").unwrap();
        assert!(matches!(EngineConfig::from_file(&path), Err(DedupError::Config(_))));

        let yaml = dir.path().join("dvault.yaml");
        fs::write(&yaml, "data_dir: x\n").unwrap();
        assert!(matches!(EngineConfig::from_file(&yaml), Err(DedupError::Config(_))));

        fs::write(&path, "hash_algorithm = \"md5\"\n").unwrap();
        assert!(matches!(EngineConfig::from_file(&path), Err(DedupError::Config(_))));
    }
}
