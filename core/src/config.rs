use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub block_size: u64,
    pub hash_function: String,
    pub disallow_remove_when_younger_than_days: u32,
    pub metadata_path: PathBuf,
    pub storage: StorageConfig,
    pub io: IoConfig,
    pub transforms: Vec<TransformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub path: Option<PathBuf>,
    pub bucket: Option<String>,
    pub prefix: String,
    pub endpoint: Option<String>,
    pub simultaneous_reads: usize,
    pub simultaneous_writes: usize,
    pub bandwidth_read: u64,
    pub bandwidth_write: u64,
    pub active_compression: Option<String>,
    pub active_encryption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub simultaneous_reads: usize,
    pub bandwidth_read: u64,
    pub bandwidth_write: u64,
}

/// A named compression or encryption codec instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub password: Option<String>,
    /// Base64 encoded raw key.
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            hash_function: "blake3".to_string(),
            disallow_remove_when_younger_than_days: 6,
            metadata_path: PathBuf::from("/var/lib/blocksnap/metadata.sqlite"),
            storage: StorageConfig::default(),
            io: IoConfig::default(),
            transforms: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: Some(PathBuf::from("/var/lib/blocksnap/data")),
            bucket: None,
            prefix: String::new(),
            endpoint: None,
            simultaneous_reads: 3,
            simultaneous_writes: 3,
            bandwidth_read: 0,
            bandwidth_write: 0,
            active_compression: None,
            active_encryption: None,
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            simultaneous_reads: 3,
            bandwidth_read: 0,
            bandwidth_write: 0,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Configuration(format!("Unable to read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn transform(&self, name: &str) -> Option<&TransformConfig> {
        self.transforms.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 512 != 0 {
            return Err(Error::Configuration(format!(
                "block_size must be a positive multiple of 512, got {}",
                self.block_size
            )));
        }
        crate::checksum::HashFunction::from_name(&self.hash_function)?;

        if self.storage.simultaneous_reads == 0 || self.storage.simultaneous_writes == 0 || self.io.simultaneous_reads == 0 {
            return Err(Error::Configuration("Worker counts must be at least 1".to_string()));
        }

        for (i, transform) in self.transforms.iter().enumerate() {
            if self.transforms[..i].iter().any(|t| t.name == transform.name) {
                return Err(Error::Configuration(format!("Duplicate transform name {}", transform.name)));
            }
            crate::codec::TransformKind::of_module(&transform.module)?;
        }

        if let Some(name) = &self.storage.active_compression {
            let transform = self
                .transform(name)
                .ok_or_else(|| Error::Configuration(format!("Active compression {} is not configured", name)))?;
            if crate::codec::TransformKind::of_module(&transform.module)? != crate::codec::TransformKind::Compression {
                return Err(Error::Configuration(format!("Transform {} is not a compression module", name)));
            }
        }

        if let Some(name) = &self.storage.active_encryption {
            let transform = self
                .transform(name)
                .ok_or_else(|| Error::Configuration(format!("Active encryption {} is not configured", name)))?;
            if crate::codec::TransformKind::of_module(&transform.module)? != crate::codec::TransformKind::Encryption {
                return Err(Error::Configuration(format!("Transform {} is not an encryption module", name)));
            }
        }

        match self.storage.backend.as_str() {
            "file" if self.storage.path.is_none() => {
                Err(Error::Configuration("storage.path is required for the file backend".to_string()))
            }
            "s3" if self.storage.bucket.is_none() => {
                Err(Error::Configuration("storage.bucket is required for the s3 backend".to_string()))
            }
            "file" | "s3" | "memory" => Ok(()),
            other => Err(Error::Configuration(format!("Unknown storage backend {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            block_size = 65536
            hash_function = "sha256"
            metadata_path = "/tmp/meta.sqlite"

            [storage]
            backend = "file"
            path = "/tmp/data"
            simultaneous_writes = 5
            active_compression = "fast"
            active_encryption = "k1"

            [[transforms]]
            name = "fast"
            module = "zstd"
            level = 1

            [[transforms]]
            name = "k1"
            module = "chacha20poly1305"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.block_size, 65536);
        assert_eq!(config.storage.simultaneous_writes, 5);
        assert_eq!(config.storage.simultaneous_reads, 3);
        assert_eq!(config.transform("fast").unwrap().level, Some(1));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_toml("block_size = 1000").is_err());
        assert!(Config::from_toml("hash_function = \"md4\"").is_err());
        assert!(Config::from_toml("[storage]\nactive_compression = \"missing\"").is_err());
        assert!(Config::from_toml(
            "[storage]\nactive_compression = \"k\"\n[[transforms]]\nname = \"k\"\nmodule = \"aes256gcm\"\npassword = \"x\""
        )
        .is_err());
        assert!(Config::from_toml("[storage]\nbackend = \"s3\"").is_err());
    }
}
