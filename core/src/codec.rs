//! Compress-then-encrypt codec chain and the static registry of codec modules.
//!
//! Exactly one compression and one encryption transform may be active for new
//! writes. Every configured transform stays loadable, so blobs written while a
//! different transform was active can still be decoded by name.

use crate::compression::{Compressor, ZlibCompressor, ZstdCompressor};
use crate::config::{Config, TransformConfig};
use crate::crypto::{AesGcmEncryptor, ChaChaEncryptor, Encryptor};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type CompressorCtor = fn(&TransformConfig) -> Result<Arc<dyn Compressor>>;
type EncryptorCtor = fn(&TransformConfig) -> Result<Arc<dyn Encryptor>>;

const COMPRESSORS: &[(&str, CompressorCtor)] = &[
    ("zlib", ZlibCompressor::from_config),
    ("zstd", ZstdCompressor::from_config),
];

const ENCRYPTORS: &[(&str, EncryptorCtor)] = &[
    ("chacha20poly1305", ChaChaEncryptor::from_config),
    ("aes256gcm", AesGcmEncryptor::from_config),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Compression,
    Encryption,
}

impl TransformKind {
    pub fn of_module(module: &str) -> Result<Self> {
        if COMPRESSORS.iter().any(|(name, _)| *name == module) {
            Ok(Self::Compression)
        } else if ENCRYPTORS.iter().any(|(name, _)| *name == module) {
            Ok(Self::Encryption)
        } else {
            Err(Error::Configuration(format!("Unknown transform module {}", module)))
        }
    }
}

/// One applied transform, recorded next to each stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub name: String,
    pub module: String,
}

#[derive(Default)]
pub struct CodecChain {
    compressors: HashMap<String, Arc<dyn Compressor>>,
    encryptors: HashMap<String, Arc<dyn Encryptor>>,
    active_compression: Option<String>,
    active_encryption: Option<String>,
}

impl CodecChain {
    /// A chain that stores data as-is.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut chain = Self::default();
        for transform in &config.transforms {
            chain.register(transform)?;
        }
        chain.active_compression = config.storage.active_compression.clone();
        chain.active_encryption = config.storage.active_encryption.clone();

        if let Some(name) = &chain.active_compression {
            if !chain.compressors.contains_key(name) {
                return Err(Error::Configuration(format!("Active compression {} is not usable", name)));
            }
        }
        if let Some(name) = &chain.active_encryption {
            if !chain.encryptors.contains_key(name) {
                return Err(Error::Configuration(format!("Active encryption {} is not usable", name)));
            }
        }
        Ok(chain)
    }

    pub fn register(&mut self, transform: &TransformConfig) -> Result<()> {
        match TransformKind::of_module(&transform.module)? {
            TransformKind::Compression => {
                let ctor = COMPRESSORS
                    .iter()
                    .find(|(name, _)| *name == transform.module)
                    .map(|(_, ctor)| *ctor)
                    .ok_or_else(|| Error::Internal(format!("No constructor for {}", transform.module)))?;
                self.compressors.insert(transform.name.clone(), ctor(transform)?);
            }
            TransformKind::Encryption => {
                let ctor = ENCRYPTORS
                    .iter()
                    .find(|(name, _)| *name == transform.module)
                    .map(|(_, ctor)| *ctor)
                    .ok_or_else(|| Error::Internal(format!("No constructor for {}", transform.module)))?;
                self.encryptors.insert(transform.name.clone(), ctor(transform)?);
            }
        }
        debug!(name = %transform.name, module = %transform.module, "Registered transform");
        Ok(())
    }

    pub fn set_active_compression(&mut self, name: Option<String>) {
        self.active_compression = name;
    }

    pub fn set_active_encryption(&mut self, name: Option<String>) {
        self.active_encryption = name;
    }

    /// Runs the active transforms over `data`: compression first, then encryption.
    /// Compression is dropped when it does not shrink the data.
    pub fn encode(&self, data: &[u8]) -> Result<(Vec<u8>, Vec<TransformRecord>)> {
        let mut records = Vec::new();
        let mut current: Option<Vec<u8>> = None;

        if let Some(name) = &self.active_compression {
            let compressor = self
                .compressors
                .get(name)
                .ok_or_else(|| Error::Configuration(format!("Compression {} is not configured", name)))?;
            let compressed = compressor.compress(data)?;
            if compressed.len() < data.len() {
                records.push(TransformRecord {
                    name: name.clone(),
                    module: compressor.module().to_string(),
                });
                current = Some(compressed);
            }
        }

        if let Some(name) = &self.active_encryption {
            let encryptor = self
                .encryptors
                .get(name)
                .ok_or_else(|| Error::Configuration(format!("Encryption {} is not configured", name)))?;
            let encrypted = encryptor.encrypt(current.as_deref().unwrap_or(data))?;
            records.push(TransformRecord {
                name: name.clone(),
                module: encryptor.module().to_string(),
            });
            current = Some(encrypted);
        }

        Ok((current.unwrap_or_else(|| data.to_vec()), records))
    }

    /// Reverses `transforms` in opposite order of application.
    pub fn decode(&self, data: Vec<u8>, transforms: &[TransformRecord]) -> Result<Vec<u8>> {
        let mut data = data;
        for record in transforms.iter().rev() {
            data = match TransformKind::of_module(&record.module)? {
                TransformKind::Compression => {
                    let compressor = self.compressors.get(&record.name).ok_or_else(|| {
                        Error::Configuration(format!("Compression {} needed to decode data is not configured", record.name))
                    })?;
                    check_module(&record.name, &record.module, compressor.module())?;
                    compressor.decompress(&data)?
                }
                TransformKind::Encryption => {
                    let encryptor = self.encryptors.get(&record.name).ok_or_else(|| {
                        Error::Configuration(format!("Encryption {} needed to decode data is not configured", record.name))
                    })?;
                    check_module(&record.name, &record.module, encryptor.module())?;
                    encryptor.decrypt(&data)?
                }
            };
        }
        Ok(data)
    }
}

fn check_module(name: &str, recorded: &str, configured: &str) -> Result<()> {
    if recorded != configured {
        return Err(Error::Configuration(format!(
            "Transform {} was written with module {} but is configured as {}",
            name, recorded, configured
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(name: &str, module: &str) -> TransformConfig {
        TransformConfig {
            name: name.to_string(),
            module: module.to_string(),
            level: None,
            password: Some("secret".to_string()),
            key: None,
        }
    }

    fn chain(compression: Option<&str>, encryption: Option<&str>) -> CodecChain {
        let mut chain = CodecChain::plain();
        for (name, module) in [("z", "zstd"), ("zl", "zlib"), ("k1", "chacha20poly1305"), ("k2", "aes256gcm")] {
            chain.register(&transform(name, module)).unwrap();
        }
        chain.set_active_compression(compression.map(str::to_string));
        chain.set_active_encryption(encryption.map(str::to_string));
        chain
    }

    #[test]
    fn test_compress_then_encrypt_roundtrip() {
        let chain = chain(Some("z"), Some("k1"));
        let data = vec![7u8; 8192];
        let (encoded, records) = chain.encode(&data).unwrap();
        assert_eq!(records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["z", "k1"]);
        assert_eq!(chain.decode(encoded, &records).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_skips_compression() {
        use rand::RngCore;
        let chain = chain(Some("zl"), None);
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);
        let (encoded, records) = chain.encode(&data).unwrap();
        assert!(records.is_empty());
        assert_eq!(encoded, data);
    }

    #[test]
    fn test_old_codecs_stay_readable() {
        let writer = chain(Some("zl"), Some("k2"));
        let data = vec![1u8; 4096];
        let (encoded, records) = writer.encode(&data).unwrap();

        let reader = chain(Some("z"), Some("k1"));
        assert_eq!(reader.decode(encoded.clone(), &records).unwrap(), data);

        let empty = CodecChain::plain();
        assert!(matches!(empty.decode(encoded, &records), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_unknown_module_rejected() {
        assert!(TransformKind::of_module("lzma").is_err());
        assert_eq!(TransformKind::of_module("zstd").unwrap(), TransformKind::Compression);
        assert_eq!(TransformKind::of_module("aes256gcm").unwrap(), TransformKind::Encryption);
    }
}
