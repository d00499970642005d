use crate::{Error, Result};
use sha2::{Digest, Sha256, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    Blake3,
    Sha256,
    Sha512,
}

impl HashFunction {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "blake3" => Ok(Self::Blake3),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::Configuration(format!("Unsupported hash function {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Lowercase hex digest of `data`.
    pub fn checksum(&self, data: &[u8]) -> String {
        match self {
            Self::Blake3 => blake3::hash(data).to_hex().to_string(),
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }

    /// Checksum of a block consisting only of zero bytes.
    pub fn zero_checksum(&self, size: usize) -> String {
        self.checksum(&vec![0u8; size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            HashFunction::Sha256.checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(HashFunction::Blake3.checksum(b"abc"), blake3::hash(b"abc").to_hex().to_string());
        assert_eq!(HashFunction::Sha512.checksum(b"").len(), 128);
    }

    #[test]
    fn test_zero_checksum_depends_on_size() {
        let hash = HashFunction::Blake3;
        assert_ne!(hash.zero_checksum(4096), hash.zero_checksum(512));
        assert_eq!(hash.zero_checksum(4096), hash.checksum(&[0u8; 4096]));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(HashFunction::from_name("SHA256").unwrap(), HashFunction::Sha256);
        assert!(HashFunction::from_name("md5").is_err());
    }
}
