use crate::config::TransformConfig;
use crate::{Error, Result};
use aes_gcm::Aes256Gcm;
use argon2::Argon2;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::{
    ChaCha20Poly1305, Key,
    aead::{Aead, AeadCore, KeyInit, OsRng, generic_array::GenericArray},
};
use rand::RngCore;
use std::sync::Arc;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric encryption stage of the codec chain.
pub trait Encryptor: Send + Sync {
    fn module(&self) -> &'static str;
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Derives a key with argon2id. The salt is bound to the transform name
    /// so the same password and name always produce the same key.
    pub fn derive_from_password(password: &str, salt_source: &str) -> Result<Self> {
        let salt = blake3::hash(salt_source.as_bytes());
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(password.as_bytes(), &salt.as_bytes()[..16], &mut key)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Configuration(format!("Invalid base64 key: {}", e)))?;
        if bytes.len() != KEY_LEN {
            return Err(Error::Configuration(format!("Key must be {} bytes, got {}", KEY_LEN, bytes.len())));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    pub fn from_config(config: &TransformConfig) -> Result<Self> {
        match (&config.key, &config.password) {
            (Some(key), _) => Self::from_base64(key),
            (None, Some(password)) => Self::derive_from_password(password, &config.name),
            (None, None) => Err(Error::Configuration(format!(
                "Encryption transform {} needs either key or password",
                config.name
            ))),
        }
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }
}

/// Splits `nonce || ciphertext` as produced by the encryptors below.
fn split_nonce(ciphertext: &[u8]) -> Result<(&[u8], &[u8])> {
    if ciphertext.len() < NONCE_LEN {
        return Err(Error::Encryption("Ciphertext too short".to_string()));
    }
    Ok(ciphertext.split_at(NONCE_LEN))
}

pub struct ChaChaEncryptor {
    cipher: ChaCha20Poly1305,
}

impl ChaChaEncryptor {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    pub fn from_config(config: &TransformConfig) -> Result<Arc<dyn Encryptor>> {
        Ok(Arc::new(Self::new(&MasterKey::from_config(config)?)))
    }
}

impl Encryptor for ChaChaEncryptor {
    fn module(&self) -> &'static str {
        "chacha20poly1305"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (nonce, encrypted) = split_nonce(ciphertext)?;
        self.cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), encrypted)
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}

pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptor {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    pub fn from_config(config: &TransformConfig) -> Result<Arc<dyn Encryptor>> {
        Ok(Arc::new(Self::new(&MasterKey::from_config(config)?)))
    }
}

impl Encryptor for AesGcmEncryptor {
    fn module(&self) -> &'static str {
        "aes256gcm"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (nonce, encrypted) = split_nonce(ciphertext)?;
        self.cipher
            .decrypt(GenericArray::from_slice(nonce), encrypted)
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}
