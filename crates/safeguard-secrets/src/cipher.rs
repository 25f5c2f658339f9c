//! At-rest encryption for secret envelopes.
//!
//! AES-256-GCM with a fresh random 12-byte nonce per seal. The compact
//! encoding `1:<nonce_b64>:<ciphertext_b64>` is what actually travels to
//! the keystore transport; the GCM tag authenticates, so a tampered
//! payload fails to open instead of decrypting to garbage.

use crate::keystore::KeystoreError;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::Rng;
use serde_json::Value;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const FORMAT_VERSION: u32 = 1;

/// Symmetric cipher sealing secret envelopes before they leave the process.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_SIZE],
}

impl SecretCipher {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Key material from its base64 encoding (the configuration format).
    pub fn from_base64(key_b64: &str) -> Result<Self, KeystoreError> {
        let bytes = BASE64
            .decode(key_b64.trim())
            .map_err(|e| KeystoreError::InvalidKey(format!("invalid base64: {e}")))?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            KeystoreError::InvalidKey(format!("expected {KEY_SIZE} bytes of key material"))
        })?;
        Ok(Self::new(key))
    }

    /// Fresh random key, for tests and single-process deployments where the
    /// envelopes do not need to survive a restart.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        Self::new(std::array::from_fn(|_| rng.random()))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, KeystoreError> {
        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);

        let mut rng = rand::rng();
        let nonce_bytes: [u8; NONCE_SIZE] = std::array::from_fn(|_| rng.random());
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;

        Ok(format!(
            "{FORMAT_VERSION}:{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, KeystoreError> {
        let parts: Vec<&str> = sealed.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(KeystoreError::Decryption(
                "invalid sealed payload format".to_string(),
            ));
        }

        let version: u32 = parts[0]
            .parse()
            .map_err(|_| KeystoreError::Decryption("invalid version".to_string()))?;
        if version != FORMAT_VERSION {
            return Err(KeystoreError::Decryption(format!(
                "unsupported payload version: {version}"
            )));
        }

        let nonce_bytes = BASE64
            .decode(parts[1])
            .map_err(|e| KeystoreError::Decryption(format!("invalid nonce encoding: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(KeystoreError::Decryption("invalid nonce size".to_string()));
        }
        let ciphertext = BASE64
            .decode(parts[2])
            .map_err(|e| KeystoreError::Decryption(format!("invalid ciphertext encoding: {e}")))?;

        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| KeystoreError::Decryption(e.to_string()))
    }

    pub fn seal_json(&self, value: &Value) -> Result<String, KeystoreError> {
        let plaintext = serde_json::to_vec(value)?;
        self.seal(&plaintext)
    }

    pub fn open_json(&self, sealed: &str) -> Result<Value, KeystoreError> {
        let plaintext = self.open(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of Debug output.
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}
