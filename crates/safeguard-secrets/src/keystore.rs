//! The short-lived encrypted keystore holding secret envelopes.
//!
//! The queue owns the `approval:*` key namespace. Envelopes are written
//! with a TTL slightly longer than the request's own deadline and deleted
//! explicitly after execution; either way they do not outlive the request
//! by more than the grace period.

use crate::cipher::SecretCipher;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from the keystore or its cipher.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Key material could not be used.
    #[error("invalid keystore key: {0}")]
    InvalidKey(String),

    /// Sealing a payload failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Opening a payload failed (tampering, wrong key, or corruption).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Redis transport failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Encrypted KV store with TTL.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Seal `data` and store it under `key` for `ttl_seconds`.
    async fn store_secret(
        &self,
        key: &str,
        data: &Value,
        ttl_seconds: u64,
    ) -> Result<(), KeystoreError>;

    /// Fetch and open the envelope under `key`, if it is still alive.
    async fn get_secret(&self, key: &str) -> Result<Option<Value>, KeystoreError>;

    /// Remove the envelope under `key`; returns whether one existed.
    async fn delete_secret(&self, key: &str) -> Result<bool, KeystoreError>;
}

/// Redis-backed secret store. Only ciphertext crosses the connection.
pub struct RedisSecretStore {
    client: redis::Client,
    cipher: SecretCipher,
}

impl RedisSecretStore {
    pub fn connect(config: &safeguard_core::KeystoreConfig) -> Result<Self, KeystoreError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let cipher = SecretCipher::from_base64(&config.key_b64)?;
        Ok(Self { client, cipher })
    }

    pub fn with_cipher(client: redis::Client, cipher: SecretCipher) -> Self {
        Self { client, cipher }
    }
}

#[async_trait]
impl SecretStore for RedisSecretStore {
    async fn store_secret(
        &self,
        key: &str,
        data: &Value,
        ttl_seconds: u64,
    ) -> Result<(), KeystoreError> {
        let payload = self.cipher.seal_json(data)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(key, payload, ttl_seconds).await?;
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Value>, KeystoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(sealed) => Ok(Some(self.cipher.open_json(&sealed)?)),
            None => Ok(None),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<bool, KeystoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}

struct StoredSecret {
    payload: String,
    expires_at: DateTime<Utc>,
}

/// In-process secret store for tests and single-node deployments.
///
/// Envelopes are still sealed at rest; TTL expiry makes an entry behave as
/// absent, matching the Redis semantics.
pub struct MemorySecretStore {
    cipher: SecretCipher,
    entries: RwLock<HashMap<String, StoredSecret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::with_cipher(SecretCipher::generate())
    }

    pub fn with_cipher(cipher: SecretCipher) -> Self {
        Self {
            cipher,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn store_secret(
        &self,
        key: &str,
        data: &Value,
        ttl_seconds: u64,
    ) -> Result<(), KeystoreError> {
        let payload = self.cipher.seal_json(data)?;
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds as i64);
        self.entries
            .write()
            .await
            .insert(key.to_string(), StoredSecret { payload, expires_at });
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Value>, KeystoreError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => {
                Ok(Some(self.cipher.open_json(&entry.payload)?))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<bool, KeystoreError> {
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(entry) => Ok(entry.expires_at > Utc::now()),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn store_get_delete_round_trip() {
        let store = MemorySecretStore::new();
        let data = json!({"password": "p@ss"});

        store.store_secret("approval:abc", &data, 60).await.unwrap();
        assert_eq!(store.get_secret("approval:abc").await.unwrap(), Some(data));

        assert!(store.delete_secret("approval:abc").await.unwrap());
        assert!(!store.delete_secret("approval:abc").await.unwrap());
        assert_eq!(store.get_secret("approval:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_behaves_as_absent() {
        let store = MemorySecretStore::new();
        store
            .store_secret("approval:gone", &json!({"token": "t"}), 0)
            .await
            .unwrap();
        assert_eq!(store.get_secret("approval:gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get_secret("approval:missing").await.unwrap(), None);
    }
}
