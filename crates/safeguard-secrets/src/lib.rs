//! # safeguard-secrets
//!
//! Secret handling for the Safeguard approval queue, split in two halves:
//!
//! - **Detector**: recognises argument keys that carry secret material,
//!   redacts their values to `"[REDACTED]"`, extracts the originals into a
//!   mirror tree, and merges them back for execution.
//! - **Keystore**: the short-lived encrypted store holding those mirror
//!   trees under `approval:<id>` with a TTL. Values are sealed with
//!   AES-256-GCM before they reach the transport; the Redis server only
//!   ever sees ciphertext.
//!
//! The split exists so that the durable relational store never contains a
//! raw secret: rows hold redacted trees, envelopes hold the rest, and the
//! two are only recombined in memory at execution time.

pub mod cipher;
pub mod detector;
pub mod keystore;

pub use cipher::{KEY_SIZE, SecretCipher};
pub use detector::{
    REDACTED, extract_sensitive_fields, has_sensitive_fields, is_sensitive_key, merge_secrets,
    redact_sensitive_fields,
};
pub use keystore::{KeystoreError, MemorySecretStore, RedisSecretStore, SecretStore};
