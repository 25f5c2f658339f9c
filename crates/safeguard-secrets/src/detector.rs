//! Field-level secret detection and redaction.
//!
//! Detection is by key name: a fixed deny-list of exact names plus a
//! heuristic pattern for compound names (`db_password`, `session-token`,
//! `ssh_key`, ...). Matching is case-insensitive.
//!
//! Redaction replaces values under sensitive keys with the sentinel. When a
//! sensitive key holds an object, the object shape is preserved and every
//! leaf inside it becomes the sentinel, so the extracted mirror tree can be
//! merged back node by node. Arrays are treated as leaves: they are
//! extracted or redacted wholesale, never descended into, which keeps the
//! merge rule (recurse on objects, overwrite everything else) lossless.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Sentinel standing in for a secret value in the durable store.
pub const REDACTED: &str = "[REDACTED]";

/// Exact key names that always carry secret material.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "secret_key",
    "private_key",
    "credential",
    "credentials",
    "passphrase",
    "auth",
    "authorization",
    "connection_string",
    "dsn",
];

/// Compound names: a sensitive word, optionally pluralised, delimited by
/// `_`/`-` or a boundary.
static SENSITIVE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^|[_-])(password|passwd|pwd|secret|token|key|credential|passphrase)s?([_-]|$)")
        .expect("sensitive-key pattern is valid")
});

/// Whether a key name is classified as carrying a secret.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str()) || SENSITIVE_PATTERN.is_match(&lower)
}

/// Whether any key anywhere in `value` is sensitive.
pub fn has_sensitive_fields(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, val)| is_sensitive_key(key) || has_sensitive_fields(val)),
        _ => false,
    }
}

/// Redacted copy of `value`; the companion secret map is discarded.
pub fn redact_sensitive_fields(value: &Value) -> Value {
    extract_sensitive_fields(value).0
}

/// Splits `value` into a redacted tree and a secret map of the same nested
/// shape holding only the extracted leaves.
pub fn extract_sensitive_fields(value: &Value) -> (Value, Value) {
    match value {
        Value::Object(map) => {
            let mut redacted = Map::with_capacity(map.len());
            let mut secrets = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) {
                    redacted.insert(key.clone(), redact_subtree(val));
                    secrets.insert(key.clone(), val.clone());
                } else if val.is_object() {
                    let (inner_redacted, inner_secrets) = extract_sensitive_fields(val);
                    if inner_secrets
                        .as_object()
                        .is_some_and(|m| !m.is_empty())
                    {
                        secrets.insert(key.clone(), inner_secrets);
                    }
                    redacted.insert(key.clone(), inner_redacted);
                } else {
                    redacted.insert(key.clone(), val.clone());
                }
            }
            (Value::Object(redacted), Value::Object(secrets))
        }
        other => (other.clone(), Value::Object(Map::new())),
    }
}

/// Every leaf under a sensitive key becomes the sentinel; object shape is
/// preserved, arrays and scalars collapse to a single sentinel.
fn redact_subtree(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| (key.clone(), redact_subtree(val)))
                .collect(),
        ),
        _ => Value::String(REDACTED.to_string()),
    }
}

/// Merges a secret map back into a redacted tree, in place.
///
/// Recurses where both sides are objects; everything else is overwritten
/// wholesale. Applied to the pair produced by [`extract_sensitive_fields`]
/// this restores the exact pre-redaction tree.
pub fn merge_secrets(target: &mut Value, secrets: &Value) {
    let Value::Object(secret_map) = secrets else {
        return;
    };
    let Value::Object(target_map) = target else {
        return;
    };
    for (key, secret_val) in secret_map {
        match (target_map.get_mut(key), secret_val) {
            (Some(existing @ Value::Object(_)), Value::Object(_)) => {
                merge_secrets(existing, secret_val);
            }
            _ => {
                target_map.insert(key.clone(), secret_val.clone());
            }
        }
    }
}
