//! The reply contract handed to the transport layer.
//!
//! Guarded transitions resolve to `{"success": true, ...}` or
//! `{"success": false, "error": "..."}` JSON objects. Infrastructure
//! failures are deliberately not representable here: `error` returns
//! `None` for them so the caller keeps propagating the underlying error.

use crate::error::SafeguardError;
use serde::Serialize;
use serde_json::{Value, json};

/// Wrap a successful operation result for the transport layer.
pub fn ok<T: Serialize>(payload: &T) -> Value {
    let mut value = serde_json::to_value(payload).unwrap_or_default();
    if let Value::Object(map) = &mut value {
        map.insert("success".to_string(), Value::Bool(true));
    }
    value
}

/// Wrap a reportable error, or `None` if it must propagate instead.
pub fn error(err: &SafeguardError) -> Option<Value> {
    if err.is_infrastructure() {
        return None;
    }
    Some(json!({"success": false, "error": err.to_string()}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        approval_id: &'static str,
    }

    #[test]
    fn ok_injects_the_success_flag() {
        let value = ok(&Sample { approval_id: "abc" });
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["approval_id"], json!("abc"));
    }

    #[test]
    fn reportable_errors_become_failure_replies() {
        let reply = error(&SafeguardError::Expired("abc".into())).unwrap();
        assert_eq!(reply["success"], json!(false));
        assert!(reply["error"].as_str().unwrap().contains("expired"));
    }

    #[test]
    fn infrastructure_errors_propagate() {
        assert!(error(&SafeguardError::Storage(sqlx::Error::PoolClosed)).is_none());
    }
}
