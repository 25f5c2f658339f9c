//! Error taxonomy for the approval core.

use safeguard_core::ParseStatusError;
use safeguard_secrets::KeystoreError;
use thiserror::Error;

/// Errors that can occur across the queue, the deferred manager, and the
/// sweeper.
///
/// The first four variants are client-reportable outcomes of a guarded
/// transition; the rest are infrastructure failures and propagate so the
/// operator sees them instead of a silent success.
#[derive(Debug, Error)]
pub enum SafeguardError {
    /// Referenced id does not exist.
    #[error("approval request not found: {0}")]
    NotFound(String),

    /// Transition not allowed from the row's current status.
    #[error("already processed (status: {status})")]
    InvalidState { status: String },

    /// Pending request past its deadline.
    #[error("approval request expired: {0}")]
    Expired(String),

    /// Deferred id collision survived the whole retry budget.
    #[error("deferred id allocation conflict after {attempts} attempts")]
    Conflict { attempts: u32 },

    /// Relational store failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Keystore failure.
    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    /// A stored status string did not parse.
    #[error("corrupt row: {0}")]
    Corrupt(#[from] ParseStatusError),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SafeguardError {
    /// Whether this is an infrastructure failure rather than a reportable
    /// outcome of a guarded transition.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Keystore(_) | Self::Corrupt(_) | Self::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_categories_are_not_infrastructure() {
        assert!(!SafeguardError::NotFound("x".into()).is_infrastructure());
        assert!(
            !SafeguardError::InvalidState {
                status: "approved".into()
            }
            .is_infrastructure()
        );
        assert!(!SafeguardError::Expired("x".into()).is_infrastructure());
        assert!(!SafeguardError::Conflict { attempts: 8 }.is_infrastructure());
    }

    #[test]
    fn storage_failures_are_infrastructure() {
        assert!(SafeguardError::Storage(sqlx::Error::PoolClosed).is_infrastructure());
        assert!(
            SafeguardError::Keystore(KeystoreError::Encryption("boom".into()))
                .is_infrastructure()
        );
    }
}
