//! Lifecycle statuses for approval requests and deferred actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of an approval request.
///
/// `pending` is the only state from which `approved`, `rejected` or
/// `expired` are reachable; terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for human review.
    Pending,
    /// Approved by an operator.
    Approved,
    /// Rejected by an operator.
    Rejected,
    /// Expired before decision.
    Expired,
    /// Executed after approval.
    Executed,
    /// Execution failed after approval.
    Failed,
    /// Declared for a future coupling with deferred execution; no
    /// transition currently writes it.
    Scheduled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Status of a deferred action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredStatus {
    /// Waiting for its scheduled fire time.
    Pending,
    /// Cancelled before execution.
    Cancelled,
    /// Executed successfully.
    Executed,
    /// Execution failed.
    Failed,
}

impl DeferredStatus {
    pub const ALL: [DeferredStatus; 4] = [
        Self::Pending,
        Self::Cancelled,
        Self::Executed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeferredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeferredStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "cancelled" => Ok(Self::Cancelled),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A status string stored in the database did not match any known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_status_round_trips_through_strings() {
        for status in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
            ApprovalStatus::Executed,
            ApprovalStatus::Failed,
            ApprovalStatus::Scheduled,
        ] {
            assert_eq!(status.as_str().parse::<ApprovalStatus>().unwrap(), status);
        }
    }

    #[test]
    fn deferred_status_round_trips_through_strings() {
        for status in DeferredStatus::ALL {
            assert_eq!(status.as_str().parse::<DeferredStatus>().unwrap(), status);
        }
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&ApprovalStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&DeferredStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!("bogus".parse::<ApprovalStatus>().is_err());
        assert!("bogus".parse::<DeferredStatus>().is_err());
    }
}
