//! Entity records and the operator-facing views derived from them.
//!
//! Records mirror the two durable tables column for column. Views are what
//! the transport layer serializes back to operators: they carry the same
//! data plus the computed countdowns (`time_remaining_seconds`,
//! `time_until_execution`).
//!
//! The `arguments` / `parameters` payloads on records are always the
//! redacted trees; raw secret material lives only in the keystore.

use crate::status::{ApprovalStatus, DeferredStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Seconds from now until `later`, clamped at zero.
pub fn remaining_seconds(later: DateTime<Utc>) -> i64 {
    (later - Utc::now()).num_seconds().max(0)
}

/// A row of `safeguard_approvals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub tool_name: String,
    /// Redacted argument tree.
    pub arguments: Value,
    pub security_level: String,
    pub requester_ip: Option<String>,
    pub context: Value,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
}

impl ApprovalRecord {
    /// Whether the request is past its deadline, independent of whether the
    /// sweeper has already written `expired`.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending && !self.is_expired()
    }
}

/// Result of creating an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub approval_id: Uuid,
    pub tool_name: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_minutes: i64,
}

/// One entry of the pending-approvals listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub approval_id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
    pub security_level: String,
    pub requester_ip: Option<String>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub time_remaining_seconds: i64,
}

/// Result of a successful approval, ready to hand to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedAction {
    pub approval_id: Uuid,
    pub tool_name: String,
    /// Still redacted; the executor reconstitutes via `get_full_arguments`.
    pub arguments: Value,
    pub status: ApprovalStatus,
    pub approver: String,
    pub message: String,
}

/// Result of a successful rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedAction {
    pub approval_id: Uuid,
    pub status: ApprovalStatus,
    pub message: String,
}

/// A row of `safeguard_deferred_actions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredActionRecord {
    /// Human identifier `DEF-YYYY-NNN`, year-scoped and contiguous.
    pub deferred_id: String,
    pub approval_id: Uuid,
    pub tool_name: String,
    /// Redacted parameter tree.
    pub parameters: Value,
    pub security_level: String,
    pub delay_hours: i64,
    pub scheduled_at: DateTime<Utc>,
    pub status: DeferredStatus,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

impl DeferredActionRecord {
    /// A pending action whose fire time has passed is due.
    pub fn is_due(&self) -> bool {
        self.status == DeferredStatus::Pending && self.scheduled_at <= Utc::now()
    }
}

/// Result of creating a deferred action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredTicket {
    pub deferred_id: String,
    pub approval_id: Uuid,
    pub tool_name: String,
    pub security_level: String,
    pub status: DeferredStatus,
    pub delay_hours: i64,
    pub scheduled_at: DateTime<Utc>,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub time_until_execution: i64,
}

/// One entry of the pending-deferred listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredSummary {
    pub deferred_id: String,
    pub approval_id: Uuid,
    pub tool_name: String,
    pub parameters: Value,
    pub security_level: String,
    pub delay_hours: i64,
    pub scheduled_at: DateTime<Utc>,
    pub time_until_execution: i64,
    pub status: DeferredStatus,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_comment: Option<String>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

/// Hand-off payload for the executor: a pending action whose fire time has
/// passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DueAction {
    pub deferred_id: String,
    pub approval_id: Uuid,
    pub tool_name: String,
    pub parameters: Value,
    pub security_level: String,
    pub context: Value,
}

/// Result of a successful cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledAction {
    pub deferred_id: String,
    pub status: DeferredStatus,
    pub message: String,
}

/// Full detail view of one deferred action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredDetail {
    #[serde(flatten)]
    pub record: DeferredActionRecord,
    /// Seconds until the fire time; zero once the action is no longer
    /// pending.
    pub time_until_execution: i64,
}

impl From<DeferredActionRecord> for DeferredDetail {
    fn from(record: DeferredActionRecord) -> Self {
        let time_until_execution = if record.status == DeferredStatus::Pending {
            remaining_seconds(record.scheduled_at)
        } else {
            0
        };
        Self {
            record,
            time_until_execution,
        }
    }
}

/// Per-status counts of deferred actions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeferredStats {
    pub pending: i64,
    pub cancelled: i64,
    pub executed: i64,
    pub failed: i64,
    pub total: i64,
}

impl DeferredStats {
    pub fn record(&mut self, status: DeferredStatus, count: i64) {
        match status {
            DeferredStatus::Pending => self.pending += count,
            DeferredStatus::Cancelled => self.cancelled += count,
            DeferredStatus::Executed => self.executed += count,
            DeferredStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(expires_in: Duration) -> ApprovalRecord {
        let now = Utc::now();
        ApprovalRecord {
            id: Uuid::new_v4(),
            tool_name: "exec_sql".into(),
            arguments: serde_json::json!({"query": "SELECT 1"}),
            security_level: "L3".into(),
            requester_ip: None,
            context: serde_json::json!({}),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + expires_in,
            approved_at: None,
            approver: None,
            approval_comment: None,
            executed_at: None,
            execution_result: None,
            execution_error: None,
        }
    }

    #[test]
    fn pending_record_within_ttl_is_pending() {
        let r = record(Duration::hours(1));
        assert!(r.is_pending());
        assert!(!r.is_expired());
    }

    #[test]
    fn record_past_deadline_is_semantically_expired() {
        let r = record(Duration::seconds(-1));
        assert!(r.is_expired());
        assert!(!r.is_pending());
    }

    #[test]
    fn remaining_seconds_clamps_at_zero() {
        assert_eq!(remaining_seconds(Utc::now() - Duration::minutes(5)), 0);
        let left = remaining_seconds(Utc::now() + Duration::minutes(5));
        assert!(left > 290 && left <= 300);
    }

    #[test]
    fn detail_countdown_is_zero_once_cancelled() {
        let now = Utc::now();
        let record = DeferredActionRecord {
            deferred_id: "DEF-2026-001".into(),
            approval_id: Uuid::new_v4(),
            tool_name: "exec_sql".into(),
            parameters: serde_json::json!({}),
            security_level: "L3".into(),
            delay_hours: 24,
            scheduled_at: now + Duration::hours(24),
            status: DeferredStatus::Cancelled,
            approved_by: "alice".into(),
            approved_at: now,
            approval_comment: None,
            cancelled_by: Some("bob".into()),
            cancelled_at: Some(now),
            cancellation_reason: None,
            executed_at: None,
            execution_result: None,
            execution_error: None,
            context: serde_json::json!({}),
            created_at: now,
        };
        let detail = DeferredDetail::from(record);
        assert_eq!(detail.time_until_execution, 0);
    }

    #[test]
    fn stats_accumulate_per_status() {
        let mut stats = DeferredStats::default();
        stats.record(DeferredStatus::Pending, 3);
        stats.record(DeferredStatus::Executed, 2);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.total, 5);
    }
}
