//! In-memory storage backends.
//!
//! These reproduce the Postgres semantics — guarded conditional updates,
//! bulk expiry, unique deferred ids — under a single async lock, for unit
//! tests and embedded single-process deployments. Each guarded transition
//! holds the write lock for its whole check-and-set, which is the
//! in-process equivalent of one conditional UPDATE.

use crate::error::SafeguardError;
use chrono::Utc;
use safeguard_core::{
    ApprovalRecord, ApprovalStatus, DeferredActionRecord, DeferredStats, DeferredStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct MemoryApprovals {
    rows: RwLock<HashMap<Uuid, ApprovalRecord>>,
}

impl MemoryApprovals {
    pub async fn insert(&self, record: ApprovalRecord) {
        self.rows.write().await.insert(record.id, record);
    }

    pub async fn fetch(&self, id: Uuid) -> Option<ApprovalRecord> {
        self.rows.read().await.get(&id).cloned()
    }

    pub async fn list_pending(&self, limit: i64) -> Vec<ApprovalRecord> {
        let now = Utc::now();
        let rows = self.rows.read().await;
        let mut pending: Vec<ApprovalRecord> = rows
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending && r.expires_at > now)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pending.truncate(limit.max(0) as usize);
        pending
    }

    pub async fn approve(
        &self,
        id: Uuid,
        approver: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRecord, SafeguardError> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(&id)
            .ok_or_else(|| SafeguardError::NotFound(id.to_string()))?;

        if record.status != ApprovalStatus::Pending {
            return Err(SafeguardError::InvalidState {
                status: record.status.to_string(),
            });
        }
        if record.expires_at < Utc::now() {
            record.status = ApprovalStatus::Expired;
            return Err(SafeguardError::Expired(id.to_string()));
        }

        record.status = ApprovalStatus::Approved;
        record.approved_at = Some(Utc::now());
        record.approver = Some(approver.to_string());
        record.approval_comment = comment.map(str::to_string);
        Ok(record.clone())
    }

    pub async fn reject(
        &self,
        id: Uuid,
        approver: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRecord, SafeguardError> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(&id)
            .ok_or_else(|| SafeguardError::NotFound(id.to_string()))?;

        if record.status != ApprovalStatus::Pending {
            return Err(SafeguardError::InvalidState {
                status: record.status.to_string(),
            });
        }

        record.status = ApprovalStatus::Rejected;
        record.approved_at = Some(Utc::now());
        record.approver = Some(approver.to_string());
        record.approval_comment = comment.map(str::to_string);
        Ok(record.clone())
    }

    /// Executed/failed is reachable only from approved.
    pub async fn mark_executed(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(record) if record.status == ApprovalStatus::Approved => {
                record.status = status;
                record.executed_at = Some(Utc::now());
                record.execution_result = result;
                record.execution_error = error;
                true
            }
            _ => false,
        }
    }

    pub async fn expire_old(&self) -> u64 {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        let mut count = 0;
        for record in rows.values_mut() {
            if record.status == ApprovalStatus::Pending && record.expires_at < now {
                record.status = ApprovalStatus::Expired;
                count += 1;
            }
        }
        count
    }

    pub async fn arguments(&self, id: Uuid) -> Option<Value> {
        self.rows.read().await.get(&id).map(|r| r.arguments.clone())
    }
}

#[derive(Default)]
pub(crate) struct MemoryDeferred {
    rows: RwLock<HashMap<String, DeferredActionRecord>>,
}

impl MemoryDeferred {
    pub async fn count_with_prefix(&self, prefix: &str) -> i64 {
        self.rows
            .read()
            .await
            .keys()
            .filter(|id| id.starts_with(prefix))
            .count() as i64
    }

    /// Mirrors the unique constraint: an existing id refuses the insert.
    pub async fn try_insert(&self, record: DeferredActionRecord) -> bool {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&record.deferred_id) {
            return false;
        }
        rows.insert(record.deferred_id.clone(), record);
        true
    }

    pub async fn fetch(&self, deferred_id: &str) -> Option<DeferredActionRecord> {
        self.rows.read().await.get(deferred_id).cloned()
    }

    pub async fn list_pending(&self, limit: i64) -> Vec<DeferredActionRecord> {
        let rows = self.rows.read().await;
        let mut pending: Vec<DeferredActionRecord> = rows
            .values()
            .filter(|r| r.status == DeferredStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        pending.truncate(limit.max(0) as usize);
        pending
    }

    pub async fn get_due(&self) -> Vec<DeferredActionRecord> {
        let now = Utc::now();
        let rows = self.rows.read().await;
        let mut due: Vec<DeferredActionRecord> = rows
            .values()
            .filter(|r| r.status == DeferredStatus::Pending && r.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        due
    }

    pub async fn cancel(
        &self,
        deferred_id: &str,
        cancelled_by: &str,
        reason: Option<&str>,
    ) -> Result<DeferredActionRecord, SafeguardError> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(deferred_id)
            .ok_or_else(|| SafeguardError::NotFound(deferred_id.to_string()))?;

        if record.status != DeferredStatus::Pending {
            return Err(SafeguardError::InvalidState {
                status: record.status.to_string(),
            });
        }

        record.status = DeferredStatus::Cancelled;
        record.cancelled_by = Some(cancelled_by.to_string());
        record.cancelled_at = Some(Utc::now());
        record.cancellation_reason = reason.map(str::to_string);
        Ok(record.clone())
    }

    /// Executed/failed is reachable only from pending; cancel is terminal.
    pub async fn mark_executed(
        &self,
        deferred_id: &str,
        status: DeferredStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut rows = self.rows.write().await;
        match rows.get_mut(deferred_id) {
            Some(record) if record.status == DeferredStatus::Pending => {
                record.status = status;
                record.executed_at = Some(Utc::now());
                record.execution_result = result;
                record.execution_error = error;
                true
            }
            _ => false,
        }
    }

    pub async fn stats(&self) -> DeferredStats {
        let rows = self.rows.read().await;
        let mut stats = DeferredStats::default();
        for record in rows.values() {
            stats.record(record.status, 1);
        }
        stats
    }
}
