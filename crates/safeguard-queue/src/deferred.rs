//! Deferred actions (stage two of the gate).
//!
//! An approved invocation is parked here with a fire time `delay_hours` in
//! the future (24h for L3, 48h for L4 by default). Until that time any
//! operator may cancel it; once due, the sweeper hands it to the executor.
//!
//! Identifiers are human-friendly (`DEF-YYYY-NNN`), year-scoped and
//! contiguous. Allocation counts existing ids for the year and relies on
//! the unique constraint to catch two concurrent creations observing the
//! same count; the loser retries with the next count.

use crate::error::SafeguardError;
use crate::memory::MemoryDeferred;
use chrono::{DateTime, Datelike, Duration, Utc};
use safeguard_core::{
    CancelledAction, DeferredActionRecord, DeferredDetail, DeferredStats, DeferredStatus,
    DeferredSummary, DeferredTicket, DelayPolicy, DueAction, remaining_seconds,
};
use serde_json::{Value, json};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

/// Bounded retry budget for id allocation races.
const ID_ALLOC_ATTEMPTS: u32 = 8;

/// Parameters for scheduling an approved action.
#[derive(Debug, Clone)]
pub struct NewDeferredAction {
    pub approval_id: Uuid,
    pub tool_name: String,
    /// Redacted parameter tree, as carried over from the approval row.
    pub parameters: Value,
    pub security_level: String,
    pub approved_by: String,
    pub approval_comment: Option<String>,
    pub context: Option<Value>,
    /// Overrides the per-level delay policy.
    pub delay_hours: Option<i64>,
}

/// Storage backend for deferred actions.
enum DeferredBackend {
    Postgres(PgPool),
    Memory(MemoryDeferred),
}

/// Manager for the deferred action lifecycle.
pub struct DeferredActionManager {
    backend: DeferredBackend,
    delay_policy: DelayPolicy,
}

impl DeferredActionManager {
    /// Manager backed by PostgreSQL. Run [`crate::schema::migrate`] first.
    pub fn with_pool(pool: PgPool, delay_policy: DelayPolicy) -> Self {
        Self {
            backend: DeferredBackend::Postgres(pool),
            delay_policy,
        }
    }

    /// Manager backed by in-process storage.
    pub fn in_memory(delay_policy: DelayPolicy) -> Self {
        Self {
            backend: DeferredBackend::Memory(MemoryDeferred::default()),
            delay_policy,
        }
    }

    /// Schedule an approved action for delayed execution.
    pub async fn create(
        &self,
        action: NewDeferredAction,
    ) -> Result<DeferredTicket, SafeguardError> {
        let delay_hours = action
            .delay_hours
            .unwrap_or_else(|| self.delay_policy.delay_hours(&action.security_level));
        let now = Utc::now();
        let scheduled_at = now + Duration::hours(delay_hours);
        let context = action.context.unwrap_or_else(|| json!({}));

        for attempt in 1..=ID_ALLOC_ATTEMPTS {
            let prefix = format!("DEF-{}-", Utc::now().year());
            let count = self.count_with_prefix(&prefix).await?;
            let deferred_id = format!("{prefix}{:03}", count + 1);

            let record = DeferredActionRecord {
                deferred_id: deferred_id.clone(),
                approval_id: action.approval_id,
                tool_name: action.tool_name.clone(),
                parameters: action.parameters.clone(),
                security_level: action.security_level.clone(),
                delay_hours,
                scheduled_at,
                status: DeferredStatus::Pending,
                approved_by: action.approved_by.clone(),
                approved_at: now,
                approval_comment: action.approval_comment.clone(),
                cancelled_by: None,
                cancelled_at: None,
                cancellation_reason: None,
                executed_at: None,
                execution_result: None,
                execution_error: None,
                context: context.clone(),
                created_at: now,
            };

            if self.try_insert(&record).await?.is_none() {
                tracing::debug!(deferred_id = %deferred_id, attempt, "Deferred id taken, retrying");
                continue;
            }

            tracing::warn!(
                deferred_id = %deferred_id,
                approval_id = %action.approval_id,
                tool_name = %action.tool_name,
                scheduled_at = %scheduled_at.to_rfc3339(),
                delay_hours,
                "deferred_action_created"
            );

            return Ok(DeferredTicket {
                deferred_id,
                approval_id: action.approval_id,
                tool_name: action.tool_name,
                security_level: action.security_level,
                status: DeferredStatus::Pending,
                delay_hours,
                scheduled_at,
                approved_by: action.approved_by,
                approved_at: now,
                time_until_execution: delay_hours * 3600,
            });
        }

        Err(SafeguardError::Conflict {
            attempts: ID_ALLOC_ATTEMPTS,
        })
    }

    async fn count_with_prefix(&self, prefix: &str) -> Result<i64, SafeguardError> {
        match &self.backend {
            DeferredBackend::Postgres(pool) => Ok(sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM safeguard_deferred_actions WHERE deferred_id LIKE $1",
            )
            .bind(format!("{prefix}%"))
            .fetch_one(pool)
            .await?),
            DeferredBackend::Memory(store) => Ok(store.count_with_prefix(prefix).await),
        }
    }

    /// `None` means the id was taken by a concurrent creation.
    async fn try_insert(
        &self,
        record: &DeferredActionRecord,
    ) -> Result<Option<DateTime<Utc>>, SafeguardError> {
        match &self.backend {
            DeferredBackend::Postgres(pool) => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO safeguard_deferred_actions
                        (deferred_id, approval_id, tool_name, parameters, security_level,
                         delay_hours, scheduled_at, approved_by, approved_at,
                         approval_comment, context)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    RETURNING created_at
                    "#,
                )
                .bind(&record.deferred_id)
                .bind(record.approval_id)
                .bind(&record.tool_name)
                .bind(&record.parameters)
                .bind(&record.security_level)
                .bind(record.delay_hours as i32)
                .bind(record.scheduled_at)
                .bind(&record.approved_by)
                .bind(record.approved_at)
                .bind(&record.approval_comment)
                .bind(&record.context)
                .fetch_one(pool)
                .await;

                match inserted {
                    Ok(row) => Ok(Some(row.try_get("created_at")?)),
                    Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            DeferredBackend::Memory(store) => Ok(store
                .try_insert(record.clone())
                .await
                .then_some(record.created_at)),
        }
    }

    /// Pending actions, soonest fire time first.
    pub async fn list_pending(
        &self,
        limit: i64,
    ) -> Result<Vec<DeferredSummary>, SafeguardError> {
        let records = match &self.backend {
            DeferredBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT *
                    FROM safeguard_deferred_actions
                    WHERE status = 'pending'
                    ORDER BY scheduled_at ASC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(pool)
                .await?;
                rows.iter()
                    .map(deferred_from_row)
                    .collect::<Result<Vec<_>, _>>()?
            }
            DeferredBackend::Memory(store) => store.list_pending(limit).await,
        };

        Ok(records
            .into_iter()
            .map(|r| DeferredSummary {
                time_until_execution: remaining_seconds(r.scheduled_at),
                deferred_id: r.deferred_id,
                approval_id: r.approval_id,
                tool_name: r.tool_name,
                parameters: r.parameters,
                security_level: r.security_level,
                delay_hours: r.delay_hours,
                scheduled_at: r.scheduled_at,
                status: r.status,
                approved_by: r.approved_by,
                approved_at: r.approved_at,
                approval_comment: r.approval_comment,
                context: r.context,
                created_at: r.created_at,
            })
            .collect())
    }

    /// Pending actions whose fire time has passed, oldest first.
    ///
    /// No status change happens here; the executor flips the row out of
    /// pending via [`Self::mark_executed`] when it dispatches.
    pub async fn get_due(&self) -> Result<Vec<DueAction>, SafeguardError> {
        let records = match &self.backend {
            DeferredBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT *
                    FROM safeguard_deferred_actions
                    WHERE status = 'pending' AND scheduled_at <= NOW()
                    ORDER BY scheduled_at ASC
                    "#,
                )
                .fetch_all(pool)
                .await?;
                rows.iter()
                    .map(deferred_from_row)
                    .collect::<Result<Vec<_>, _>>()?
            }
            DeferredBackend::Memory(store) => store.get_due().await,
        };

        Ok(records
            .into_iter()
            .map(|r| DueAction {
                deferred_id: r.deferred_id,
                approval_id: r.approval_id,
                tool_name: r.tool_name,
                parameters: r.parameters,
                security_level: r.security_level,
                context: r.context,
            })
            .collect())
    }

    /// Cancel a pending action before it fires.
    pub async fn cancel(
        &self,
        deferred_id: &str,
        cancelled_by: &str,
        reason: Option<&str>,
    ) -> Result<CancelledAction, SafeguardError> {
        let tool_name = match &self.backend {
            DeferredBackend::Postgres(pool) => {
                self.cancel_pg(pool, deferred_id, cancelled_by, reason).await?
            }
            DeferredBackend::Memory(store) => {
                store.cancel(deferred_id, cancelled_by, reason).await?.tool_name
            }
        };

        tracing::info!(
            deferred_id = %deferred_id,
            tool_name = %tool_name,
            cancelled_by = %cancelled_by,
            reason = reason.unwrap_or(""),
            "deferred_action_cancelled"
        );

        Ok(CancelledAction {
            deferred_id: deferred_id.to_string(),
            status: DeferredStatus::Cancelled,
            message: "Action cancelled.".to_string(),
        })
    }

    async fn cancel_pg(
        &self,
        pool: &PgPool,
        deferred_id: &str,
        cancelled_by: &str,
        reason: Option<&str>,
    ) -> Result<String, SafeguardError> {
        let row = sqlx::query(
            "SELECT status FROM safeguard_deferred_actions WHERE deferred_id = $1",
        )
        .bind(deferred_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| SafeguardError::NotFound(deferred_id.to_string()))?;

        let status = DeferredStatus::from_str(row.try_get::<String, _>("status")?.as_str())?;
        if status != DeferredStatus::Pending {
            return Err(SafeguardError::InvalidState {
                status: status.to_string(),
            });
        }

        let updated = sqlx::query(
            r#"
            UPDATE safeguard_deferred_actions
            SET status = 'cancelled',
                cancelled_by = $2,
                cancelled_at = NOW(),
                cancellation_reason = $3
            WHERE deferred_id = $1 AND status = 'pending'
            RETURNING tool_name
            "#,
        )
        .bind(deferred_id)
        .bind(cancelled_by)
        .bind(reason)
        .fetch_optional(pool)
        .await?;

        match updated {
            Some(row) => Ok(row.try_get("tool_name")?),
            // Zero rows: a concurrent transition won the race.
            None => {
                let row = sqlx::query(
                    "SELECT status FROM safeguard_deferred_actions WHERE deferred_id = $1",
                )
                .bind(deferred_id)
                .fetch_optional(pool)
                .await?;
                Err(match row {
                    Some(row) => SafeguardError::InvalidState {
                        status: row.try_get::<String, _>("status")?,
                    },
                    None => SafeguardError::NotFound(deferred_id.to_string()),
                })
            }
        }
    }

    /// Record the executor's outcome. Only a pending action can move to
    /// executed/failed — cancellation is terminal — and the same guard is
    /// what makes sweeper dispatch at-most-once. Returns whether a row
    /// transitioned.
    pub async fn mark_executed(
        &self,
        deferred_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<bool, SafeguardError> {
        let status = if error.is_none() {
            DeferredStatus::Executed
        } else {
            DeferredStatus::Failed
        };
        let has_error = error.is_some();

        let updated = match &self.backend {
            DeferredBackend::Postgres(pool) => {
                let outcome = sqlx::query(
                    r#"
                    UPDATE safeguard_deferred_actions
                    SET status = $2,
                        executed_at = NOW(),
                        execution_result = $3,
                        execution_error = $4
                    WHERE deferred_id = $1 AND status = 'pending'
                    "#,
                )
                .bind(deferred_id)
                .bind(status.as_str())
                .bind(&result)
                .bind(&error)
                .execute(pool)
                .await?;
                outcome.rows_affected() > 0
            }
            DeferredBackend::Memory(store) => {
                store.mark_executed(deferred_id, status, result, error).await
            }
        };

        if updated {
            tracing::info!(
                deferred_id = %deferred_id,
                status = %status,
                has_error,
                "deferred_action_executed"
            );
        }
        Ok(updated)
    }

    /// Full detail view, countdown included while pending.
    pub async fn get(
        &self,
        deferred_id: &str,
    ) -> Result<Option<DeferredDetail>, SafeguardError> {
        let record = match &self.backend {
            DeferredBackend::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT * FROM safeguard_deferred_actions WHERE deferred_id = $1",
                )
                .bind(deferred_id)
                .fetch_optional(pool)
                .await?;
                row.as_ref().map(deferred_from_row).transpose()?
            }
            DeferredBackend::Memory(store) => store.fetch(deferred_id).await,
        };
        Ok(record.map(DeferredDetail::from))
    }

    /// Per-status counts; statuses with no rows report zero.
    pub async fn stats(&self) -> Result<DeferredStats, SafeguardError> {
        match &self.backend {
            DeferredBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT status, COUNT(*) AS count FROM safeguard_deferred_actions \
                     GROUP BY status",
                )
                .fetch_all(pool)
                .await?;
                let mut stats = DeferredStats::default();
                for row in rows {
                    let status =
                        DeferredStatus::from_str(row.try_get::<String, _>("status")?.as_str())?;
                    stats.record(status, row.try_get::<i64, _>("count")?);
                }
                Ok(stats)
            }
            DeferredBackend::Memory(store) => Ok(store.stats().await),
        }
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        if let DeferredBackend::Postgres(pool) = &self.backend {
            pool.close().await;
        }
    }
}

fn deferred_from_row(row: &PgRow) -> Result<DeferredActionRecord, SafeguardError> {
    let status = DeferredStatus::from_str(row.try_get::<String, _>("status")?.as_str())?;
    Ok(DeferredActionRecord {
        deferred_id: row.try_get("deferred_id")?,
        approval_id: row.try_get("approval_id")?,
        tool_name: row.try_get("tool_name")?,
        parameters: row.try_get("parameters")?,
        security_level: row.try_get("security_level")?,
        delay_hours: row.try_get::<i32, _>("delay_hours")? as i64,
        scheduled_at: row.try_get("scheduled_at")?,
        status,
        approved_by: row.try_get("approved_by")?,
        approved_at: row.try_get("approved_at")?,
        approval_comment: row.try_get("approval_comment")?,
        cancelled_by: row.try_get("cancelled_by")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        executed_at: row.try_get("executed_at")?,
        execution_result: row.try_get("execution_result")?,
        execution_error: row.try_get("execution_error")?,
        context: row
            .try_get::<Option<Value>, _>("context")?
            .unwrap_or_else(|| json!({})),
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> DeferredActionManager {
        DeferredActionManager::in_memory(DelayPolicy::default())
    }

    fn action(security_level: &str, delay_hours: Option<i64>) -> NewDeferredAction {
        NewDeferredAction {
            approval_id: Uuid::new_v4(),
            tool_name: "exec_sql".to_string(),
            parameters: json!({"query": "DROP TABLE staging", "password": "[REDACTED]"}),
            security_level: security_level.to_string(),
            approved_by: "alice".to_string(),
            approval_comment: Some("ok".to_string()),
            context: Some(json!({"ticket": "OPS-42"})),
            delay_hours,
        }
    }

    #[tokio::test]
    async fn level_table_drives_the_default_delay() {
        let manager = manager();
        let l3 = manager.create(action("L3", None)).await.unwrap();
        assert_eq!(l3.delay_hours, 24);
        assert_eq!(l3.time_until_execution, 24 * 3600);

        let l4 = manager.create(action("L4", None)).await.unwrap();
        assert_eq!(l4.delay_hours, 48);

        let unknown = manager.create(action("L9", None)).await.unwrap();
        assert_eq!(unknown.delay_hours, 24);
    }

    #[tokio::test]
    async fn ids_form_a_contiguous_year_scoped_sequence() {
        let manager = manager();
        let year = Utc::now().year();
        for n in 1..=3 {
            let ticket = manager.create(action("L3", None)).await.unwrap();
            assert_eq!(ticket.deferred_id, format!("DEF-{year}-{n:03}"));
        }
    }

    #[tokio::test]
    async fn zero_delay_action_is_immediately_due() {
        let manager = manager();
        let ticket = manager.create(action("L3", Some(0))).await.unwrap();

        let due = manager.get_due().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].deferred_id, ticket.deferred_id);
        assert_eq!(due[0].parameters["password"], json!("[REDACTED]"));

        assert!(
            manager
                .mark_executed(&ticket.deferred_id, Some(json!({"rows": 0})), None)
                .await
                .unwrap()
        );
        assert!(manager.get_due().await.unwrap().is_empty());

        let detail = manager.get(&ticket.deferred_id).await.unwrap().unwrap();
        assert_eq!(detail.record.status, DeferredStatus::Executed);
        assert_eq!(detail.record.execution_result, Some(json!({"rows": 0})));
        assert_eq!(detail.time_until_execution, 0);
    }

    #[tokio::test]
    async fn future_action_is_pending_but_not_due() {
        let manager = manager();
        let ticket = manager.create(action("L3", None)).await.unwrap();

        assert!(manager.get_due().await.unwrap().is_empty());
        let pending = manager.list_pending(50).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deferred_id, ticket.deferred_id);
        assert!(pending[0].time_until_execution > 0);
    }

    #[tokio::test]
    async fn list_pending_orders_by_fire_time() {
        let manager = manager();
        let later = manager.create(action("L4", None)).await.unwrap();
        let sooner = manager.create(action("L3", None)).await.unwrap();

        let pending = manager.list_pending(50).await.unwrap();
        assert_eq!(pending[0].deferred_id, sooner.deferred_id);
        assert_eq!(pending[1].deferred_id, later.deferred_id);
    }

    #[tokio::test]
    async fn cancelled_action_is_terminal() {
        let manager = manager();
        let ticket = manager.create(action("L3", None)).await.unwrap();

        let cancelled = manager
            .cancel(&ticket.deferred_id, "bob", Some("rollback"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, DeferredStatus::Cancelled);

        let again = manager.cancel(&ticket.deferred_id, "bob", None).await;
        assert!(
            matches!(again, Err(SafeguardError::InvalidState { status }) if status == "cancelled")
        );

        // The executor racing the cancellation is a no-op on status.
        assert!(
            !manager
                .mark_executed(&ticket.deferred_id, None, None)
                .await
                .unwrap()
        );

        let detail = manager.get(&ticket.deferred_id).await.unwrap().unwrap();
        assert_eq!(detail.record.status, DeferredStatus::Cancelled);
        assert_eq!(detail.record.cancelled_by.as_deref(), Some("bob"));
        assert_eq!(detail.record.cancellation_reason.as_deref(), Some("rollback"));
        assert_eq!(detail.time_until_execution, 0);
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_not_found() {
        let manager = manager();
        let result = manager.cancel("DEF-1999-001", "bob", None).await;
        assert!(matches!(result, Err(SafeguardError::NotFound(_))));
    }

    #[tokio::test]
    async fn execution_error_marks_the_action_failed() {
        let manager = manager();
        let ticket = manager.create(action("L3", Some(0))).await.unwrap();

        manager
            .mark_executed(&ticket.deferred_id, None, Some("timeout".to_string()))
            .await
            .unwrap();

        let detail = manager.get(&ticket.deferred_id).await.unwrap().unwrap();
        assert_eq!(detail.record.status, DeferredStatus::Failed);
        assert_eq!(detail.record.execution_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn stats_count_every_status_and_default_to_zero() {
        let manager = manager();
        let executed = manager.create(action("L3", Some(0))).await.unwrap();
        manager
            .mark_executed(&executed.deferred_id, None, None)
            .await
            .unwrap();
        let cancelled = manager.create(action("L3", None)).await.unwrap();
        manager
            .cancel(&cancelled.deferred_id, "bob", None)
            .await
            .unwrap();
        manager.create(action("L4", None)).await.unwrap();

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn concurrent_cancels_have_exactly_one_winner() {
        let manager = std::sync::Arc::new(manager());
        let ticket = manager.create(action("L3", None)).await.unwrap();

        let first = {
            let manager = manager.clone();
            let id = ticket.deferred_id.clone();
            tokio::spawn(async move { manager.cancel(&id, "bob", None).await })
        };
        let second = {
            let manager = manager.clone();
            let id = ticket.deferred_id.clone();
            tokio::spawn(async move { manager.cancel(&id, "carol", None).await })
        };

        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(SafeguardError::InvalidState { .. })
        )));
    }
}
