//! The approval queue (stage one of the gate).
//!
//! Sensitive invocations are parked here as pending requests. Secret
//! material is split out before anything durable is written: the relational
//! row only ever holds the redacted argument tree, while the extracted
//! secrets go to the keystore under `approval:<id>` with a TTL slightly
//! longer than the request's own deadline. The keystore write strictly
//! precedes the insert, so a crash in between leaves at worst an orphan
//! envelope that the TTL collects — never a row pointing at secrets that
//! are already gone.
//!
//! Concurrency rests on guarded conditional updates
//! (`WHERE id = $1 AND status = 'pending'`): of two racing operators,
//! exactly one wins the transition and the other is told the request was
//! already processed.

use crate::error::SafeguardError;
use crate::memory::MemoryApprovals;
use chrono::{DateTime, Duration, Utc};
use safeguard_core::{
    ApprovalRecord, ApprovalStatus, ApprovalTicket, ApprovedAction, PendingApproval,
    RejectedAction, remaining_seconds,
};
use safeguard_secrets::{SecretStore, extract_sensitive_fields, has_sensitive_fields, merge_secrets};
use serde_json::{Value, json};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Parameters for parking a new approval request.
#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub tool_name: String,
    pub arguments: Value,
    pub security_level: String,
    pub requester_ip: Option<String>,
    pub context: Option<Value>,
    /// Overrides the queue's default validity window.
    pub ttl_minutes: Option<i64>,
}

/// Storage backend for approval requests.
enum ApprovalBackend {
    /// Durable storage in PostgreSQL.
    Postgres(PgPool),
    /// In-process storage (tests, embedded deployments).
    Memory(MemoryApprovals),
}

/// Manager for the approval request lifecycle.
pub struct ApprovalQueue {
    backend: ApprovalBackend,
    secrets: Arc<dyn SecretStore>,
    default_ttl_minutes: i64,
}

impl ApprovalQueue {
    /// Queue backed by PostgreSQL. Run [`crate::schema::migrate`] first.
    pub fn with_pool(
        pool: PgPool,
        secrets: Arc<dyn SecretStore>,
        default_ttl_minutes: i64,
    ) -> Self {
        Self {
            backend: ApprovalBackend::Postgres(pool),
            secrets,
            default_ttl_minutes,
        }
    }

    /// Queue backed by in-process storage.
    pub fn in_memory(secrets: Arc<dyn SecretStore>, default_ttl_minutes: i64) -> Self {
        Self {
            backend: ApprovalBackend::Memory(MemoryApprovals::default()),
            secrets,
            default_ttl_minutes,
        }
    }

    /// Park a new request as pending.
    ///
    /// Sensitive fields are redacted before the row is written; the
    /// extracted secrets are sealed into the keystore with
    /// `ttl_minutes * 60 + 300` seconds to live.
    pub async fn create(
        &self,
        request: NewApprovalRequest,
    ) -> Result<ApprovalTicket, SafeguardError> {
        let approval_id = Uuid::new_v4();
        let ttl_minutes = request.ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let now = Utc::now();
        let expires_at = now + Duration::minutes(ttl_minutes);
        let context = request.context.unwrap_or_else(|| json!({}));

        let has_secrets = has_sensitive_fields(&request.arguments);
        let (redacted_args, secret_map) = extract_sensitive_fields(&request.arguments);
        let secrets_count = secret_map.as_object().map_or(0, |m| m.len());

        if secrets_count > 0 {
            // Keystore TTL outlives the row's deadline by a 5 minute grace
            // period, so the envelope is always present while referenced.
            let ttl_seconds = (ttl_minutes * 60 + 300).max(0) as u64;
            self.secrets
                .store_secret(&envelope_key(approval_id), &secret_map, ttl_seconds)
                .await?;
            tracing::info!(
                approval_id = %short_id(approval_id),
                secrets_count,
                "safeguard_secrets_secured"
            );
        }

        let created_at = match &self.backend {
            ApprovalBackend::Postgres(pool) => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO safeguard_approvals
                        (id, tool_name, arguments, security_level, requester_ip,
                         request_context, expires_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING created_at
                    "#,
                )
                .bind(approval_id)
                .bind(&request.tool_name)
                .bind(&redacted_args)
                .bind(&request.security_level)
                .bind(&request.requester_ip)
                .bind(&context)
                .bind(expires_at)
                .fetch_one(pool)
                .await?;
                row.try_get("created_at")?
            }
            ApprovalBackend::Memory(store) => {
                store
                    .insert(ApprovalRecord {
                        id: approval_id,
                        tool_name: request.tool_name.clone(),
                        arguments: redacted_args,
                        security_level: request.security_level.clone(),
                        requester_ip: request.requester_ip.clone(),
                        context,
                        status: ApprovalStatus::Pending,
                        created_at: now,
                        expires_at,
                        approved_at: None,
                        approver: None,
                        approval_comment: None,
                        executed_at: None,
                        execution_result: None,
                        execution_error: None,
                    })
                    .await;
                now
            }
        };

        // Logs the detector's pre-insert answer, not a read-back.
        tracing::warn!(
            approval_id = %approval_id,
            tool_name = %request.tool_name,
            expires_at = %expires_at.to_rfc3339(),
            has_redacted_secrets = has_secrets,
            "safeguard_approval_created"
        );

        Ok(ApprovalTicket {
            approval_id,
            tool_name: request.tool_name,
            status: ApprovalStatus::Pending,
            created_at,
            expires_at,
            ttl_minutes,
        })
    }

    /// Pending, not-yet-expired requests, newest first.
    pub async fn list_pending(
        &self,
        limit: i64,
    ) -> Result<Vec<PendingApproval>, SafeguardError> {
        let records = match &self.backend {
            ApprovalBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT *
                    FROM safeguard_approvals
                    WHERE status = 'pending' AND expires_at > NOW()
                    ORDER BY created_at DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(pool)
                .await?;
                rows.iter()
                    .map(approval_from_row)
                    .collect::<Result<Vec<_>, _>>()?
            }
            ApprovalBackend::Memory(store) => store.list_pending(limit).await,
        };

        Ok(records
            .into_iter()
            .map(|r| PendingApproval {
                time_remaining_seconds: remaining_seconds(r.expires_at),
                approval_id: r.id,
                tool_name: r.tool_name,
                arguments: r.arguments,
                security_level: r.security_level,
                requester_ip: r.requester_ip,
                context: r.context,
                created_at: r.created_at,
                expires_at: r.expires_at,
            })
            .collect())
    }

    /// Approve a pending request.
    ///
    /// Of two racing approvers exactly one succeeds; the loser gets
    /// [`SafeguardError::InvalidState`]. Approving a request past its
    /// deadline marks it expired and reports [`SafeguardError::Expired`].
    pub async fn approve(
        &self,
        approval_id: Uuid,
        approver: &str,
        comment: Option<&str>,
    ) -> Result<ApprovedAction, SafeguardError> {
        let record = match &self.backend {
            ApprovalBackend::Postgres(pool) => self.approve_pg(pool, approval_id, approver, comment).await?,
            ApprovalBackend::Memory(store) => store.approve(approval_id, approver, comment).await?,
        };

        tracing::info!(
            approval_id = %approval_id,
            tool_name = %record.tool_name,
            approver = %approver,
            "safeguard_approved"
        );

        Ok(ApprovedAction {
            approval_id,
            tool_name: record.tool_name,
            arguments: record.arguments,
            status: ApprovalStatus::Approved,
            approver: approver.to_string(),
            message: "Action approved. Ready for execution.".to_string(),
        })
    }

    async fn approve_pg(
        &self,
        pool: &PgPool,
        approval_id: Uuid,
        approver: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRecord, SafeguardError> {
        let row = sqlx::query(
            "SELECT status, expires_at FROM safeguard_approvals WHERE id = $1",
        )
        .bind(approval_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| SafeguardError::NotFound(approval_id.to_string()))?;

        let status = ApprovalStatus::from_str(row.try_get::<String, _>("status")?.as_str())?;
        if status != ApprovalStatus::Pending {
            return Err(SafeguardError::InvalidState {
                status: status.to_string(),
            });
        }

        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        if expires_at < Utc::now() {
            sqlx::query(
                "UPDATE safeguard_approvals SET status = 'expired' \
                 WHERE id = $1 AND status = 'pending'",
            )
            .bind(approval_id)
            .execute(pool)
            .await?;
            return Err(SafeguardError::Expired(approval_id.to_string()));
        }

        let updated = sqlx::query(
            r#"
            UPDATE safeguard_approvals
            SET status = 'approved',
                approved_at = NOW(),
                approver = $2,
                approval_comment = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(approval_id)
        .bind(approver)
        .bind(comment)
        .fetch_optional(pool)
        .await?;

        match updated {
            Some(row) => approval_from_row(&row),
            // Zero rows: a concurrent transition won the race.
            None => Err(self.processed_error(pool, approval_id).await?),
        }
    }

    /// Reject a pending request. One conditional update, no read-then-write.
    pub async fn reject(
        &self,
        approval_id: Uuid,
        approver: &str,
        comment: Option<&str>,
    ) -> Result<RejectedAction, SafeguardError> {
        let tool_name = match &self.backend {
            ApprovalBackend::Postgres(pool) => {
                let updated = sqlx::query(
                    r#"
                    UPDATE safeguard_approvals
                    SET status = 'rejected',
                        approved_at = NOW(),
                        approver = $2,
                        approval_comment = $3
                    WHERE id = $1 AND status = 'pending'
                    RETURNING tool_name
                    "#,
                )
                .bind(approval_id)
                .bind(approver)
                .bind(comment)
                .fetch_optional(pool)
                .await?;
                match updated {
                    Some(row) => row.try_get::<String, _>("tool_name")?,
                    None => return Err(self.processed_error(pool, approval_id).await?),
                }
            }
            ApprovalBackend::Memory(store) => {
                store.reject(approval_id, approver, comment).await?.tool_name
            }
        };

        tracing::info!(
            approval_id = %approval_id,
            tool_name = %tool_name,
            approver = %approver,
            "safeguard_rejected"
        );

        Ok(RejectedAction {
            approval_id,
            status: ApprovalStatus::Rejected,
            message: "Action rejected.".to_string(),
        })
    }

    /// Diagnose a lost race or a missing row after a zero-row update.
    async fn processed_error(
        &self,
        pool: &PgPool,
        approval_id: Uuid,
    ) -> Result<SafeguardError, SafeguardError> {
        let row = sqlx::query("SELECT status FROM safeguard_approvals WHERE id = $1")
            .bind(approval_id)
            .fetch_optional(pool)
            .await?;
        Ok(match row {
            Some(row) => SafeguardError::InvalidState {
                status: row.try_get::<String, _>("status")?,
            },
            None => SafeguardError::NotFound(approval_id.to_string()),
        })
    }

    /// Record the executor's outcome. Only an approved request can move to
    /// executed/failed; returns whether a row transitioned.
    pub async fn mark_executed(
        &self,
        approval_id: Uuid,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<bool, SafeguardError> {
        let status = if error.is_none() {
            ApprovalStatus::Executed
        } else {
            ApprovalStatus::Failed
        };

        match &self.backend {
            ApprovalBackend::Postgres(pool) => {
                let outcome = sqlx::query(
                    r#"
                    UPDATE safeguard_approvals
                    SET status = $2,
                        executed_at = NOW(),
                        execution_result = $3,
                        execution_error = $4
                    WHERE id = $1 AND status = 'approved'
                    "#,
                )
                .bind(approval_id)
                .bind(status.as_str())
                .bind(&result)
                .bind(&error)
                .execute(pool)
                .await?;
                Ok(outcome.rows_affected() > 0)
            }
            ApprovalBackend::Memory(store) => {
                Ok(store.mark_executed(approval_id, status, result, error).await)
            }
        }
    }

    /// Bulk-expire pending requests past their deadline. Idempotent.
    pub async fn expire_old(&self) -> Result<u64, SafeguardError> {
        let count = match &self.backend {
            ApprovalBackend::Postgres(pool) => {
                let outcome = sqlx::query(
                    "UPDATE safeguard_approvals SET status = 'expired' \
                     WHERE status = 'pending' AND expires_at < NOW()",
                )
                .execute(pool)
                .await?;
                outcome.rows_affected()
            }
            ApprovalBackend::Memory(store) => store.expire_old().await,
        };

        if count > 0 {
            tracing::info!(count, "safeguard_expired_requests");
        }
        Ok(count)
    }

    /// Full record of one request, if it exists.
    pub async fn get(&self, approval_id: Uuid) -> Result<Option<ApprovalRecord>, SafeguardError> {
        match &self.backend {
            ApprovalBackend::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM safeguard_approvals WHERE id = $1")
                    .bind(approval_id)
                    .fetch_optional(pool)
                    .await?;
                row.as_ref().map(approval_from_row).transpose()
            }
            ApprovalBackend::Memory(store) => Ok(store.fetch(approval_id).await),
        }
    }

    /// Reconstitute the original arguments for execution.
    ///
    /// Merges the keystore envelope back into the redacted row. If the
    /// envelope is gone (cleaned up or TTL-collected) the redacted tree is
    /// returned unchanged. Callers must not use this before approval.
    pub async fn get_full_arguments(
        &self,
        approval_id: Uuid,
    ) -> Result<Option<Value>, SafeguardError> {
        let redacted = match &self.backend {
            ApprovalBackend::Postgres(pool) => {
                let row = sqlx::query("SELECT arguments FROM safeguard_approvals WHERE id = $1")
                    .bind(approval_id)
                    .fetch_optional(pool)
                    .await?;
                match row {
                    Some(row) => row.try_get::<Value, _>("arguments")?,
                    None => return Ok(None),
                }
            }
            ApprovalBackend::Memory(store) => match store.arguments(approval_id).await {
                Some(arguments) => arguments,
                None => return Ok(None),
            },
        };

        let Some(secrets) = self.secrets.get_secret(&envelope_key(approval_id)).await? else {
            return Ok(Some(redacted));
        };

        let mut full = redacted;
        merge_secrets(&mut full, &secrets);

        tracing::info!(
            approval_id = %short_id(approval_id),
            "safeguard_secrets_retrieved"
        );

        Ok(Some(full))
    }

    /// Drop the keystore envelope after execution. Returns whether one
    /// existed.
    pub async fn cleanup_secrets(&self, approval_id: Uuid) -> Result<bool, SafeguardError> {
        Ok(self.secrets.delete_secret(&envelope_key(approval_id)).await?)
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        if let ApprovalBackend::Postgres(pool) = &self.backend {
            pool.close().await;
        }
    }
}

fn envelope_key(approval_id: Uuid) -> String {
    format!("approval:{approval_id}")
}

/// First 8 chars of the id, for log lines near secret handling.
fn short_id(approval_id: Uuid) -> String {
    let id = approval_id.to_string();
    format!("{}...", &id[..8])
}

fn approval_from_row(row: &PgRow) -> Result<ApprovalRecord, SafeguardError> {
    let status = ApprovalStatus::from_str(row.try_get::<String, _>("status")?.as_str())?;
    Ok(ApprovalRecord {
        id: row.try_get("id")?,
        tool_name: row.try_get("tool_name")?,
        arguments: row.try_get("arguments")?,
        security_level: row.try_get("security_level")?,
        requester_ip: row.try_get("requester_ip")?,
        context: row
            .try_get::<Option<Value>, _>("request_context")?
            .unwrap_or_else(|| json!({})),
        status,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        approved_at: row.try_get("approved_at")?,
        approver: row.try_get("approver")?,
        approval_comment: row.try_get("approval_comment")?,
        executed_at: row.try_get("executed_at")?,
        execution_result: row.try_get("execution_result")?,
        execution_error: row.try_get("execution_error")?,
    })
}
