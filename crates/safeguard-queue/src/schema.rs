//! Pool factory and schema migration for the durable tables.
//!
//! Migration is an explicit, idempotent startup step. Managers assume the
//! tables exist; they never create them lazily.

use safeguard_core::SafeguardConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Build the shared connection pool from configuration.
pub async fn connect(config: &SafeguardConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(config.pool.min_connections)
        .max_connections(config.pool.max_connections)
        .connect(&config.postgres_dsn)
        .await
}

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS safeguard_approvals (
        id UUID PRIMARY KEY,
        tool_name VARCHAR(100) NOT NULL,
        arguments JSONB NOT NULL,
        security_level VARCHAR(10) NOT NULL,
        requester_ip VARCHAR(45),
        request_context JSONB,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
        expires_at TIMESTAMP WITH TIME ZONE NOT NULL,
        approved_at TIMESTAMP WITH TIME ZONE,
        approver VARCHAR(100),
        approval_comment TEXT,
        executed_at TIMESTAMP WITH TIME ZONE,
        execution_result JSONB,
        execution_error TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_safeguard_status
        ON safeguard_approvals(status)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_safeguard_expires
        ON safeguard_approvals(expires_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_safeguard_created
        ON safeguard_approvals(created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS safeguard_deferred_actions (
        id SERIAL PRIMARY KEY,
        deferred_id VARCHAR(50) UNIQUE NOT NULL,
        approval_id UUID NOT NULL,
        tool_name VARCHAR(100) NOT NULL,
        parameters JSONB NOT NULL,
        security_level VARCHAR(10) NOT NULL,
        delay_hours INTEGER NOT NULL DEFAULT 24,
        scheduled_at TIMESTAMP WITH TIME ZONE NOT NULL,
        status VARCHAR(20) DEFAULT 'pending',
        approved_by VARCHAR(100) NOT NULL,
        approved_at TIMESTAMP WITH TIME ZONE NOT NULL,
        approval_comment TEXT,
        cancelled_by VARCHAR(100),
        cancelled_at TIMESTAMP WITH TIME ZONE,
        cancellation_reason TEXT,
        executed_at TIMESTAMP WITH TIME ZONE,
        execution_result JSONB,
        execution_error TEXT,
        context JSONB,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_deferred_status
        ON safeguard_deferred_actions(status)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_deferred_scheduled
        ON safeguard_deferred_actions(scheduled_at)
        WHERE status = 'pending'
    "#,
];

/// Create both tables and their indexes if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("safeguard_schema_ready");
    Ok(())
}
