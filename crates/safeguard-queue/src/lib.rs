//! # safeguard-queue
//!
//! Two-stage human-in-the-loop gate for sensitive tool invocations.
//! Privileged operations (levels L3/L4) cannot run directly: they are
//! parked as approval requests, and once approved become deferred actions
//! that wait a level-dependent delay before execution, cancellable until
//! then.
//!
//! ## Architecture
//!
//! ```text
//! caller (tool, args, level, context)
//!       │
//!       ▼
//! ┌──────────────────┐   redacted row    ┌──────────────┐
//! │  ApprovalQueue   │──────────────────▶│  PostgreSQL  │
//! │  1. redact args  │   secret envelope ├──────────────┤
//! │  2. seal secrets │──────────────────▶│   keystore   │
//! │  3. park pending │   approval:<id>   └──────────────┘
//! └────────┬─────────┘
//!          │ operator approves
//!          ▼
//! ┌──────────────────────┐
//! │ DeferredActionManager│  DEF-YYYY-NNN, fires at now + 24h/48h,
//! │ cancellable window   │  cancellable while pending
//! └────────┬─────────────┘
//!          │ Sweeper: expire_old() + get_due()
//!          ▼
//!     executor (mark_executed, cleanup_secrets)
//! ```
//!
//! ## Concurrency
//!
//! No in-process locks are held across store calls. Correctness rests on
//! guarded conditional updates (`WHERE id = $1 AND status = 'pending'
//! RETURNING ...`): the loser of a race gets zero rows back and reports
//! "already processed". Deferred id allocation races are resolved by the
//! unique constraint plus a bounded retry.
//!
//! ## Example
//!
//! ```ignore
//! use safeguard_core::SafeguardConfig;
//! use safeguard_queue::{ApprovalQueue, DeferredActionManager, Sweeper, schema};
//! use safeguard_secrets::RedisSecretStore;
//! use std::sync::Arc;
//!
//! let config = SafeguardConfig::from_env();
//! let pool = schema::connect(&config).await?;
//! schema::migrate(&pool).await?;
//!
//! let secrets = Arc::new(RedisSecretStore::connect(&config.keystore)?);
//! let approvals = Arc::new(ApprovalQueue::with_pool(
//!     pool.clone(),
//!     secrets,
//!     config.default_ttl_minutes,
//! ));
//! let deferred = Arc::new(DeferredActionManager::with_pool(
//!     pool,
//!     config.delay_policy.clone(),
//! ));
//!
//! let handle = Sweeper::new(approvals, deferred, executor, &config.sweeper).spawn();
//! ```

pub mod approvals;
pub mod deferred;
pub mod error;
mod memory;
pub mod reply;
pub mod schema;
pub mod sweeper;

// Re-export sqlx types for convenience
pub use sqlx::PgPool;

// Re-export main types
pub use approvals::{ApprovalQueue, NewApprovalRequest};
pub use deferred::{DeferredActionManager, NewDeferredAction};
pub use error::SafeguardError;
pub use sweeper::{DueActionExecutor, SweepReport, Sweeper, SweeperHandle};
