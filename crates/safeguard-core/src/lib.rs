//! # safeguard-core
//!
//! Core types for the Safeguard approval queue: lifecycle statuses, entity
//! records and operator-facing views, the per-level delay policy, and the
//! runtime configuration shared by the queue and the keystore.
//!
//! Sensitive tool invocations (levels L3/L4) are never executed directly.
//! They are parked as approval requests, and once approved become deferred
//! actions that fire after a level-dependent delay, cancellable until then.

pub mod config;
pub mod model;
pub mod policy;
pub mod status;

pub use config::{KeystoreConfig, PoolConfig, SafeguardConfig, SweeperConfig};
pub use model::{
    ApprovalRecord, ApprovalTicket, ApprovedAction, CancelledAction, DeferredActionRecord,
    DeferredDetail, DeferredStats, DeferredSummary, DeferredTicket, DueAction, PendingApproval,
    RejectedAction, remaining_seconds,
};
pub use policy::DelayPolicy;
pub use status::{ApprovalStatus, DeferredStatus, ParseStatusError};
