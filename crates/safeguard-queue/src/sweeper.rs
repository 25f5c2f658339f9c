//! Periodic driver for time-based transitions.
//!
//! Each pass expires overdue pending requests and hands every due deferred
//! action to the executor. The sweeper itself is stateless and may run in
//! several replicas: at-most-once dispatch is enforced by the executor
//! flipping the row out of pending via `mark_executed` when it starts.

use crate::approvals::ApprovalQueue;
use crate::deferred::DeferredActionManager;
use crate::error::SafeguardError;
use async_trait::async_trait;
use safeguard_core::{DueAction, SweeperConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Hand-off contract with the execution side.
#[async_trait]
pub trait DueActionExecutor: Send + Sync {
    /// Dispatch one due action. The executor owns the transition out of
    /// pending: it must call `mark_executed` itself (and `cleanup_secrets`
    /// once the originating approval is done).
    async fn dispatch(&self, action: DueAction) -> anyhow::Result<()>;
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending requests transitioned to expired.
    pub expired: u64,
    /// Due actions handed to the executor without error.
    pub dispatched: usize,
}

/// The expiry/due sweeper.
pub struct Sweeper {
    approvals: Arc<ApprovalQueue>,
    deferred: Arc<DeferredActionManager>,
    executor: Arc<dyn DueActionExecutor>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        approvals: Arc<ApprovalQueue>,
        deferred: Arc<DeferredActionManager>,
        executor: Arc<dyn DueActionExecutor>,
        config: &SweeperConfig,
    ) -> Self {
        Self {
            approvals,
            deferred,
            executor,
            interval: Duration::from_secs(config.interval_seconds.max(1)),
        }
    }

    /// One pass: expire overdue requests, dispatch due actions.
    ///
    /// A failing dispatch is logged and skipped; the action stays pending
    /// and is picked up again on the next pass.
    pub async fn sweep_once(&self) -> Result<SweepReport, SafeguardError> {
        let expired = self.approvals.expire_old().await?;

        let mut dispatched = 0;
        for action in self.deferred.get_due().await? {
            let deferred_id = action.deferred_id.clone();
            match self.executor.dispatch(action).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    tracing::error!(
                        deferred_id = %deferred_id,
                        error = %e,
                        "Failed to dispatch due action"
                    );
                }
            }
        }

        Ok(SweepReport {
            expired,
            dispatched,
        })
    }

    /// Run the sweep loop in the background until the handle is shut down.
    pub fn spawn(self) -> SweeperHandle {
        let shutdown = Arc::new(Notify::new());
        let notify = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "Sweep pass failed");
                        }
                    }
                    _ = notify.notified() => break,
                }
            }
        });

        SweeperHandle { shutdown, handle }
    }
}

/// Handle to a spawned sweep loop.
pub struct SweeperHandle {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::NewApprovalRequest;
    use crate::deferred::NewDeferredAction;
    use safeguard_core::{DeferredStatus, DelayPolicy};
    use safeguard_secrets::MemorySecretStore;
    use serde_json::json;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Executor double that records dispatches and, like the real one,
    /// flips the action out of pending.
    struct RecordingExecutor {
        deferred: Arc<DeferredActionManager>,
        dispatched: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl DueActionExecutor for RecordingExecutor {
        async fn dispatch(&self, action: DueAction) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("executor unavailable");
            }
            self.dispatched.lock().await.push(action.deferred_id.clone());
            self.deferred
                .mark_executed(&action.deferred_id, Some(json!({"rows": 0})), None)
                .await?;
            Ok(())
        }
    }

    fn fixture(fail: bool) -> (Arc<ApprovalQueue>, Arc<DeferredActionManager>, Sweeper) {
        let approvals = Arc::new(ApprovalQueue::in_memory(
            Arc::new(MemorySecretStore::new()),
            60,
        ));
        let deferred = Arc::new(DeferredActionManager::in_memory(DelayPolicy::default()));
        let executor = Arc::new(RecordingExecutor {
            deferred: deferred.clone(),
            dispatched: Mutex::new(Vec::new()),
            fail,
        });
        let sweeper = Sweeper::new(
            approvals.clone(),
            deferred.clone(),
            executor,
            &SweeperConfig { interval_seconds: 1 },
        );
        (approvals, deferred, sweeper)
    }

    fn due_action() -> NewDeferredAction {
        NewDeferredAction {
            approval_id: Uuid::new_v4(),
            tool_name: "exec_sql".to_string(),
            parameters: json!({}),
            security_level: "L3".to_string(),
            approved_by: "alice".to_string(),
            approval_comment: None,
            context: None,
            delay_hours: Some(0),
        }
    }

    #[tokio::test]
    async fn sweep_expires_and_dispatches_then_settles() {
        let (approvals, deferred, sweeper) = fixture(false);

        approvals
            .create(NewApprovalRequest {
                tool_name: "exec_sql".to_string(),
                arguments: json!({"query": "SELECT 1"}),
                security_level: "L3".to_string(),
                requester_ip: None,
                context: None,
                ttl_minutes: Some(0),
            })
            .await
            .unwrap();
        let ticket = deferred.create(due_action()).await.unwrap();

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { expired: 1, dispatched: 1 });

        let detail = deferred.get(&ticket.deferred_id).await.unwrap().unwrap();
        assert_eq!(detail.record.status, DeferredStatus::Executed);

        // Second pass finds nothing left to do.
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { expired: 0, dispatched: 0 });
    }

    #[tokio::test]
    async fn failing_dispatch_leaves_the_action_due() {
        let (_, deferred, sweeper) = fixture(true);
        let ticket = deferred.create(due_action()).await.unwrap();

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.dispatched, 0);

        // Still pending and still due for the next pass.
        let due = deferred.get_due().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].deferred_id, ticket.deferred_id);
    }

    #[tokio::test]
    async fn spawned_loop_sweeps_until_shutdown() {
        let (approvals, _, sweeper) = fixture(false);
        approvals
            .create(NewApprovalRequest {
                tool_name: "exec_sql".to_string(),
                arguments: json!({}),
                security_level: "L3".to_string(),
                requester_ip: None,
                context: None,
                ttl_minutes: Some(0),
            })
            .await
            .unwrap();

        let handle = sweeper.spawn();
        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(approvals.expire_old().await.unwrap(), 0);
    }
}
