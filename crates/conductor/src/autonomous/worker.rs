//! Autonomous worker: poll, enqueue, gate, execute
//!
//! A single-instance, timer-driven loop. Each tick checks the stop
//! signal, pulls new items from every enabled source, and, when nothing
//! is in flight, pops the next queued item and routes it through the
//! approval policy: escalate, confirm, or execute under a per-item
//! budget. Exactly one item is ever processed at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harness::policy::{ApprovalPolicy, Decision};
use harness::queue::{DiscoveredWork, WorkItemStatus, WorkQueue};
use harness::session::{SessionStore, WorkerState, WorkerStatus};
use harness::{AuditLog, HarnessError, WorkerLock, DEFAULT_QUEUE_CAPACITY};

use super::sources::WorkSource;
use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::workflows::WorkflowType;

/// Callback consulted for `confirm` decisions. Returns whether the item
/// may run.
pub type ConfirmFn = Arc<dyn Fn(&DiscoveredWork) -> bool + Send + Sync>;

/// Worker loop configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Budget ceiling for each executed item.
    pub per_item_budget_usd: f64,
    /// Total spend across the whole worker run; the loop stops at this.
    pub total_budget_usd: f64,
    pub queue_capacity: usize,
    pub policy: ApprovalPolicy,
    /// Confirmation callback; absent means confirm decisions escalate.
    pub confirm: Option<ConfirmFn>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            per_item_budget_usd: 2.0,
            total_budget_usd: 20.0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            policy: ApprovalPolicy::default(),
            confirm: None,
        }
    }
}

/// Summary returned when the loop stops.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub items_discovered: u64,
    pub items_completed: u64,
    pub items_escalated: u64,
    pub items_deferred: u64,
    pub items_failed: u64,
    pub total_spent_usd: f64,
    pub audit_log: std::path::PathBuf,
}

/// The autonomous worker loop.
pub struct AutonomousWorker {
    store: SessionStore,
    orchestrator: Orchestrator,
    sources: Vec<Box<dyn WorkSource>>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl AutonomousWorker {
    pub fn new(
        store: SessionStore,
        orchestrator: Orchestrator,
        sources: Vec<Box<dyn WorkSource>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            sources,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token for stopping the loop from the same process.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the loop until stopped or the total budget is spent.
    ///
    /// Fails immediately when another worker holds the lock.
    pub async fn run(mut self) -> Result<WorkerReport, HarnessError> {
        let _lock = WorkerLock::acquire(&self.store.lock_path())?;

        let run_id = format!("worker-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let audit = AuditLog::for_run(&self.store.audit_dir(), &run_id);
        audit.append("worker_started", serde_json::json!({"run_id": &run_id}));
        info!(%run_id, "autonomous worker started");

        let mut queue = WorkQueue::load(&self.store.queue_path(), self.config.queue_capacity)?;
        let mut status = WorkerStatus::new();

        loop {
            // Stop signal first, before any new work is considered.
            if self.store.stop_requested() {
                info!("stop signal observed, shutting down");
                audit.append("worker_stopped", serde_json::json!({"reason": "stop-signal"}));
                break;
            }
            if self.cancel.is_cancelled() {
                audit.append("worker_stopped", serde_json::json!({"reason": "cancelled"}));
                break;
            }
            if status.total_spent_usd >= self.config.total_budget_usd {
                info!(
                    spent = status.total_spent_usd,
                    budget = self.config.total_budget_usd,
                    "total budget spent, shutting down"
                );
                audit.append(
                    "worker_stopped",
                    serde_json::json!({
                        "reason": "total-budget",
                        "spent_usd": status.total_spent_usd,
                    }),
                );
                break;
            }

            status.state = WorkerState::Polling;
            self.poll_sources(&mut queue, &mut status, &audit).await;

            // Single-concurrent-item: the pop happens only here, and the
            // await below finishes before the next tick can pop again.
            if let Some(item) = queue.pop_next() {
                status.state = WorkerState::Processing;
                self.write_status(&mut status, &queue);
                self.process_item(item, &mut queue, &mut status, &audit).await;
            } else {
                status.state = WorkerState::Idle;
            }

            queue.save(&self.store.queue_path())?;
            self.write_status(&mut status, &queue);

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        status.state = WorkerState::Stopped;
        queue.save(&self.store.queue_path())?;
        self.write_status(&mut status, &queue);
        self.store.clear_stop()?;

        Ok(WorkerReport {
            items_discovered: status.items_discovered,
            items_completed: status.items_completed,
            items_escalated: status.items_escalated,
            items_deferred: status.items_deferred,
            items_failed: status.items_failed,
            total_spent_usd: status.total_spent_usd,
            audit_log: audit.path().to_path_buf(),
        })
    }

    async fn poll_sources(
        &mut self,
        queue: &mut WorkQueue,
        status: &mut WorkerStatus,
        audit: &AuditLog,
    ) {
        for source in &mut self.sources {
            let items = match source.poll().await {
                Ok(items) => items,
                Err(e) => {
                    warn!(source = source.name(), error = %e, "source poll failed");
                    continue;
                }
            };
            for item in items {
                status.items_discovered += 1;
                audit.append(
                    "item_discovered",
                    serde_json::json!({
                        "id": &item.id,
                        "source": &item.source,
                        "priority": item.priority.to_string(),
                        "tier": item.tier,
                    }),
                );
                match queue.enqueue(item) {
                    Ok(Some(evicted)) => {
                        audit.append(
                            "item_evicted",
                            serde_json::json!({"id": evicted.id}),
                        );
                    }
                    Ok(None) => {}
                    Err(HarnessError::DuplicateWorkItem { id }) => {
                        debug!(%id, "duplicate item rejected");
                    }
                    Err(e) => warn!(error = %e, "enqueue failed"),
                }
            }
        }
    }

    async fn process_item(
        &self,
        item: DiscoveredWork,
        queue: &mut WorkQueue,
        status: &mut WorkerStatus,
        audit: &AuditLog,
    ) {
        let decision = self.config.policy.evaluate(&item);
        audit.append(
            "policy_decision",
            serde_json::json!({
                "id": &item.id,
                "decision": decision.decision.to_string(),
                "reason": &decision.reason,
            }),
        );

        match decision.decision {
            Decision::Escalate => {
                info!(id = %item.id, reason = %decision.reason, "item escalated");
                queue.record_outcome(
                    &item.id,
                    WorkItemStatus::Escalated,
                    decision.reason,
                    None,
                    None,
                );
                status.items_escalated += 1;
            }
            Decision::Confirm => match &self.config.confirm {
                // No way to ask anyone: treat as escalation.
                None => {
                    queue.record_outcome(
                        &item.id,
                        WorkItemStatus::Escalated,
                        "confirmation required but no confirmer available",
                        None,
                        None,
                    );
                    status.items_escalated += 1;
                }
                Some(confirm) => {
                    if confirm(&item) {
                        self.execute_item(&item, queue, status, audit).await;
                    } else {
                        queue.record_outcome(
                            &item.id,
                            WorkItemStatus::Deferred,
                            "confirmation declined",
                            None,
                            None,
                        );
                        status.items_deferred += 1;
                    }
                }
            },
            Decision::AutoExecute => {
                self.execute_item(&item, queue, status, audit).await;
            }
        }
    }

    async fn execute_item(
        &self,
        item: &DiscoveredWork,
        queue: &mut WorkQueue,
        status: &mut WorkerStatus,
        audit: &AuditLog,
    ) {
        let workflow = match item.suggested_workflow.to_string().parse::<WorkflowType>() {
            Ok(wt) => wt,
            Err(_) => {
                // manual-review never reaches here through the policy, but
                // guard anyway rather than panic.
                queue.record_outcome(
                    &item.id,
                    WorkItemStatus::Escalated,
                    "no executable workflow for suggestion",
                    None,
                    None,
                );
                status.items_escalated += 1;
                return;
            }
        };

        audit.append(
            "item_started",
            serde_json::json!({
                "id": &item.id,
                "workflow": workflow.to_string(),
                "budget_usd": self.config.per_item_budget_usd,
            }),
        );

        let outcome = self
            .orchestrator
            .run_with_budget(
                workflow,
                &item.description,
                Some(self.config.per_item_budget_usd),
            )
            .await;
        match outcome {
            Ok(RunOutcome::Completed(state)) => {
                status.items_completed += 1;
                status.total_spent_usd += state.total_cost_usd;
                audit.append(
                    "item_completed",
                    serde_json::json!({
                        "id": &item.id,
                        "session_id": &state.session_id,
                        "cost_usd": state.total_cost_usd,
                    }),
                );
                queue.record_outcome(
                    &item.id,
                    WorkItemStatus::Completed,
                    "workflow completed",
                    Some(state.session_id.clone()),
                    Some(state.total_cost_usd),
                );
            }
            Ok(RunOutcome::AwaitingApproval(state)) => {
                // Autonomous runs cannot wait on a human; park the item.
                status.items_escalated += 1;
                status.total_spent_usd += state.total_cost_usd;
                audit.append(
                    "item_escalated",
                    serde_json::json!({
                        "id": &item.id,
                        "session_id": &state.session_id,
                        "reason": "run suspended awaiting approval",
                    }),
                );
                queue.record_outcome(
                    &item.id,
                    WorkItemStatus::Escalated,
                    "run suspended awaiting approval",
                    Some(state.session_id.clone()),
                    Some(state.total_cost_usd),
                );
            }
            Ok(RunOutcome::Failed(state)) | Ok(RunOutcome::Cancelled(state)) => {
                status.items_failed += 1;
                status.total_spent_usd += state.total_cost_usd;
                let reason = state
                    .error
                    .as_ref()
                    .map(|f| f.error.clone())
                    .unwrap_or_else(|| "run did not complete".to_string());
                audit.append(
                    "item_failed",
                    serde_json::json!({
                        "id": &item.id,
                        "session_id": &state.session_id,
                        "error": &reason,
                    }),
                );
                queue.record_outcome(
                    &item.id,
                    WorkItemStatus::Escalated,
                    format!("run failed: {reason}"),
                    Some(state.session_id.clone()),
                    Some(state.total_cost_usd),
                );
            }
            Err(e) => {
                status.items_failed += 1;
                warn!(id = %item.id, error = %e, "item execution errored");
                audit.append(
                    "item_failed",
                    serde_json::json!({"id": &item.id, "error": e.to_string()}),
                );
                queue.record_outcome(
                    &item.id,
                    WorkItemStatus::Escalated,
                    format!("infrastructure error: {e}"),
                    None,
                    None,
                );
            }
        }
    }

    fn write_status(&self, status: &mut WorkerStatus, queue: &WorkQueue) {
        status.updated_at = Utc::now();
        status.queue = queue.items().to_vec();
        if let Err(e) = self.store.write_worker_status(status) {
            warn!(error = %e, "failed to write worker status");
        }
    }
}
