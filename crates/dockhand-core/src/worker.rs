//! Run queue worker.
//!
//! Each tick reaps lapsed items, claims at most one eligible item, runs its
//! pipeline while heartbeating the lease, and routes the outcome:
//!
//! - pipeline error: `mark_failed` (retry/fail decision)
//! - `needs_review` with the manual approval note and no override: open an
//!   approval request, then record the outcome
//! - anything else: `mark_succeeded` with the final pipeline status
//!
//! A pipeline error never escapes the loop; it always becomes a queue
//! transition plus a log line.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockhand_state::{BackoffPolicy, ClaimOptions, RunOutcome, RunQueue, RunQueueItem};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::approval_gate::ApprovalGate;
use crate::config::AgentConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{Orchestrator, MANUAL_APPROVAL_NOTE};
use crate::work_item::{AgentContext, AgentStatus};

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub claim: ClaimOptions,
    pub backoff: BackoffPolicy,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn from_agent(config: &AgentConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            claim: config.claim_options(),
            backoff: config.backoff(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Result of one worker tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Nothing was eligible.
    Idle,
    /// An item was processed; this is its queue record afterwards.
    Processed(RunQueueItem),
}

/// Polls the run queue and executes pipelines.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn RunQueue>,
    gate: ApprovalGate,
    orchestrator: Orchestrator,
    config: WorkerConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.config.worker_id)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        queue: Arc<dyn RunQueue>,
        gate: ApprovalGate,
        orchestrator: Orchestrator,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            gate,
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Reap, then claim and process at most one item.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let now = Utc::now();
        let reaped = self
            .queue
            .reap_expired_running(now, &self.config.backoff)
            .await?;
        if !reaped.is_empty() {
            METRICS.add_items_reaped(reaped.len() as u64);
        }
        for item in &reaped {
            obs::emit_reaped(
                &item.id.to_string(),
                item.status.as_str(),
                item.last_error
                    .as_deref()
                    .or(item.cancel_reason.as_deref())
                    .unwrap_or_default(),
            );
        }

        let Some(item) = self.queue.claim_next(now, &self.config.claim).await? else {
            debug!(worker_id = %self.config.worker_id, "no eligible run");
            return Ok(TickOutcome::Idle);
        };
        METRICS.inc_runs_claimed();
        obs::emit_run_claimed(&item.id.to_string(), &self.config.worker_id, item.attempts);

        let finished = self.process(item).await?;
        Ok(TickOutcome::Processed(finished))
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.config.worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                // Keep draining while there is work.
                Ok(TickOutcome::Processed(_)) => continue,
                Ok(TickOutcome::Idle) => {}
                Err(e) => error!(error = %e, "worker tick failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    async fn process(&self, item: RunQueueItem) -> Result<RunQueueItem> {
        let heartbeat = self.spawn_heartbeat(&item);
        let result = self
            .orchestrator
            .run_from_reference(&item.reference, item.options.clone())
            .await;
        if let Some(handle) = heartbeat {
            handle.abort();
            // Let an in-flight renewal finish unwinding before the outcome is written.
            let _ = handle.await;
        }
        // Subscribers have seen the events; a long-lived worker keeps no history.
        let run_id = match &result {
            Ok(ctx) => Some(ctx.run_id.as_str()),
            Err(PipelineError::StepFailed { run_id, .. }) => Some(run_id.as_str()),
            Err(PipelineError::Integration(_)) => None,
        };
        if let Some(run_id) = run_id {
            self.orchestrator.events().forget(run_id).await;
        }

        match result {
            Ok(ctx) => self.record_outcome(&item, ctx).await,
            Err(err) => {
                METRICS.inc_runs_failed();
                warn!(item_id = %item.id, error = %err, "run failed");
                let updated = self
                    .queue
                    .mark_failed(item.id, &err.to_string(), &self.config.backoff, Utc::now())
                    .await?;
                Ok(updated)
            }
        }
    }

    async fn record_outcome(&self, item: &RunQueueItem, ctx: AgentContext) -> Result<RunQueueItem> {
        match ctx.status {
            AgentStatus::NeedsReview => {
                METRICS.inc_runs_needs_review();
                if ctx.has_note(MANUAL_APPROVAL_NOTE) && !item.options.approval_override {
                    let reason = ctx.review_notes.join("; ");
                    if let Err(e) = self.gate.create_from_run(item, &ctx, &reason).await {
                        warn!(item_id = %item.id, error = %e, "could not open approval request");
                        let message = format!("approval request failed: {e}");
                        let updated = self
                            .queue
                            .mark_failed(item.id, &message, &self.config.backoff, Utc::now())
                            .await?;
                        return Ok(updated);
                    }
                }
            }
            AgentStatus::Succeeded => METRICS.inc_runs_succeeded(),
            _ => {}
        }

        let updated = self
            .queue
            .mark_succeeded(
                item.id,
                RunOutcome {
                    run_id: ctx.run_id.clone(),
                    result_status: ctx.status.as_str().to_string(),
                },
            )
            .await?;
        Ok(updated)
    }

    /// Renew the lease every third of its length while the pipeline runs.
    fn spawn_heartbeat(&self, item: &RunQueueItem) -> Option<JoinHandle<()>> {
        let lease = self.config.claim.lease?;
        let period = lease.to_std().ok()? / 3;
        if period.is_zero() || item.lease_owner.is_none() {
            return None;
        }

        let queue = Arc::clone(&self.queue);
        let worker_id = self.config.worker_id.clone();
        let id = item.id;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; the claim just set the lease.
            interval.tick().await;
            loop {
                interval.tick().await;
                match queue.heartbeat(id, &worker_id, lease, Utc::now()).await {
                    Ok(true) => debug!(item_id = %id, "lease renewed"),
                    Ok(false) => {
                        warn!(item_id = %id, "lease no longer held, stopping heartbeat");
                        break;
                    }
                    Err(e) => warn!(item_id = %id, error = %e, "heartbeat failed"),
                }
            }
        }))
    }
}
