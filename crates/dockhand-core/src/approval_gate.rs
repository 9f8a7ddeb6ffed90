//! Approval gate service.
//!
//! Opens approval requests for runs that stopped before production, and turns
//! a decision into its consequence: an approval re-enqueues the work item
//! with the approval override set, a rejection ends the flow.

use std::sync::Arc;

use dockhand_state::{
    ApprovalRequest, ApprovalStatus, ApprovalStore, EnqueueRequest, NewApproval, RunOptions,
    RunQueue, RunQueueItem, StorageError, DEFAULT_MAX_ATTEMPTS,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::METRICS;
use crate::obs;
use crate::work_item::AgentContext;

/// Approval decisions wired to the run queue.
#[derive(Clone)]
pub struct ApprovalGate {
    approvals: Arc<dyn ApprovalStore>,
    queue: Arc<dyn RunQueue>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate").finish_non_exhaustive()
    }
}

impl ApprovalGate {
    pub fn new(approvals: Arc<dyn ApprovalStore>, queue: Arc<dyn RunQueue>) -> Self {
        Self { approvals, queue }
    }

    /// Open a pending request for a finished run, or return the one already
    /// pending for the same run id.
    pub async fn create_from_run(
        &self,
        item: &RunQueueItem,
        ctx: &AgentContext,
        reason: &str,
    ) -> Result<ApprovalRequest> {
        let (approval, created) = self
            .approvals
            .create_pending(NewApproval {
                run_id: ctx.run_id.clone(),
                queue_item_id: item.id,
                reference: item.reference.clone(),
                reason: reason.to_string(),
                correlation_id: item.options.correlation_id.clone(),
            })
            .await?;
        if created {
            METRICS.inc_approvals_created();
            obs::emit_approval_created(&approval.id.to_string(), &approval.run_id);
        } else {
            debug!(
                approval_id = %approval.id,
                run_id = %approval.run_id,
                "approval already pending"
            );
        }
        Ok(approval)
    }

    /// Approve a pending request and re-enqueue its work item with the
    /// override set and the original attempt budget. Returns the decided
    /// request and the new queue item.
    ///
    /// Decisions are terminal, so an enqueue failure after the approval is
    /// stored cannot be rolled back. It is logged with the approval id and
    /// returned; the run has to be enqueued by hand.
    pub async fn approve(&self, id: Uuid, actor: &str) -> Result<(ApprovalRequest, RunQueueItem)> {
        let pending = self.approvals.get(id).await?;
        let max_attempts = match self.queue.get(pending.queue_item_id).await {
            Ok(original) => original.max_attempts,
            Err(StorageError::NotFound { .. }) => DEFAULT_MAX_ATTEMPTS,
            Err(e) => return Err(e.into()),
        };

        let approval = self.approvals.mark_approved(id, actor).await?;
        let request = EnqueueRequest::new(approval.reference.clone())
            .with_max_attempts(max_attempts)
            .with_options(RunOptions {
                correlation_id: approval.correlation_id.clone(),
                approval_override: true,
                approval_request_id: Some(approval.id),
            });
        let item = match self.queue.enqueue(request).await {
            Ok(item) => item,
            Err(e) => {
                error!(
                    approval_id = %approval.id,
                    reference = %approval.reference,
                    error = %e,
                    "approval stored but the run could not be re-enqueued"
                );
                return Err(e.into());
            }
        };
        info!(
            approval_id = %approval.id,
            actor = %actor,
            item_id = %item.id,
            "approval granted, run re-enqueued"
        );
        Ok((approval, item))
    }

    /// Reject a pending request. Nothing is enqueued.
    pub async fn reject(
        &self,
        id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest> {
        let approval = self.approvals.mark_rejected(id, actor, reason).await?;
        info!(approval_id = %approval.id, actor = %actor, "approval rejected");
        Ok(approval)
    }

    pub async fn get(&self, id: Uuid) -> Result<ApprovalRequest> {
        Ok(self.approvals.get(id).await?)
    }

    pub async fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        Ok(self.approvals.list(status).await?)
    }
}
