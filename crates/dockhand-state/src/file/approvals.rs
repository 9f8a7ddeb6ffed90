use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::document::JsonDocument;
use super::APPROVALS_FILE;
use crate::error::StorageError;
use crate::model::{ApprovalRequest, ApprovalStatus, NewApproval};
use crate::storage_traits::{ApprovalStore, StorageResult};

const ENTITY: &str = "approval request";

/// Approval requests stored as `<state_dir>/approvals.json`.
///
/// `create_pending` checks for an existing pending request and inserts in two
/// separate passes over the document. Two concurrent calls for the same run
/// can therefore both insert; the Postgres backend does not have this gap.
pub struct FileApprovalStore {
    doc: JsonDocument<ApprovalRequest>,
}

impl FileApprovalStore {
    pub fn new(state_dir: impl AsRef<Path>) -> StorageResult<Self> {
        std::fs::create_dir_all(state_dir.as_ref())?;
        Ok(Self {
            doc: JsonDocument::new(state_dir.as_ref().join(APPROVALS_FILE)),
        })
    }

    async fn decide<F>(&self, id: Uuid, f: F) -> StorageResult<ApprovalRequest>
    where
        F: FnOnce(&mut ApprovalRequest) -> StorageResult<()>,
    {
        self.doc
            .update(|approvals| {
                let approval = approvals
                    .iter_mut()
                    .find(|a| a.id == id)
                    .ok_or_else(|| StorageError::not_found(ENTITY, id))?;
                f(approval)?;
                Ok(approval.clone())
            })
            .await
    }
}

#[async_trait]
impl ApprovalStore for FileApprovalStore {
    async fn create_pending(&self, new: NewApproval) -> StorageResult<(ApprovalRequest, bool)> {
        if new.run_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("run_id must not be empty".into()));
        }

        let existing = self
            .doc
            .read()
            .await?
            .into_iter()
            .find(|a| a.run_id == new.run_id && a.status == ApprovalStatus::Pending);
        if let Some(existing) = existing {
            return Ok((existing, false));
        }

        let approval = ApprovalRequest::pending(new, Utc::now());
        let stored = approval.clone();
        self.doc
            .update(move |approvals| {
                approvals.push(stored);
                Ok(())
            })
            .await?;
        Ok((approval, true))
    }

    async fn get(&self, id: Uuid) -> StorageResult<ApprovalRequest> {
        self.doc
            .read()
            .await?
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| StorageError::not_found(ENTITY, id))
    }

    async fn list(&self, status: Option<ApprovalStatus>) -> StorageResult<Vec<ApprovalRequest>> {
        let mut approvals: Vec<ApprovalRequest> = self
            .doc
            .read()
            .await?
            .into_iter()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .collect();
        approvals.sort_by_key(|a| a.requested_at);
        Ok(approvals)
    }

    async fn mark_approved(&self, id: Uuid, actor: &str) -> StorageResult<ApprovalRequest> {
        let now = Utc::now();
        self.decide(id, |approval| approval.approve(actor, now)).await
    }

    async fn mark_rejected(
        &self,
        id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> StorageResult<ApprovalRequest> {
        let now = Utc::now();
        self.decide(id, |approval| approval.reject(actor, reason, now))
            .await
    }
}
