use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::debug;
use uuid::Uuid;

use super::{is_unique_violation, PgHandle};
use crate::error::StorageError;
use crate::model::{ApprovalRequest, ApprovalStatus, NewApproval, WorkItemRef};
use crate::storage_traits::{ApprovalStore, StorageResult};

const ENTITY: &str = "approval request";

const COLUMNS: &str = "id, status, run_id, queue_item_id, kind, issue_id, repo, review_number, \
    reason, correlation_id, requested_at, approved_by, approved_at, rejected_by, rejected_at, \
    rejection_reason";

/// Approval requests in the `dockhand_approvals` table.
///
/// The partial unique index on `run_id WHERE status = 'pending'` makes
/// `create_pending` strictly idempotent per run, even across processes.
pub struct PgApprovalStore {
    handle: PgHandle,
}

impl PgApprovalStore {
    pub fn new(handle: PgHandle) -> Self {
        Self { handle }
    }

    async fn pending_for_run(
        conn: &mut PgConnection,
        run_id: &str,
    ) -> StorageResult<Option<ApprovalRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_approvals \
             WHERE run_id = $1 AND status = 'pending' \
             LIMIT 1"
        ))
        .bind(run_id)
        .fetch_optional(conn)
        .await?;
        row.as_ref().map(approval_from_row).transpose()
    }

    async fn decide<F>(&self, id: Uuid, f: F) -> StorageResult<ApprovalRequest>
    where
        F: FnOnce(&mut ApprovalRequest) -> StorageResult<()> + Send,
    {
        let pool = self.handle.ready().await?;
        let mut tx = pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_approvals WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StorageError::not_found(ENTITY, id))?;

        let mut approval = approval_from_row(&row)?;
        f(&mut approval)?;

        sqlx::query(
            "UPDATE dockhand_approvals SET \
                status = $2, approved_by = $3, approved_at = $4, \
                rejected_by = $5, rejected_at = $6, rejection_reason = $7 \
             WHERE id = $1",
        )
        .bind(approval.id)
        .bind(approval.status.as_str())
        .bind(approval.approved_by.as_deref())
        .bind(approval.approved_at)
        .bind(approval.rejected_by.as_deref())
        .bind(approval.rejected_at)
        .bind(approval.rejection_reason.as_deref())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(approval)
    }
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn create_pending(&self, new: NewApproval) -> StorageResult<(ApprovalRequest, bool)> {
        if new.run_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("run_id must not be empty".into()));
        }
        let pool = self.handle.ready().await?;
        let mut tx = pool.begin().await?;

        if let Some(existing) = Self::pending_for_run(&mut tx, &new.run_id).await? {
            tx.commit().await?;
            return Ok((existing, false));
        }

        let approval = ApprovalRequest::pending(new, Utc::now());
        let (issue_id, repo, review_number) = approval.reference.to_parts()?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO dockhand_approvals ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(approval.id)
        .bind(approval.status.as_str())
        .bind(&approval.run_id)
        .bind(approval.queue_item_id)
        .bind(approval.reference.kind().as_str())
        .bind(issue_id)
        .bind(repo)
        .bind(review_number)
        .bind(&approval.reason)
        .bind(approval.correlation_id.as_deref())
        .bind(approval.requested_at)
        .bind(approval.approved_by.as_deref())
        .bind(approval.approved_at)
        .bind(approval.rejected_by.as_deref())
        .bind(approval.rejected_at)
        .bind(approval.rejection_reason.as_deref())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok((approval, true))
            }
            Err(e) if is_unique_violation(&e) => {
                // A concurrent caller inserted the pending row first.
                tx.rollback().await?;
                debug!(run_id = %approval.run_id, "pending approval created concurrently");
                let mut conn = pool.acquire().await?;
                let existing = Self::pending_for_run(&mut conn, &approval.run_id)
                    .await?
                    .ok_or_else(|| StorageError::not_found(ENTITY, &approval.run_id))?;
                Ok((existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> StorageResult<ApprovalRequest> {
        let pool = self.handle.ready().await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_approvals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StorageError::not_found(ENTITY, id))?;
        approval_from_row(&row)
    }

    async fn list(&self, status: Option<ApprovalStatus>) -> StorageResult<Vec<ApprovalRequest>> {
        let pool = self.handle.ready().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_approvals \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY requested_at, id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(pool)
        .await?;
        rows.iter().map(approval_from_row).collect()
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

fn approval_from_row(row: &PgRow) -> StorageResult<ApprovalRequest> {
    let kind: String = row.try_get("kind")?;
    let reference = WorkItemRef::from_parts(
        &kind,
        row.try_get("issue_id")?,
        row.try_get("repo")?,
        row.try_get("review_number")?,
    )?;
    let status: String = row.try_get("status")?;
    Ok(ApprovalRequest {
        id: row.try_get("id")?,
        status: status.parse::<ApprovalStatus>()?,
        run_id: row.try_get("run_id")?,
        queue_item_id: row.try_get("queue_item_id")?,
        reference,
        reason: row.try_get("reason")?,
        correlation_id: row.try_get("correlation_id")?,
        requested_at: row.try_get("requested_at")?,
        approved_by: row.try_get("approved_by")?,
        approved_at: row.try_get("approved_at")?,
        rejected_by: row.try_get("rejected_by")?,
        rejected_at: row.try_get("rejected_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
    })
}
