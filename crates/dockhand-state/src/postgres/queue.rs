use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use tracing::debug;
use uuid::Uuid;

use super::{from_db_int, to_db_int, PgHandle};
use crate::backoff::BackoffPolicy;
use crate::error::StorageError;
use crate::model::{
    ClaimOptions, EnqueueRequest, QueueStatus, RunOptions, RunOutcome, RunQueueItem, WorkItemRef,
};
use crate::storage_traits::{RunQueue, StorageResult};

const ENTITY: &str = "run queue item";

const COLUMNS: &str = "id, kind, issue_id, repo, review_number, status, attempts, max_attempts, \
    next_attempt_at, lease_owner, lease_expires_at, timeout_at, cancel_requested, cancel_reason, \
    options, created_at, updated_at, started_at, finished_at, run_id, result_status, last_error";

/// Run queue in the `dockhand_run_queue` table.
pub struct PgRunQueue {
    handle: PgHandle,
}

impl PgRunQueue {
    pub fn new(handle: PgHandle) -> Self {
        Self { handle }
    }

    /// Lock the row, apply `f` and write it back when `f` reports a change.
    ///
    /// Waits for any concurrent holder (a heartbeat in flight) so no
    /// transition is dropped.
    async fn modify<F>(&self, id: Uuid, f: F) -> StorageResult<(RunQueueItem, bool)>
    where
        F: FnOnce(&mut RunQueueItem) -> StorageResult<bool> + Send,
    {
        let pool = self.handle.ready().await?;
        let mut tx = pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_run_queue WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StorageError::not_found(ENTITY, id))?;

        let mut item = item_from_row(&row)?;
        let changed = f(&mut item)?;
        if changed {
            write_item(&mut *tx, &item).await?;
        }
        tx.commit().await?;
        Ok((item, changed))
    }
}

#[async_trait]
impl RunQueue for PgRunQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> StorageResult<RunQueueItem> {
        request.validate()?;
        let pool = self.handle.ready().await?;
        let item = RunQueueItem::from_request(request, Utc::now());
        let (issue_id, repo, review_number) = item.reference.to_parts()?;

        sqlx::query(&format!(
            "INSERT INTO dockhand_run_queue ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        ))
        .bind(item.id)
        .bind(item.reference.kind().as_str())
        .bind(issue_id)
        .bind(repo)
        .bind(review_number)
        .bind(item.status.as_str())
        .bind(to_db_int(item.attempts))
        .bind(to_db_int(item.max_attempts))
        .bind(item.next_attempt_at)
        .bind(item.lease_owner.as_deref())
        .bind(item.lease_expires_at)
        .bind(item.timeout_at)
        .bind(item.cancel_requested)
        .bind(item.cancel_reason.as_deref())
        .bind(Json(&item.options))
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.started_at)
        .bind(item.finished_at)
        .bind(item.run_id.as_deref())
        .bind(item.result_status.as_deref())
        .bind(item.last_error.as_deref())
        .execute(pool)
        .await?;

        debug!(id = %item.id, reference = %item.reference, "enqueued run");
        Ok(item)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        options: &ClaimOptions,
    ) -> StorageResult<Option<RunQueueItem>> {
        let pool = self.handle.ready().await?;
        let mut tx = pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_run_queue \
             WHERE status IN ('queued', 'retryable') AND next_attempt_at <= $1 \
             ORDER BY created_at, id \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut item = item_from_row(&row)?;
        item.claim(now, options);
        write_item(&mut *tx, &item).await?;
        tx.commit().await?;
        Ok(Some(item))
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let (_, renewed) = self
            .modify(id, |item| {
                Ok(item.renew_lease(worker_id, lease, now))
            })
            .await?;
        Ok(renewed)
    }

    async fn mark_succeeded(&self, id: Uuid, outcome: RunOutcome) -> StorageResult<RunQueueItem> {
        let now = Utc::now();
        let (item, _) = self
            .modify(id, |item| Ok(item.succeed(outcome, now)))
            .await?;
        Ok(item)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> StorageResult<RunQueueItem> {
        let (item, _) = self
            .modify(id, |item| {
                Ok(item.fail(error, backoff, now))
            })
            .await?;
        Ok(item)
    }

    async fn cancel(&self, id: Uuid, reason: Option<&str>) -> StorageResult<RunQueueItem> {
        let now = Utc::now();
        let (item, _) = self
            .modify(id, |item| {
                Ok(item.request_cancel(reason, now))
            })
            .await?;
        Ok(item)
    }

    async fn retry(&self, id: Uuid) -> StorageResult<RunQueueItem> {
        let now = Utc::now();
        let (item, _) = self
            .modify(id, |item| {
                item.reset_for_retry(now)?;
                Ok(true)
            })
            .await?;
        Ok(item)
    }

    async fn reap_expired_running(
        &self,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> StorageResult<Vec<RunQueueItem>> {
        let pool = self.handle.ready().await?;
        let mut tx = pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_run_queue \
             WHERE status = 'running' \
               AND (cancel_requested OR lease_expires_at <= $1 OR timeout_at <= $1) \
             ORDER BY created_at, id \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut item = item_from_row(row)?;
            if item.reap(backoff, now) {
                write_item(&mut *tx, &item).await?;
                reaped.push(item);
            }
        }
        tx.commit().await?;
        Ok(reaped)
    }

    async fn get(&self, id: Uuid) -> StorageResult<RunQueueItem> {
        let pool = self.handle.ready().await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_run_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StorageError::not_found(ENTITY, id))?;
        item_from_row(&row)
    }

    async fn list(&self, status: Option<QueueStatus>) -> StorageResult<Vec<RunQueueItem>> {
        let pool = self.handle.ready().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_run_queue \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at, id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }
}

/// Write every mutable column of `item` back to its row.
async fn write_item(conn: &mut PgConnection, item: &RunQueueItem) -> StorageResult<()> {
    sqlx::query(
        "UPDATE dockhand_run_queue SET \
            status = $2, attempts = $3, max_attempts = $4, next_attempt_at = $5, \
            lease_owner = $6, lease_expires_at = $7, timeout_at = $8, \
            cancel_requested = $9, cancel_reason = $10, options = $11, updated_at = $12, \
            started_at = $13, finished_at = $14, run_id = $15, result_status = $16, \
            last_error = $17 \
         WHERE id = $1",
    )
    .bind(item.id)
    .bind(item.status.as_str())
    .bind(to_db_int(item.attempts))
    .bind(to_db_int(item.max_attempts))
    .bind(item.next_attempt_at)
    .bind(item.lease_owner.as_deref())
    .bind(item.lease_expires_at)
    .bind(item.timeout_at)
    .bind(item.cancel_requested)
    .bind(item.cancel_reason.as_deref())
    .bind(Json(&item.options))
    .bind(item.updated_at)
    .bind(item.started_at)
    .bind(item.finished_at)
    .bind(item.run_id.as_deref())
    .bind(item.result_status.as_deref())
    .bind(item.last_error.as_deref())
    .execute(conn)
    .await?;
    Ok(())
}

fn item_from_row(row: &PgRow) -> StorageResult<RunQueueItem> {
    let kind: String = row.try_get("kind")?;
    let reference = WorkItemRef::from_parts(
        &kind,
        row.try_get("issue_id")?,
        row.try_get("repo")?,
        row.try_get("review_number")?,
    )?;
    let status: String = row.try_get("status")?;
    let options: Json<RunOptions> = row.try_get("options")?;

    Ok(RunQueueItem {
        id: row.try_get("id")?,
        reference,
        status: status.parse::<QueueStatus>()?,
        attempts: from_db_int(row.try_get("attempts")?, "attempts")?,
        max_attempts: from_db_int(row.try_get("max_attempts")?, "max_attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        timeout_at: row.try_get("timeout_at")?,
        cancel_requested: row.try_get("cancel_requested")?,
        cancel_reason: row.try_get("cancel_reason")?,
        options: options.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        run_id: row.try_get("run_id")?,
        result_status: row.try_get("result_status")?,
        last_error: row.try_get("last_error")?,
    })
}
