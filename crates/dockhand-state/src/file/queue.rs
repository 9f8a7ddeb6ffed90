use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use super::document::JsonDocument;
use super::RUN_QUEUE_FILE;
use crate::backoff::BackoffPolicy;
use crate::error::StorageError;
use crate::model::{ClaimOptions, EnqueueRequest, QueueStatus, RunOutcome, RunQueueItem};
use crate::storage_traits::{RunQueue, StorageResult};

const ENTITY: &str = "run queue item";

/// Run queue stored as `<state_dir>/run_queue.json`.
pub struct FileRunQueue {
    doc: JsonDocument<RunQueueItem>,
}

impl FileRunQueue {
    pub fn new(state_dir: impl AsRef<Path>) -> StorageResult<Self> {
        std::fs::create_dir_all(state_dir.as_ref())?;
        Ok(Self {
            doc: JsonDocument::new(state_dir.as_ref().join(RUN_QUEUE_FILE)),
        })
    }

    /// Apply `f` to the item with `id` and persist the document.
    async fn modify<F>(&self, id: Uuid, f: F) -> StorageResult<RunQueueItem>
    where
        F: FnOnce(&mut RunQueueItem) -> StorageResult<()>,
    {
        self.doc
            .update(|items| {
                let item = items
                    .iter_mut()
                    .find(|item| item.id == id)
                    .ok_or_else(|| StorageError::not_found(ENTITY, id))?;
                f(item)?;
                Ok(item.clone())
            })
            .await
    }
}

#[async_trait]
impl RunQueue for FileRunQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> StorageResult<RunQueueItem> {
        request.validate()?;
        let item = RunQueueItem::from_request(request, Utc::now());
        let stored = item.clone();
        self.doc
            .update(move |items| {
                items.push(stored);
                Ok(())
            })
            .await?;
        debug!(id = %item.id, reference = %item.reference, "enqueued run");
        Ok(item)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        options: &ClaimOptions,
    ) -> StorageResult<Option<RunQueueItem>> {
        self.doc
            .update(|items| {
                let oldest = items
                    .iter_mut()
                    .filter(|item| item.is_eligible(now))
                    .min_by_key(|item| item.created_at);
                Ok(oldest.map(|item| {
                    item.claim(now, options);
                    item.clone()
                }))
            })
            .await
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut renewed = false;
        self.modify(id, |item| {
            renewed = item.renew_lease(worker_id, lease, now);
            Ok(())
        })
        .await?;
        Ok(renewed)
    }

    async fn mark_succeeded(&self, id: Uuid, outcome: RunOutcome) -> StorageResult<RunQueueItem> {
        let now = Utc::now();
        self.modify(id, |item| {
            item.succeed(outcome, now);
            Ok(())
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> StorageResult<RunQueueItem> {
        self.modify(id, |item| {
            item.fail(error, backoff, now);
            Ok(())
        })
        .await
    }

    async fn cancel(&self, id: Uuid, reason: Option<&str>) -> StorageResult<RunQueueItem> {
        let now = Utc::now();
        self.modify(id, |item| {
            item.request_cancel(reason, now);
            Ok(())
        })
        .await
    }

    async fn retry(&self, id: Uuid) -> StorageResult<RunQueueItem> {
        let now = Utc::now();
        self.modify(id, |item| item.reset_for_retry(now)).await
    }

    async fn reap_expired_running(
        &self,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> StorageResult<Vec<RunQueueItem>> {
        self.doc
            .update(|items| {
                let mut reaped: Vec<RunQueueItem> = items
                    .iter_mut()
                    .filter_map(|item| item.reap(backoff, now).then(|| item.clone()))
                    .collect();
                reaped.sort_by_key(|item| item.created_at);
                Ok(reaped)
            })
            .await
    }

    async fn get(&self, id: Uuid) -> StorageResult<RunQueueItem> {
        self.doc
            .read()
            .await?
            .into_iter()
            .find(|item| item.id == id)
            .ok_or_else(|| StorageError::not_found(ENTITY, id))
    }

    async fn list(&self, status: Option<QueueStatus>) -> StorageResult<Vec<RunQueueItem>> {
        let mut items: Vec<RunQueueItem> = self
            .doc
            .read()
            .await?
            .into_iter()
            .filter(|item| status.map_or(true, |s| item.status == s))
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }
}
