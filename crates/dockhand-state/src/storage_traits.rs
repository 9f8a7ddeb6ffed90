//! Storage trait definitions for Dockhand
//!
//! These traits define the durable stores:
//! - `RunQueue`: run requests with claim/lease/heartbeat/retry/cancel/reap
//! - `ScheduleStore`: cron-triggered enqueues with atomic due-claiming
//! - `ApprovalStore`: manual sign-off requests (pending → approved | rejected)
//!
//! All traits are async and backend-agnostic. Two backends implement them:
//! `file` (single writer, atomic document replace) and `postgres` (row locks
//! that skip already-locked rows, safe for many concurrent workers).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::backoff::{BackoffPolicy, RUN_TIMEOUT_REASON};
use crate::error::StorageError;
use crate::model::{
    ApprovalRequest, ApprovalStatus, ClaimOptions, EnqueueRequest, NewApproval, NewSchedule,
    QueueStatus, RunOutcome, RunQueueItem, RunSchedule, ScheduleUpdate,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// RunQueue
// ---------------------------------------------------------------------------

/// Durable queue of pipeline run requests.
///
/// Guarantees:
/// - `claim_next` never returns an item whose `next_attempt_at` is in the
///   future, and never hands the same item to two callers.
/// - Terminal items (succeeded, failed, canceled) only change via `retry`.
/// - `next_attempt_at` never moves backwards across retries.
#[async_trait]
pub trait RunQueue: Send + Sync {
    /// Add a new `queued` item eligible immediately.
    async fn enqueue(&self, request: EnqueueRequest) -> StorageResult<RunQueueItem>;

    /// Claim the oldest eligible item, or `None` if nothing is eligible.
    ///
    /// Never blocks waiting for work.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        options: &ClaimOptions,
    ) -> StorageResult<Option<RunQueueItem>>;

    /// Extend a held lease. Returns `false` if the item is not running or the
    /// lease belongs to another worker.
    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Record a successful run. Resolves to `canceled` if a cancel was
    /// requested meanwhile; no-op unless the item is running.
    async fn mark_succeeded(&self, id: Uuid, outcome: RunOutcome) -> StorageResult<RunQueueItem>;

    /// Record a failed attempt and apply the retry/fail decision.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> StorageResult<RunQueueItem>;

    /// Cancel an item. Immediate for queued/retryable items, advisory for a
    /// running one (finalized by the reaper or the worker's own resolution).
    async fn cancel(&self, id: Uuid, reason: Option<&str>) -> StorageResult<RunQueueItem>;

    /// Reopen a non-running item as `queued` with `attempts = 0`.
    async fn retry(&self, id: Uuid) -> StorageResult<RunQueueItem>;

    /// Fail a running item with the synthetic timeout reason.
    async fn force_timeout(
        &self,
        id: Uuid,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> StorageResult<RunQueueItem> {
        self.mark_failed(id, RUN_TIMEOUT_REASON, backoff, now).await
    }

    /// Resolve every running item whose lease or timeout lapsed or whose
    /// cancel was requested. Returns the resolved items.
    async fn reap_expired_running(
        &self,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> StorageResult<Vec<RunQueueItem>>;

    /// Fetch one item. `StorageError::NotFound` if absent.
    async fn get(&self, id: Uuid) -> StorageResult<RunQueueItem>;

    /// List items, oldest first, optionally filtered by status.
    async fn list(&self, status: Option<QueueStatus>) -> StorageResult<Vec<RunQueueItem>>;
}

// ---------------------------------------------------------------------------
// ScheduleStore
// ---------------------------------------------------------------------------

/// Durable cron schedules.
///
/// Guarantees:
/// - `next_run_at` is the earliest match strictly after the last firing (or
///   creation/enable time).
/// - A disabled schedule keeps its `next_run_at` frozen and is never claimed.
/// - `claim_due` returns each due schedule to exactly one caller.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Validate and persist a new schedule. Invalid cron is rejected.
    async fn create(&self, new: NewSchedule) -> StorageResult<RunSchedule>;

    /// Apply a partial update.
    async fn update(&self, id: Uuid, update: ScheduleUpdate) -> StorageResult<RunSchedule>;

    async fn get(&self, id: Uuid) -> StorageResult<RunSchedule>;

    /// All schedules, oldest first.
    async fn list(&self) -> StorageResult<Vec<RunSchedule>>;

    /// Remove a schedule. `StorageError::NotFound` if absent.
    async fn delete(&self, id: Uuid) -> StorageResult<()>;

    /// Claim enabled schedules with `next_run_at <= now`, stamping
    /// `last_run_at` and advancing `next_run_at`. Returns the updated records.
    async fn claim_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<RunSchedule>>;
}

// ---------------------------------------------------------------------------
// ApprovalStore
// ---------------------------------------------------------------------------

/// Durable approval requests.
///
/// Guarantees:
/// - Decisions are terminal: only `pending` requests can be approved or
///   rejected.
/// - At most one pending request per run id (strict under Postgres; the
///   file backend checks without holding its lock across the insert).
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Create a pending request, or return the existing pending request for
    /// the same run id unchanged. The flag is `true` only when a new request
    /// was stored.
    async fn create_pending(&self, new: NewApproval) -> StorageResult<(ApprovalRequest, bool)>;

    async fn get(&self, id: Uuid) -> StorageResult<ApprovalRequest>;

    /// List requests, oldest first, optionally filtered by status.
    async fn list(&self, status: Option<ApprovalStatus>) -> StorageResult<Vec<ApprovalRequest>>;

    /// Approve a pending request. `InvalidTransition` otherwise.
    async fn mark_approved(&self, id: Uuid, actor: &str) -> StorageResult<ApprovalRequest>;

    /// Reject a pending request. `InvalidTransition` otherwise.
    async fn mark_rejected(
        &self,
        id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> StorageResult<ApprovalRequest>;
}
