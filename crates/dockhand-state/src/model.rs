//! Records persisted by the Dockhand stores.
//!
//! - `RunQueueItem`: one durable request to execute a pipeline
//! - `RunSchedule`: a cron trigger that enqueues a request when due
//! - `ApprovalRequest`: a manual sign-off gate opened by a finished run
//!
//! Both backends store exactly these shapes; the file backend serializes them
//! with serde, the Postgres backend maps them to columns.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Default attempt budget for an enqueued run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Work item references
// ---------------------------------------------------------------------------

/// Reference to the unit of requested change a run works on.
///
/// An issue and a review request are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItemRef {
    /// Issue-tracker ticket.
    Issue { id: String },
    /// Code-review request in a repository.
    ReviewRequest { repo: String, number: u64 },
}

impl WorkItemRef {
    pub fn issue(id: impl Into<String>) -> Self {
        WorkItemRef::Issue { id: id.into() }
    }

    pub fn review_request(repo: impl Into<String>, number: u64) -> Self {
        WorkItemRef::ReviewRequest {
            repo: repo.into(),
            number,
        }
    }

    pub fn kind(&self) -> WorkItemKind {
        match self {
            WorkItemRef::Issue { .. } => WorkItemKind::Issue,
            WorkItemRef::ReviewRequest { .. } => WorkItemKind::ReviewRequest,
        }
    }

    /// Rebuild a reference from its flattened column form.
    pub fn from_parts(
        kind: &str,
        issue_id: Option<String>,
        repo: Option<String>,
        review_number: Option<i64>,
    ) -> Result<Self, StorageError> {
        match kind.parse::<WorkItemKind>()? {
            WorkItemKind::Issue => issue_id
                .map(|id| WorkItemRef::Issue { id })
                .ok_or_else(|| StorageError::InvalidInput("issue reference without id".into())),
            WorkItemKind::ReviewRequest => match (repo, review_number) {
                (Some(repo), Some(number)) if number >= 0 => Ok(WorkItemRef::ReviewRequest {
                    repo,
                    number: number as u64,
                }),
                _ => Err(StorageError::InvalidInput(
                    "review request reference without repo/number".into(),
                )),
            },
        }
    }

    /// Flatten into `(issue_id, repo, review_number)` columns.
    ///
    /// Review numbers beyond `i64::MAX` do not fit the column and are rejected.
    pub fn to_parts(&self) -> Result<(Option<&str>, Option<&str>, Option<i64>), StorageError> {
        match self {
            WorkItemRef::Issue { id } => Ok((Some(id.as_str()), None, None)),
            WorkItemRef::ReviewRequest { repo, number } => {
                let number = i64::try_from(*number).map_err(|_| {
                    StorageError::InvalidInput(format!("review number {number} is out of range"))
                })?;
                Ok((None, Some(repo.as_str()), Some(number)))
            }
        }
    }
}

impl fmt::Display for WorkItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemRef::Issue { id } => write!(f, "issue {}", id),
            WorkItemRef::ReviewRequest { repo, number } => write!(f, "{}!{}", repo, number),
        }
    }
}

/// Discriminant of a [`WorkItemRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    Issue,
    ReviewRequest,
}

impl WorkItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemKind::Issue => "issue",
            WorkItemKind::ReviewRequest => "review_request",
        }
    }
}

impl FromStr for WorkItemKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(WorkItemKind::Issue),
            "review_request" => Ok(WorkItemKind::ReviewRequest),
            other => Err(StorageError::InvalidInput(format!(
                "unknown work item kind: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Enqueue requests
// ---------------------------------------------------------------------------

/// Sideband metadata carried from the enqueuer to the pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Service-desk ticket the run reports back to.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Skip the manual approval gate (set when an approved request re-enters).
    #[serde(default)]
    pub approval_override: bool,
    /// Approval request that authorised this run, if any.
    #[serde(default)]
    pub approval_request_id: Option<Uuid>,
}

/// A request to put a work item on the run queue.
///
/// Also the target shape of a [`RunSchedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub reference: WorkItemRef,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub options: RunOptions,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl EnqueueRequest {
    pub fn new(reference: WorkItemRef) -> Self {
        Self {
            reference,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            options: RunOptions::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_attempts == 0 {
            return Err(StorageError::InvalidInput(
                "max_attempts must be at least 1".into(),
            ));
        }
        match &self.reference {
            WorkItemRef::Issue { id } if id.trim().is_empty() => Err(StorageError::InvalidInput(
                "issue id must not be empty".into(),
            )),
            WorkItemRef::ReviewRequest { repo, .. } if repo.trim().is_empty() => Err(
                StorageError::InvalidInput("review request repo must not be empty".into()),
            ),
            reference => reference.to_parts().map(|_| ()),
        }
    }
}

// ---------------------------------------------------------------------------
// Run queue
// ---------------------------------------------------------------------------

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Retryable,
    Succeeded,
    Failed,
    Canceled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Retryable => "retryable",
            QueueStatus::Succeeded => "succeeded",
            QueueStatus::Failed => "failed",
            QueueStatus::Canceled => "canceled",
        }
    }

    /// Succeeded, failed and canceled items are never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Succeeded | QueueStatus::Failed | QueueStatus::Canceled
        )
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Retryable)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "running" => Ok(QueueStatus::Running),
            "retryable" => Ok(QueueStatus::Retryable),
            "succeeded" => Ok(QueueStatus::Succeeded),
            "failed" => Ok(QueueStatus::Failed),
            "canceled" => Ok(QueueStatus::Canceled),
            other => Err(StorageError::InvalidInput(format!(
                "unknown queue status: {other}"
            ))),
        }
    }
}

/// Projection of a finished pipeline run recorded on its queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    /// Final pipeline status (`succeeded`, `needs_review`, ...).
    pub result_status: String,
}

/// Options for a claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimOptions {
    /// Lease owner; without one no lease or timeout is stamped.
    pub worker_id: Option<String>,
    /// Renewable lease length.
    pub lease: Option<chrono::Duration>,
    /// Absolute, non-renewable run ceiling measured from the claim.
    pub run_timeout: Option<chrono::Duration>,
}

impl ClaimOptions {
    pub fn for_worker(worker_id: impl Into<String>, lease: chrono::Duration) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            lease: Some(lease),
            run_timeout: None,
        }
    }

    pub fn with_run_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// A durable request to execute one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunQueueItem {
    pub id: Uuid,
    pub reference: WorkItemRef,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Eligibility gate: not claimable before this instant.
    pub next_attempt_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub options: RunOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
    pub result_status: Option<String>,
    pub last_error: Option<String>,
}

impl RunQueueItem {
    /// Build a fresh queued item from a request.
    pub fn from_request(request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference: request.reference,
            status: QueueStatus::Queued,
            attempts: 0,
            max_attempts: request.max_attempts,
            next_attempt_at: now,
            lease_owner: None,
            lease_expires_at: None,
            timeout_at: None,
            cancel_requested: false,
            cancel_reason: None,
            options: request.options,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            run_id: None,
            result_status: None,
            last_error: None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_attempt_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|at| at <= now)
    }

    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|at| at <= now)
    }

    /// Running and either cancel-requested or past its lease/timeout.
    pub fn is_reapable(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Running
            && (self.cancel_requested || self.lease_expired(now) || self.timed_out(now))
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.timeout_at = None;
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// A cron-triggered enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSchedule {
    pub id: Uuid,
    pub name: String,
    /// Five-field cron expression, evaluated in UTC.
    pub cron: String,
    pub enabled: bool,
    pub target: EnqueueRequest,
    /// Earliest future match; frozen while disabled.
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `ScheduleStore::create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub target: EnqueueRequest,
}

/// Partial update for a schedule; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub enabled: Option<bool>,
    pub target: Option<EnqueueRequest>,
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// Decision state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(StorageError::InvalidInput(format!(
                "unknown approval status: {other}"
            ))),
        }
    }
}

/// Manual sign-off requested by a run before production deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub status: ApprovalStatus,
    pub run_id: String,
    pub queue_item_id: Uuid,
    pub reference: WorkItemRef,
    pub reason: String,
    pub correlation_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

/// Input to `ApprovalStore::create_pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApproval {
    pub run_id: String,
    pub queue_item_id: Uuid,
    pub reference: WorkItemRef,
    pub reason: String,
    pub correlation_id: Option<String>,
}

impl ApprovalRequest {
    pub fn pending(new: NewApproval, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: ApprovalStatus::Pending,
            run_id: new.run_id,
            queue_item_id: new.queue_item_id,
            reference: new.reference,
            reason: new.reason,
            correlation_id: new.correlation_id,
            requested_at: now,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
        }
    }
}
