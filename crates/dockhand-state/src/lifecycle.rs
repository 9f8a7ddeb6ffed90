//! In-memory state transitions shared by the file and Postgres backends.
//!
//! Each backend loads the owning record (under its lock), applies one of these
//! transitions, and writes the whole record back. Keeping the rules here means
//! both backends agree on every edge of the lifecycle:
//!
//! ```text
//! queued/retryable --claim--> running --succeed--> succeeded
//!                                     --fail-----> retryable | failed
//!                                     --reap-----> retryable | failed | canceled
//! queued/retryable --cancel--> canceled
//! running          --cancel--> running (cancel_requested; finalized by reap)
//! any non-running  --retry---> queued (attempts reset)
//! ```

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::backoff::{apply_cancel, apply_failure, reap_reason, BackoffPolicy};
use crate::cron::{CronError, CronExpr};
use crate::error::StorageError;
use crate::model::{
    ApprovalRequest, ApprovalStatus, ClaimOptions, NewSchedule, QueueStatus, RunOutcome,
    RunQueueItem, RunSchedule, ScheduleUpdate,
};
use crate::storage_traits::StorageResult;

const QUEUE_ENTITY: &str = "run queue item";
const APPROVAL_ENTITY: &str = "approval request";

impl RunQueueItem {
    /// Transition a claimable item to `running`.
    pub fn claim(&mut self, now: DateTime<Utc>, options: &ClaimOptions) {
        self.status = QueueStatus::Running;
        self.attempts = self.attempts.saturating_add(1);
        self.started_at = Some(now);
        self.updated_at = now;
        self.finished_at = None;
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.timeout_at = None;
        if let Some(worker_id) = &options.worker_id {
            self.lease_owner = Some(worker_id.clone());
            self.lease_expires_at = options.lease.map(|lease| now + lease);
            self.timeout_at = options.run_timeout.map(|timeout| now + timeout);
        }
    }

    /// Extend the lease if `worker_id` still holds it. Returns whether it did.
    pub fn renew_lease(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) -> bool {
        if self.status != QueueStatus::Running || self.lease_owner.as_deref() != Some(worker_id) {
            return false;
        }
        self.lease_expires_at = Some(now + lease);
        self.updated_at = now;
        true
    }

    /// Record a successful pipeline run. Only running items change.
    pub fn succeed(&mut self, outcome: RunOutcome, now: DateTime<Utc>) -> bool {
        if self.status != QueueStatus::Running {
            return false;
        }
        self.run_id = Some(outcome.run_id);
        self.result_status = Some(outcome.result_status);
        if self.cancel_requested {
            apply_cancel(self, now);
            return true;
        }
        self.status = QueueStatus::Succeeded;
        self.finished_at = Some(now);
        self.updated_at = now;
        self.clear_lease();
        true
    }

    /// Record a failed attempt. Only running items change.
    pub fn fail(
        &mut self,
        error: &str,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != QueueStatus::Running {
            return false;
        }
        apply_failure(self, error, backoff, now);
        true
    }

    /// Cancel a non-terminal item.
    ///
    /// Queued and retryable items are finalized immediately. A running item
    /// only records the request; the reaper finalizes it.
    pub fn request_cancel(&mut self, reason: Option<&str>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.cancel_requested = true;
        if let Some(reason) = reason {
            self.cancel_reason = Some(reason.to_string());
        }
        if self.status == QueueStatus::Running {
            self.updated_at = now;
        } else {
            apply_cancel(self, now);
        }
        true
    }

    /// Reopen a non-running item as a fresh `queued` request.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> StorageResult<()> {
        if self.status == QueueStatus::Running {
            return Err(StorageError::InvalidTransition {
                entity: QUEUE_ENTITY,
                id: self.id.to_string(),
                status: self.status.to_string(),
                reason: "cannot retry a running item".into(),
            });
        }
        self.status = QueueStatus::Queued;
        self.attempts = 0;
        self.next_attempt_at = now;
        self.cancel_requested = false;
        self.cancel_reason = None;
        self.started_at = None;
        self.finished_at = None;
        self.last_error = None;
        self.updated_at = now;
        self.clear_lease();
        Ok(())
    }

    /// Resolve a reapable running item. Returns whether it was reaped.
    pub fn reap(&mut self, backoff: &BackoffPolicy, now: DateTime<Utc>) -> bool {
        match reap_reason(self, now) {
            Some(_) if self.cancel_requested => {
                apply_cancel(self, now);
                true
            }
            Some(reason) => {
                apply_failure(self, reason, backoff, now);
                true
            }
            None => false,
        }
    }
}

impl RunSchedule {
    /// Build a schedule, validating the cron expression and computing its
    /// first run time.
    pub fn from_new(new: NewSchedule, now: DateTime<Utc>) -> StorageResult<Self> {
        validate_schedule_name(&new.name)?;
        new.target.validate()?;
        let expr = CronExpr::parse(&new.cron)?;
        let next_run_at = expr.next_after(now)?;
        Ok(Self {
            id: uuid::Uuid::new_v4(),
            name: new.name,
            cron: expr.as_str().to_string(),
            enabled: new.enabled,
            target: new.target,
            next_run_at,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a partial update.
    ///
    /// `next_run_at` is recomputed from `now` only when the resulting schedule
    /// is enabled and either the expression changed or the schedule was just
    /// enabled. A disabled schedule keeps its frozen value.
    pub fn apply_update(&mut self, update: ScheduleUpdate, now: DateTime<Utc>) -> StorageResult<()> {
        let was_enabled = self.enabled;
        let mut cron_changed = false;

        if let Some(name) = update.name {
            validate_schedule_name(&name)?;
            self.name = name;
        }
        if let Some(cron) = update.cron {
            let expr = CronExpr::parse(&cron)?;
            // Reject expressions that can never fire, even while disabled.
            expr.next_after(now)?;
            cron_changed = expr.as_str() != self.cron;
            self.cron = expr.as_str().to_string();
        }
        if let Some(target) = update.target {
            target.validate()?;
            self.target = target;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }

        if self.enabled && (cron_changed || !was_enabled) {
            self.next_run_at = CronExpr::parse(&self.cron)?.next_after(now)?;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }

    /// Stamp a firing and advance to the next match after `now`.
    ///
    /// When the expression has no further match inside the search horizon
    /// (`0 0 29 2 *` right after a leap day) the firing still counts, but the
    /// schedule is disabled with `next_run_at` left where it was.
    pub fn fire(&mut self, now: DateTime<Utc>) -> StorageResult<()> {
        let expr = CronExpr::parse(&self.cron)?;
        self.last_run_at = Some(now);
        self.updated_at = now;
        match expr.next_after(now) {
            Ok(next) => self.next_run_at = next,
            Err(CronError::NoMatch { .. }) => {
                warn!(
                    schedule_id = %self.id,
                    cron = %self.cron,
                    "no further firing time, disabling schedule"
                );
                self.enabled = false;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

fn validate_schedule_name(name: &str) -> StorageResult<()> {
    if name.trim().is_empty() {
        return Err(StorageError::InvalidInput(
            "schedule name must not be empty".into(),
        ));
    }
    Ok(())
}

impl ApprovalRequest {
    fn ensure_pending(&self) -> StorageResult<()> {
        if self.status != ApprovalStatus::Pending {
            return Err(StorageError::InvalidTransition {
                entity: APPROVAL_ENTITY,
                id: self.id.to_string(),
                status: self.status.to_string(),
                reason: "expected pending".into(),
            });
        }
        Ok(())
    }

    pub fn approve(&mut self, actor: &str, now: DateTime<Utc>) -> StorageResult<()> {
        self.ensure_pending()?;
        self.status = ApprovalStatus::Approved;
        self.approved_by = Some(actor.to_string());
        self.approved_at = Some(now);
        Ok(())
    }

    pub fn reject(
        &mut self,
        actor: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.ensure_pending()?;
        self.status = ApprovalStatus::Rejected;
        self.rejected_by = Some(actor.to_string());
        self.rejected_at = Some(now);
        self.rejection_reason = reason.map(str::to_string);
        Ok(())
    }
}
