//! Retry/fail decision shared by every queue backend.
//!
//! A failed attempt either exhausts the item's attempt budget (terminal
//! `failed`) or re-opens it as `retryable` after an exponential delay:
//! `min(max, initial * 2^(attempts - 1))`.

use chrono::{DateTime, Duration, Utc};

use crate::model::{QueueStatus, RunQueueItem};

/// Synthetic error recorded when a worker stops heartbeating.
pub const LEASE_EXPIRED_REASON: &str = "lease expired";
/// Synthetic error recorded when an item outlives its absolute run timeout.
pub const RUN_TIMEOUT_REASON: &str = "run timeout exceeded";
/// Cancel reason used when a caller did not supply one.
pub const DEFAULT_CANCEL_REASON: &str = "canceled";

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::seconds(30),
            max: Duration::minutes(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial: Duration::milliseconds(initial_ms.min(i64::MAX as u64) as i64),
            max: Duration::milliseconds(max_ms.min(i64::MAX as u64) as i64),
        }
    }

    /// Delay before the next attempt after `attempts` attempts have been made.
    ///
    /// Attempt 1 yields `initial`; the doubling saturates at `max`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(62);
        let initial_ms = self.initial.num_milliseconds().max(0);
        let max_ms = self.max.num_milliseconds().max(0);
        let scaled = initial_ms.saturating_mul(1i64 << exponent);
        Duration::milliseconds(scaled.min(max_ms))
    }
}

/// Outcome of the retry/fail decision for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Attempt budget exhausted.
    Fail,
    /// Eligible again at the given instant.
    Retry { next_attempt_at: DateTime<Utc> },
}

/// Decide how a failed running item resolves.
pub fn decide_failure(
    item: &RunQueueItem,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> FailureDecision {
    if item.attempts >= item.max_attempts {
        return FailureDecision::Fail;
    }
    let candidate = now + backoff.delay_for(item.attempts);
    // Never move the eligibility gate backwards across retries.
    let next_attempt_at = candidate.max(item.next_attempt_at);
    FailureDecision::Retry { next_attempt_at }
}

/// Apply a failed attempt to a running item in place.
///
/// A cancel request that arrived while the attempt was running wins over the
/// retry/fail decision.
pub fn apply_failure(
    item: &mut RunQueueItem,
    error: &str,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) {
    item.last_error = Some(error.to_string());
    item.updated_at = now;
    if item.cancel_requested {
        apply_cancel(item, now);
        return;
    }
    match decide_failure(item, backoff, now) {
        FailureDecision::Fail => {
            item.status = QueueStatus::Failed;
            item.finished_at = Some(now);
        }
        FailureDecision::Retry { next_attempt_at } => {
            item.status = QueueStatus::Retryable;
            item.next_attempt_at = next_attempt_at;
        }
    }
    item.clear_lease();
}

/// Finalize an item as canceled.
pub fn apply_cancel(item: &mut RunQueueItem, now: DateTime<Utc>) {
    item.status = QueueStatus::Canceled;
    item.cancel_requested = true;
    if item.cancel_reason.is_none() {
        item.cancel_reason = Some(DEFAULT_CANCEL_REASON.to_string());
    }
    item.finished_at = Some(now);
    item.updated_at = now;
    item.clear_lease();
}

/// Synthetic reason for a reaped item, or `None` if it is not reapable.
pub fn reap_reason(item: &RunQueueItem, now: DateTime<Utc>) -> Option<&'static str> {
    if item.status != QueueStatus::Running {
        return None;
    }
    if item.cancel_requested {
        Some(DEFAULT_CANCEL_REASON)
    } else if item.timed_out(now) {
        Some(RUN_TIMEOUT_REASON)
    } else if item.lease_expired(now) {
        Some(LEASE_EXPIRED_REASON)
    } else {
        None
    }
}
