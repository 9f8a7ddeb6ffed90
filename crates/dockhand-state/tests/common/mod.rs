//! Behavioral contracts shared by every store backend.
//!
//! Each function takes a freshly opened, empty store and panics on the first
//! violated guarantee.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use dockhand_state::*;

pub fn issue(id: &str) -> EnqueueRequest {
    EnqueueRequest::new(WorkItemRef::issue(id))
}

pub fn leased(worker: &str, lease: Duration) -> ClaimOptions {
    ClaimOptions::for_worker(worker, lease)
}

// ===========================================================================
// RunQueue
// ===========================================================================

pub async fn queue_claim_marks_running_with_lease(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("PROJ-1")).await.unwrap();
    assert_eq!(item.status, QueueStatus::Queued);
    assert_eq!(item.attempts, 0);

    let now = Utc::now();
    let claimed = queue
        .claim_next(now, &leased("w1", Duration::seconds(30)))
        .await
        .unwrap()
        .expect("item should be claimable");

    assert_eq!(claimed.id, item.id);
    assert_eq!(claimed.status, QueueStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));
    assert!(claimed.lease_expires_at.unwrap() > now);
    assert!(claimed.timeout_at.is_none());

    // Nothing else is eligible.
    assert!(queue
        .claim_next(now, &ClaimOptions::default())
        .await
        .unwrap()
        .is_none());
}

pub async fn queue_claims_oldest_first(queue: &dyn RunQueue) {
    let first = queue.enqueue(issue("A")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = queue.enqueue(issue("B")).await.unwrap();

    let now = Utc::now();
    let a = queue.claim_next(now, &ClaimOptions::default()).await.unwrap().unwrap();
    let b = queue.claim_next(now, &ClaimOptions::default()).await.unwrap().unwrap();
    assert_eq!(a.id, first.id);
    assert_eq!(b.id, second.id);
}

pub async fn queue_single_attempt_failure_is_terminal(queue: &dyn RunQueue) {
    let item = queue
        .enqueue(EnqueueRequest::new(WorkItemRef::review_request("acme/api", 12)).with_max_attempts(1))
        .await
        .unwrap();
    let now = Utc::now();
    queue.claim_next(now, &ClaimOptions::default()).await.unwrap().unwrap();

    let failed = queue
        .mark_failed(item.id, "build broke", &BackoffPolicy::default(), now)
        .await
        .unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("build broke"));
    assert!(failed.finished_at.is_some());

    let later = now + Duration::hours(2);
    assert!(queue
        .claim_next(later, &ClaimOptions::default())
        .await
        .unwrap()
        .is_none());
}

pub async fn queue_backoff_is_monotonic_and_capped(queue: &dyn RunQueue) {
    let backoff = BackoffPolicy::from_millis(1_000, 3_000);
    let item = queue.enqueue(issue("flaky").with_max_attempts(4)).await.unwrap();

    let mut now = Utc::now();
    let mut deltas = Vec::new();
    for _ in 0..3 {
        queue
            .claim_next(now, &ClaimOptions::default())
            .await
            .unwrap()
            .expect("retryable item should be claimable once eligible");
        let failed = queue.mark_failed(item.id, "flake", &backoff, now).await.unwrap();
        assert_eq!(failed.status, QueueStatus::Retryable);

        // Not eligible before the backoff elapses.
        assert!(queue
            .claim_next(now, &ClaimOptions::default())
            .await
            .unwrap()
            .is_none());

        deltas.push(failed.next_attempt_at - now);
        now = failed.next_attempt_at;
    }

    assert_eq!(
        deltas,
        vec![Duration::seconds(1), Duration::seconds(2), Duration::seconds(3)]
    );

    queue.claim_next(now, &ClaimOptions::default()).await.unwrap().unwrap();
    let exhausted = queue.mark_failed(item.id, "flake", &backoff, now).await.unwrap();
    assert_eq!(exhausted.status, QueueStatus::Failed);
    assert_eq!(exhausted.attempts, 4);
}

pub async fn queue_heartbeat_requires_lease_owner(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("hb")).await.unwrap();
    let now = Utc::now();
    queue
        .claim_next(now, &leased("w1", Duration::seconds(5)))
        .await
        .unwrap()
        .unwrap();

    assert!(!queue
        .heartbeat(item.id, "w2", Duration::seconds(60), now)
        .await
        .unwrap());
    assert!(queue
        .heartbeat(item.id, "w1", Duration::seconds(60), now)
        .await
        .unwrap());

    let renewed = queue.get(item.id).await.unwrap();
    assert!(renewed.lease_expires_at.unwrap() >= now + Duration::seconds(59));
}

pub async fn queue_transitions_land_alongside_heartbeats(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("busy")).await.unwrap();
    let now = Utc::now();
    let lease = leased("w1", Duration::seconds(30));
    queue.claim_next(now, &lease).await.unwrap().unwrap();

    let (renewed, canceled) = tokio::join!(
        queue.heartbeat(item.id, "w1", Duration::seconds(30), now),
        queue.cancel(item.id, Some("operator")),
    );
    renewed.unwrap();
    assert!(canceled.unwrap().cancel_requested);

    let backoff = BackoffPolicy::default();
    let (renewed, failed) = tokio::join!(
        queue.heartbeat(item.id, "w1", Duration::seconds(30), now),
        queue.mark_failed(item.id, "deploy broke", &backoff, now),
    );
    renewed.unwrap();
    let failed = failed.unwrap();
    assert_eq!(failed.status, QueueStatus::Canceled);
    assert_eq!(failed.last_error.as_deref(), Some("deploy broke"));
    assert_eq!(queue.get(item.id).await.unwrap().status, failed.status);
}

pub async fn queue_cancel_queued_is_immediate(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("c1")).await.unwrap();
    let canceled = queue.cancel(item.id, Some("not needed")).await.unwrap();
    assert_eq!(canceled.status, QueueStatus::Canceled);
    assert_eq!(canceled.cancel_reason.as_deref(), Some("not needed"));

    assert!(queue
        .claim_next(Utc::now(), &ClaimOptions::default())
        .await
        .unwrap()
        .is_none());
}

pub async fn queue_cancel_running_is_finalized_by_reaper(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("c2")).await.unwrap();
    let now = Utc::now();
    queue
        .claim_next(now, &leased("w1", Duration::minutes(5)))
        .await
        .unwrap()
        .unwrap();

    let requested = queue.cancel(item.id, None).await.unwrap();
    assert_eq!(requested.status, QueueStatus::Running);
    assert!(requested.cancel_requested);

    let reaped = queue
        .reap_expired_running(now, &BackoffPolicy::default())
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].status, QueueStatus::Canceled);
    assert_eq!(reaped[0].cancel_reason.as_deref(), Some(DEFAULT_CANCEL_REASON));
}

pub async fn queue_success_after_cancel_request_resolves_canceled(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("c3")).await.unwrap();
    queue
        .claim_next(Utc::now(), &ClaimOptions::default())
        .await
        .unwrap()
        .unwrap();
    queue.cancel(item.id, Some("operator")).await.unwrap();

    let resolved = queue
        .mark_succeeded(
            item.id,
            RunOutcome {
                run_id: "run-1".into(),
                result_status: "succeeded".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, QueueStatus::Canceled);
}

pub async fn queue_terminal_items_are_immutable(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("t1")).await.unwrap();
    let now = Utc::now();
    queue.claim_next(now, &ClaimOptions::default()).await.unwrap().unwrap();
    let done = queue
        .mark_succeeded(
            item.id,
            RunOutcome {
                run_id: "run-9".into(),
                result_status: "succeeded".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, QueueStatus::Succeeded);
    assert_eq!(done.run_id.as_deref(), Some("run-9"));

    let after_fail = queue
        .mark_failed(item.id, "late", &BackoffPolicy::default(), now)
        .await
        .unwrap();
    assert_eq!(after_fail.status, QueueStatus::Succeeded);
    let after_cancel = queue.cancel(item.id, None).await.unwrap();
    assert_eq!(after_cancel.status, QueueStatus::Succeeded);
    assert!(after_cancel.last_error.is_none());
}

pub async fn queue_retry_resets_and_rejects_running(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("r1").with_max_attempts(1)).await.unwrap();
    let now = Utc::now();
    queue.claim_next(now, &ClaimOptions::default()).await.unwrap().unwrap();

    let err = queue.retry(item.id).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));

    queue
        .mark_failed(item.id, "boom", &BackoffPolicy::default(), now)
        .await
        .unwrap();
    let reopened = queue.retry(item.id).await.unwrap();
    assert_eq!(reopened.status, QueueStatus::Queued);
    assert_eq!(reopened.attempts, 0);
    assert!(reopened.last_error.is_none());

    assert!(queue
        .claim_next(Utc::now(), &ClaimOptions::default())
        .await
        .unwrap()
        .is_some());
}

pub async fn queue_reaps_expired_lease(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("lease")).await.unwrap();
    let claimed_at = Utc::now();
    queue
        .claim_next(claimed_at, &leased("w1", Duration::milliseconds(1)))
        .await
        .unwrap()
        .unwrap();

    let reap_at = claimed_at + Duration::milliseconds(50);
    let reaped = queue
        .reap_expired_running(reap_at, &BackoffPolicy::default())
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, item.id);
    assert_eq!(reaped[0].status, QueueStatus::Retryable);
    assert!(reaped[0].next_attempt_at > reap_at);
    assert_eq!(reaped[0].last_error.as_deref(), Some(LEASE_EXPIRED_REASON));
    assert!(reaped[0].lease_owner.is_none());

    // A second pass finds nothing.
    assert!(queue
        .reap_expired_running(reap_at, &BackoffPolicy::default())
        .await
        .unwrap()
        .is_empty());
}

pub async fn queue_reaps_run_timeout_despite_heartbeats(queue: &dyn RunQueue) {
    let item = queue.enqueue(issue("timeout")).await.unwrap();
    let now = Utc::now();
    queue
        .claim_next(
            now,
            &leased("w1", Duration::minutes(10)).with_run_timeout(Duration::seconds(1)),
        )
        .await
        .unwrap()
        .unwrap();
    let later = now + Duration::seconds(5);
    assert!(queue
        .heartbeat(item.id, "w1", Duration::minutes(10), later)
        .await
        .unwrap());

    let reaped = queue
        .reap_expired_running(later, &BackoffPolicy::default())
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].last_error.as_deref(), Some(RUN_TIMEOUT_REASON));
}

pub async fn queue_get_and_list(queue: &dyn RunQueue) {
    let a = queue.enqueue(issue("L1")).await.unwrap();
    let b = queue.enqueue(issue("L2")).await.unwrap();
    queue.cancel(b.id, None).await.unwrap();

    assert_eq!(queue.get(a.id).await.unwrap().reference, WorkItemRef::issue("L1"));
    assert!(matches!(
        queue.get(uuid::Uuid::new_v4()).await.unwrap_err(),
        StorageError::NotFound { .. }
    ));

    assert_eq!(queue.list(None).await.unwrap().len(), 2);
    let canceled = queue.list(Some(QueueStatus::Canceled)).await.unwrap();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].id, b.id);
}

// ===========================================================================
// ScheduleStore
// ===========================================================================

pub fn new_schedule(name: &str, cron: &str, enabled: bool) -> NewSchedule {
    NewSchedule {
        name: name.to_string(),
        cron: cron.to_string(),
        enabled,
        target: issue("SCHED-1"),
    }
}

pub async fn schedule_create_computes_next_run(store: &dyn ScheduleStore) {
    let before = Utc::now();
    let schedule = store
        .create(new_schedule("every-5", "*/5 * * * *", true))
        .await
        .unwrap();
    assert!(schedule.next_run_at > before);
    assert!(schedule.next_run_at <= before + Duration::minutes(5) + Duration::seconds(1));
    assert!(CronExpr::parse(&schedule.cron).unwrap().matches(schedule.next_run_at));
    assert!(schedule.last_run_at.is_none());
}

pub async fn schedule_rejects_invalid_cron(store: &dyn ScheduleStore) {
    let err = store
        .create(new_schedule("bad", "61 * * * *", true))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidCron(_)));
    assert!(store.list().await.unwrap().is_empty());
}

pub async fn schedule_claim_due_advances_once(store: &dyn ScheduleStore) {
    let schedule = store
        .create(new_schedule("minutely", "* * * * *", true))
        .await
        .unwrap();
    let now = schedule.next_run_at + Duration::seconds(10);

    let claimed = store.claim_due(now).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, schedule.id);
    assert_eq!(claimed[0].last_run_at, Some(now));
    assert!(claimed[0].next_run_at > now);

    assert!(store.claim_due(now).await.unwrap().is_empty());
}

pub async fn schedule_without_next_match_is_disabled_not_blocking(store: &dyn ScheduleStore) {
    let leap = store
        .create(new_schedule("leap-day", "0 0 29 2 *", true))
        .await
        .unwrap();
    let minutely = store
        .create(new_schedule("minutely", "* * * * *", true))
        .await
        .unwrap();
    // The following 29 February is four years out, past the search horizon.
    let now = leap.next_run_at + Duration::seconds(30);

    let claimed = store.claim_due(now).await.unwrap();
    assert_eq!(claimed.len(), 2);
    let fired_leap = claimed.iter().find(|s| s.id == leap.id).unwrap();
    assert!(!fired_leap.enabled);
    assert_eq!(fired_leap.last_run_at, Some(now));
    let fired_minutely = claimed.iter().find(|s| s.id == minutely.id).unwrap();
    assert!(fired_minutely.enabled);
    assert!(fired_minutely.next_run_at > now);

    assert!(store.claim_due(now).await.unwrap().is_empty());
    assert!(!store.get(leap.id).await.unwrap().enabled);
}

pub async fn schedule_disabled_is_frozen(store: &dyn ScheduleStore) {
    let schedule = store
        .create(new_schedule("paused", "* * * * *", false))
        .await
        .unwrap();
    let far = schedule.next_run_at + Duration::days(1);
    assert!(store.claim_due(far).await.unwrap().is_empty());

    let renamed = store
        .update(
            schedule.id,
            ScheduleUpdate {
                name: Some("still-paused".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.next_run_at, schedule.next_run_at);

    let enabled = store
        .update(
            schedule.id,
            ScheduleUpdate {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(enabled.enabled);
    assert!(enabled.next_run_at >= schedule.next_run_at);
}

pub async fn schedule_update_recomputes_when_enabled(store: &dyn ScheduleStore) {
    let schedule = store
        .create(new_schedule("hourly", "0 * * * *", true))
        .await
        .unwrap();
    let updated = store
        .update(
            schedule.id,
            ScheduleUpdate {
                cron: Some("30 4 1 1 *".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.cron, "30 4 1 1 *");
    assert!(CronExpr::parse("30 4 1 1 *")
        .unwrap()
        .matches(updated.next_run_at));

    let err = store
        .update(
            schedule.id,
            ScheduleUpdate {
                cron: Some("0 0 31 2 *".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidCron(CronError::NoMatch { .. })));
}

pub async fn schedule_delete_removes(store: &dyn ScheduleStore) {
    let schedule = store
        .create(new_schedule("gone", "0 0 * * *", true))
        .await
        .unwrap();
    store.delete(schedule.id).await.unwrap();
    assert!(matches!(
        store.get(schedule.id).await.unwrap_err(),
        StorageError::NotFound { .. }
    ));
    assert!(matches!(
        store.delete(schedule.id).await.unwrap_err(),
        StorageError::NotFound { .. }
    ));
}

// ===========================================================================
// ApprovalStore
// ===========================================================================

pub fn new_approval(run_id: &str) -> NewApproval {
    NewApproval {
        run_id: run_id.to_string(),
        queue_item_id: uuid::Uuid::new_v4(),
        reference: WorkItemRef::issue("APP-1"),
        reason: "manual approval required before production deployment".into(),
        correlation_id: Some("SD-42".into()),
    }
}

pub async fn approval_create_is_idempotent_per_run(store: &dyn ApprovalStore) {
    let (first, created) = store.create_pending(new_approval("run-1")).await.unwrap();
    assert!(created);
    let (second, created) = store.create_pending(new_approval("run-1")).await.unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);
    assert_eq!(first.status, ApprovalStatus::Pending);
    assert_eq!(store.list(None).await.unwrap().len(), 1);

    let (other, _) = store.create_pending(new_approval("run-2")).await.unwrap();
    assert_ne!(other.id, first.id);
}

pub async fn approval_decisions_are_terminal(store: &dyn ApprovalStore) {
    let (approval, _) = store.create_pending(new_approval("run-3")).await.unwrap();
    let approved = store.mark_approved(approval.id, "alice").await.unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(approved.approved_by.as_deref(), Some("alice"));
    assert!(approved.approved_at.is_some());

    let err = store
        .mark_rejected(approval.id, "bob", Some("too late"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
    assert_eq!(
        store.get(approval.id).await.unwrap().status,
        ApprovalStatus::Approved
    );

    // Once decided, the same run may request a fresh approval.
    let (again, created) = store.create_pending(new_approval("run-3")).await.unwrap();
    assert!(created);
    assert_ne!(again.id, approval.id);
}

pub async fn approval_reject_records_reason(store: &dyn ApprovalStore) {
    let (approval, _) = store.create_pending(new_approval("run-4")).await.unwrap();
    let rejected = store
        .mark_rejected(approval.id, "bob", Some("scan findings"))
        .await
        .unwrap();
    assert_eq!(rejected.status, ApprovalStatus::Rejected);
    assert_eq!(rejected.rejected_by.as_deref(), Some("bob"));
    assert_eq!(rejected.rejection_reason.as_deref(), Some("scan findings"));
    assert_eq!(rejected.correlation_id.as_deref(), Some("SD-42"));

    assert!(store.mark_approved(approval.id, "alice").await.is_err());
    assert!(store
        .list(Some(ApprovalStatus::Pending))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store
            .list(Some(ApprovalStatus::Rejected))
            .await
            .unwrap()
            .len(),
        1
    );
}
