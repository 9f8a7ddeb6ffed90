//! Store contracts against Postgres.
//!
//! Skipped unless `DOCKHAND_TEST_POSTGRES_URL` points at a disposable
//! database; the tables are truncated between contracts.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::*;
use dockhand_state::*;

fn test_db_url() -> Option<String> {
    std::env::var("DOCKHAND_TEST_POSTGRES_URL").ok()
}

async fn reset(handle: &PgHandle) {
    postgres::schema::ensure_schema(handle.pool()).await.unwrap();
    sqlx::query("TRUNCATE dockhand_run_queue, dockhand_schedules, dockhand_approvals")
        .execute(handle.pool())
        .await
        .unwrap();
}

// Contracts share tables, so they run sequentially inside one test.
#[tokio::test]
async fn postgres_store_contracts_when_env_is_set() {
    let Some(url) = test_db_url() else {
        eprintln!("DOCKHAND_TEST_POSTGRES_URL not set, skipping");
        return;
    };
    let handle = PgHandle::connect(&url).await.unwrap();
    let queue = PgRunQueue::new(handle.clone());
    let schedules = PgScheduleStore::new(handle.clone());
    let approvals = PgApprovalStore::new(handle.clone());

    macro_rules! contract {
        ($f:ident, $store:expr) => {
            reset(&handle).await;
            $f($store).await;
        };
    }

    contract!(queue_claim_marks_running_with_lease, &queue);
    contract!(queue_claims_oldest_first, &queue);
    contract!(queue_single_attempt_failure_is_terminal, &queue);
    contract!(queue_backoff_is_monotonic_and_capped, &queue);
    contract!(queue_heartbeat_requires_lease_owner, &queue);
    contract!(queue_transitions_land_alongside_heartbeats, &queue);
    contract!(queue_cancel_queued_is_immediate, &queue);
    contract!(queue_cancel_running_is_finalized_by_reaper, &queue);
    contract!(queue_success_after_cancel_request_resolves_canceled, &queue);
    contract!(queue_terminal_items_are_immutable, &queue);
    contract!(queue_retry_resets_and_rejects_running, &queue);
    contract!(queue_reaps_expired_lease, &queue);
    contract!(queue_reaps_run_timeout_despite_heartbeats, &queue);
    contract!(queue_get_and_list, &queue);

    contract!(schedule_create_computes_next_run, &schedules);
    contract!(schedule_rejects_invalid_cron, &schedules);
    contract!(schedule_claim_due_advances_once, &schedules);
    contract!(schedule_without_next_match_is_disabled_not_blocking, &schedules);
    contract!(schedule_disabled_is_frozen, &schedules);
    contract!(schedule_update_recomputes_when_enabled, &schedules);
    contract!(schedule_delete_removes, &schedules);

    contract!(approval_create_is_idempotent_per_run, &approvals);
    contract!(approval_decisions_are_terminal, &approvals);
    contract!(approval_reject_records_reason, &approvals);

    reset(&handle).await;
    concurrent_claims_have_single_winner(&handle).await;

    reset(&handle).await;
    concurrent_pending_approvals_collapse(&handle).await;
}

async fn concurrent_claims_have_single_winner(handle: &PgHandle) {
    let queue = Arc::new(PgRunQueue::new(handle.clone()));
    for i in 0..5 {
        queue.enqueue(issue(&format!("race-{i}"))).await.unwrap();
    }

    let now = Utc::now();
    let mut tasks = Vec::new();
    for w in 0..10 {
        let queue = Arc::clone(&queue);
        tasks.push(tokio::spawn(async move {
            queue
                .claim_next(now, &leased(&format!("w{w}"), Duration::seconds(30)))
                .await
                .unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(item) = task.await.unwrap() {
            claimed.push(item.id);
        }
    }
    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(before, claimed.len(), "an item was claimed twice");
    assert_eq!(claimed.len(), 5);
}

async fn concurrent_pending_approvals_collapse(handle: &PgHandle) {
    let store = Arc::new(PgApprovalStore::new(handle.clone()));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            store.create_pending(new_approval("run-race")).await.unwrap().0.id
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 1, "expected one pending approval, got {ids:?}");
    assert_eq!(
        store
            .list(Some(ApprovalStatus::Pending))
            .await
            .unwrap()
            .len(),
        1
    );
}
