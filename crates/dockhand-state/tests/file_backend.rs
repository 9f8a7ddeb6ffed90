//! Store contracts against the single-writer file backend.

mod common;

use chrono::{Duration, Utc};
use common::*;
use dockhand_state::file::{APPROVALS_FILE, RUN_QUEUE_FILE, SCHEDULES_FILE};
use dockhand_state::*;
use tempfile::TempDir;

fn queue() -> (TempDir, FileRunQueue) {
    let dir = tempfile::tempdir().unwrap();
    let queue = FileRunQueue::new(dir.path()).unwrap();
    (dir, queue)
}

fn schedules() -> (TempDir, FileScheduleStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileScheduleStore::new(dir.path()).unwrap();
    (dir, store)
}

fn approvals() -> (TempDir, FileApprovalStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileApprovalStore::new(dir.path()).unwrap();
    (dir, store)
}

// ===========================================================================
// RunQueue
// ===========================================================================

#[tokio::test]
async fn file_queue_claim_marks_running_with_lease() {
    let (_dir, q) = queue();
    queue_claim_marks_running_with_lease(&q).await;
}

#[tokio::test]
async fn file_queue_claims_oldest_first() {
    let (_dir, q) = queue();
    queue_claims_oldest_first(&q).await;
}

#[tokio::test]
async fn file_queue_single_attempt_failure_is_terminal() {
    let (_dir, q) = queue();
    queue_single_attempt_failure_is_terminal(&q).await;
}

#[tokio::test]
async fn file_queue_backoff_is_monotonic_and_capped() {
    let (_dir, q) = queue();
    queue_backoff_is_monotonic_and_capped(&q).await;
}

#[tokio::test]
async fn file_queue_heartbeat_requires_lease_owner() {
    let (_dir, q) = queue();
    queue_heartbeat_requires_lease_owner(&q).await;
}

#[tokio::test]
async fn file_queue_transitions_land_alongside_heartbeats() {
    let (_dir, q) = queue();
    queue_transitions_land_alongside_heartbeats(&q).await;
}

#[tokio::test]
async fn file_queue_cancel_queued_is_immediate() {
    let (_dir, q) = queue();
    queue_cancel_queued_is_immediate(&q).await;
}

#[tokio::test]
async fn file_queue_cancel_running_is_finalized_by_reaper() {
    let (_dir, q) = queue();
    queue_cancel_running_is_finalized_by_reaper(&q).await;
}

#[tokio::test]
async fn file_queue_success_after_cancel_request_resolves_canceled() {
    let (_dir, q) = queue();
    queue_success_after_cancel_request_resolves_canceled(&q).await;
}

#[tokio::test]
async fn file_queue_terminal_items_are_immutable() {
    let (_dir, q) = queue();
    queue_terminal_items_are_immutable(&q).await;
}

#[tokio::test]
async fn file_queue_retry_resets_and_rejects_running() {
    let (_dir, q) = queue();
    queue_retry_resets_and_rejects_running(&q).await;
}

#[tokio::test]
async fn file_queue_reaps_expired_lease() {
    let (_dir, q) = queue();
    queue_reaps_expired_lease(&q).await;
}

#[tokio::test]
async fn file_queue_reaps_run_timeout_despite_heartbeats() {
    let (_dir, q) = queue();
    queue_reaps_run_timeout_despite_heartbeats(&q).await;
}

#[tokio::test]
async fn file_queue_get_and_list() {
    let (_dir, q) = queue();
    queue_get_and_list(&q).await;
}

#[tokio::test]
async fn file_queue_survives_reopen() {
    let (dir, q) = queue();
    let item = q.enqueue(issue("durable")).await.unwrap();
    q.claim_next(Utc::now(), &leased("w1", Duration::seconds(30)))
        .await
        .unwrap()
        .unwrap();
    drop(q);

    let reopened = FileRunQueue::new(dir.path()).unwrap();
    let loaded = reopened.get(item.id).await.unwrap();
    assert_eq!(loaded.status, QueueStatus::Running);
    assert_eq!(loaded.lease_owner.as_deref(), Some("w1"));
    assert!(dir.path().join(RUN_QUEUE_FILE).exists());
}

// ===========================================================================
// ScheduleStore
// ===========================================================================

#[tokio::test]
async fn file_schedule_create_computes_next_run() {
    let (_dir, s) = schedules();
    schedule_create_computes_next_run(&s).await;
}

#[tokio::test]
async fn file_schedule_rejects_invalid_cron() {
    let (_dir, s) = schedules();
    schedule_rejects_invalid_cron(&s).await;
}

#[tokio::test]
async fn file_schedule_claim_due_advances_once() {
    let (_dir, s) = schedules();
    schedule_claim_due_advances_once(&s).await;
}

#[tokio::test]
async fn file_schedule_without_next_match_is_disabled_not_blocking() {
    let (_dir, s) = schedules();
    schedule_without_next_match_is_disabled_not_blocking(&s).await;
}

#[tokio::test]
async fn file_schedule_disabled_is_frozen() {
    let (_dir, s) = schedules();
    schedule_disabled_is_frozen(&s).await;
}

#[tokio::test]
async fn file_schedule_update_recomputes_when_enabled() {
    let (_dir, s) = schedules();
    schedule_update_recomputes_when_enabled(&s).await;
}

#[tokio::test]
async fn file_schedule_delete_removes() {
    let (dir, s) = schedules();
    schedule_delete_removes(&s).await;
    assert!(dir.path().join(SCHEDULES_FILE).exists());
}

// ===========================================================================
// ApprovalStore
// ===========================================================================

#[tokio::test]
async fn file_approval_create_is_idempotent_per_run() {
    let (_dir, a) = approvals();
    approval_create_is_idempotent_per_run(&a).await;
}

#[tokio::test]
async fn file_approval_decisions_are_terminal() {
    let (_dir, a) = approvals();
    approval_decisions_are_terminal(&a).await;
}

#[tokio::test]
async fn file_approval_reject_records_reason() {
    let (dir, a) = approvals();
    approval_reject_records_reason(&a).await;
    assert!(dir.path().join(APPROVALS_FILE).exists());
}

#[tokio::test]
async fn open_stores_uses_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let stores = open_stores(&StoreBackend::File {
        state_dir: dir.path().join("nested"),
    })
    .await
    .unwrap();
    stores.queue.enqueue(issue("via-factory")).await.unwrap();
    assert!(dir.path().join("nested").join(RUN_QUEUE_FILE).exists());
}
