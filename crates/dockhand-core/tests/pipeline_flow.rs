//! End-to-end pipeline tests over file-backed stores and in-memory
//! collaborators.

mod common;

use std::sync::Arc;

use common::{harness, harness_with, high_finding, MarkerlessGenerator};
use dockhand_core::dockhand_state::{
    ApprovalStatus, EnqueueRequest, QueueStatus, RunOptions, WorkItemRef,
};
use dockhand_core::pipeline::{DEV_ENVIRONMENT, PROD_ENVIRONMENT};
use dockhand_core::{
    AgentStatus, DeployPolicy, EventKind, PipelineError, ScanResult, TickOutcome,
    MANUAL_APPROVAL_NOTE,
};

#[tokio::test]
async fn test_clean_scan_with_auto_policy_promotes_to_prod() {
    let h = harness(DeployPolicy::Auto, ScanResult::default()).await;
    let ctx = h
        .orchestrator
        .run_from_reference(&WorkItemRef::issue("PROJ-1"), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(ctx.status, AgentStatus::Succeeded);
    assert!(ctx.review_notes.is_empty());
    assert!(ctx.artifacts.deployments.contains_key(DEV_ENVIRONMENT));
    assert!(ctx.artifacts.deployments.contains_key(PROD_ENVIRONMENT));
    assert_eq!(ctx.artifacts.review.as_ref().map(|r| r.number), Some(1));

    let deployed: Vec<_> = h
        .publisher
        .deployments()
        .await
        .into_iter()
        .map(|d| d.environment)
        .collect();
    assert_eq!(deployed, vec!["dev", "prod"]);
}

#[tokio::test]
async fn test_event_history_wraps_every_step() {
    let h = harness(DeployPolicy::Auto, ScanResult::default()).await;
    let ctx = h
        .orchestrator
        .run_from_reference(&WorkItemRef::issue("PROJ-2"), RunOptions::default())
        .await
        .unwrap();

    let history = h.events.history(&ctx.run_id).await;
    assert_eq!(history.first().map(|e| e.kind), Some(EventKind::RunStarted));
    assert_eq!(history.last().map(|e| e.kind), Some(EventKind::RunCompleted));
    assert_eq!(history[0].payload["plan"].as_array().unwrap().len(), ctx.plan.len());

    // Every step: started immediately followed by completed.
    let task_events: Vec<_> = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskStarted | EventKind::TaskCompleted))
        .collect();
    assert_eq!(task_events.len(), ctx.plan.len() * 2);
    for pair in task_events.chunks(2) {
        assert_eq!(pair[0].kind, EventKind::TaskStarted);
        assert_eq!(pair[1].kind, EventKind::TaskCompleted);
        assert_eq!(pair[0].step, pair[1].step);
    }
    let steps: Vec<_> = task_events
        .iter()
        .step_by(2)
        .filter_map(|e| e.step.clone())
        .collect();
    assert_eq!(steps, ctx.plan);

    for (i, event) in history.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }
}

#[tokio::test]
async fn test_high_finding_with_auto_policy_needs_review_without_approval_note() {
    let h = harness(DeployPolicy::Auto, high_finding()).await;
    let ctx = h
        .orchestrator
        .run_from_reference(&WorkItemRef::issue("PROJ-3"), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(ctx.status, AgentStatus::NeedsReview);
    assert_eq!(
        ctx.review_notes,
        vec!["security scan reported 1 high vulnerability"]
    );
    assert!(!ctx.has_note(MANUAL_APPROVAL_NOTE));
    assert!(!ctx.artifacts.deployments.contains_key(PROD_ENVIRONMENT));

    let history = h.events.history(&ctx.run_id).await;
    assert!(history.iter().any(|e| e.kind == EventKind::ReviewRequested));
    assert!(!history
        .iter()
        .any(|e| e.step.as_deref() == Some("deploy_prod")));
}

#[tokio::test]
async fn test_worker_with_auto_policy_creates_no_approval() {
    let h = harness(DeployPolicy::Auto, high_finding()).await;
    h.stores
        .queue
        .enqueue(EnqueueRequest::new(WorkItemRef::issue("PROJ-4")))
        .await
        .unwrap();

    let TickOutcome::Processed(item) = h.worker.tick().await.unwrap() else {
        panic!("expected a processed item");
    };
    assert_eq!(item.status, QueueStatus::Succeeded);
    assert_eq!(item.result_status.as_deref(), Some("needs_review"));
    assert!(h.stores.approvals.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_with_approval_policy_creates_exactly_one_approval() {
    let h = harness(DeployPolicy::Approval, high_finding()).await;
    let queued = h
        .stores
        .queue
        .enqueue(EnqueueRequest::new(WorkItemRef::issue("PROJ-5")))
        .await
        .unwrap();

    let TickOutcome::Processed(item) = h.worker.tick().await.unwrap() else {
        panic!("expected a processed item");
    };
    assert_eq!(item.id, queued.id);
    assert_eq!(item.result_status.as_deref(), Some("needs_review"));

    let approvals = h.stores.approvals.list(None).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Pending);
    assert_eq!(approvals[0].queue_item_id, queued.id);
    assert_eq!(Some(approvals[0].run_id.clone()), item.run_id);
    assert!(approvals[0].reason.contains(MANUAL_APPROVAL_NOTE));

    assert!(matches!(h.worker.tick().await.unwrap(), TickOutcome::Idle));
    assert_eq!(h.stores.approvals.list(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_approved_rerun_deploys_to_prod() {
    let h = harness(DeployPolicy::Approval, ScanResult::default()).await;
    h.stores
        .queue
        .enqueue(EnqueueRequest::new(WorkItemRef::issue("PROJ-6")).with_options(RunOptions {
            correlation_id: Some("SD-42".into()),
            ..Default::default()
        }))
        .await
        .unwrap();

    h.worker.tick().await.unwrap();
    let pending = h
        .stores
        .approvals
        .list(Some(ApprovalStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let (_, requeued) = h.gate.approve(pending[0].id, "release-manager").await.unwrap();
    assert!(requeued.options.approval_override);

    let TickOutcome::Processed(item) = h.worker.tick().await.unwrap() else {
        panic!("expected the approved re-run");
    };
    assert_eq!(item.id, requeued.id);
    assert_eq!(item.result_status.as_deref(), Some("succeeded"));
    // The override run never opens a second request.
    assert_eq!(h.stores.approvals.list(None).await.unwrap().len(), 1);

    let notes = h.ticketing.notes().await;
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|(id, _)| id == "SD-42"));
    assert!(notes[1].1.contains("deployed to production"));
}

#[tokio::test]
async fn test_override_with_findings_still_needs_review() {
    let h = harness(DeployPolicy::Approval, high_finding()).await;
    let ctx = h
        .orchestrator
        .run_from_reference(
            &WorkItemRef::issue("PROJ-7"),
            RunOptions {
                approval_override: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(ctx.status, AgentStatus::NeedsReview);
    assert!(!ctx.has_note(MANUAL_APPROVAL_NOTE));
}

#[tokio::test]
async fn test_review_request_reuses_inbound_reference() {
    let h = harness(DeployPolicy::Auto, ScanResult::default()).await;
    let ctx = h
        .orchestrator
        .run_from_reference(
            &WorkItemRef::review_request("acme/api", 17),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(!ctx.plan.iter().any(|s| s == "open_review"));
    assert!(h.reviews.opened().await.is_empty());
    let comments = h.reviews.comments().await;
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0.number, 17);
    assert!(h.issues.comments().await.is_empty());
}

#[tokio::test]
async fn test_step_failure_aborts_and_reports() {
    let h = harness_with(
        DeployPolicy::Auto,
        ScanResult::default(),
        Some(Arc::new(MarkerlessGenerator)),
    )
    .await;
    let err = h
        .orchestrator
        .run_from_reference(&WorkItemRef::issue("PROJ-8"), RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.step(), Some("synthetic_tests"));
    let PipelineError::StepFailed { run_id, .. } = &err else {
        panic!("expected a step failure");
    };

    let history = h.events.history(run_id).await;
    let failed: Vec<_> = history
        .iter()
        .filter(|e| e.kind == EventKind::TaskFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].step.as_deref(), Some("synthetic_tests"));
    assert_eq!(history.last().map(|e| e.kind), Some(EventKind::RunFailed));
    assert!(!history.iter().any(|e| e.step.as_deref() == Some("publish")));
    assert!(h.publisher.deployments().await.is_empty());

    // Best-effort failure report still reached the issue.
    let comments = h.issues.comments().await;
    assert_eq!(comments.len(), 1);
    assert!(comments[0].1.contains("failed"));
}

#[tokio::test]
async fn test_worker_routes_pipeline_failure_to_retry() {
    let h = harness_with(
        DeployPolicy::Auto,
        ScanResult::default(),
        Some(Arc::new(MarkerlessGenerator)),
    )
    .await;
    h.stores
        .queue
        .enqueue(EnqueueRequest::new(WorkItemRef::issue("PROJ-9")).with_max_attempts(2))
        .await
        .unwrap();

    let TickOutcome::Processed(item) = h.worker.tick().await.unwrap() else {
        panic!("expected a processed item");
    };
    assert_eq!(item.status, QueueStatus::Retryable);
    assert!(item.last_error.unwrap().contains("synthetic_tests"));
    assert!(item.lease_owner.is_none());
    // Backoff keeps it ineligible for now.
    assert!(matches!(h.worker.tick().await.unwrap(), TickOutcome::Idle));
}
