//! Shared harness for dockhand-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockhand_core::dockhand_state::{
    open_stores, BackoffPolicy, ClaimOptions, StoreBackend, Stores,
};
use dockhand_core::integrations::{
    InMemoryIssueTracker, InMemoryPublisher, InMemoryReviewSystem, InMemoryTicketing,
};
use dockhand_core::work_item::{GeneratedChange, GeneratedFile};
use dockhand_core::{
    ApprovalGate, CodeGenerator, DeployPolicy, EventBus, Integrations, Orchestrator,
    OrchestratorConfig, ScanResult, WorkItem, Worker, WorkerConfig,
};
use tempfile::TempDir;

pub const WORKER_ID: &str = "worker-test";

/// File-backed stores, in-memory collaborators and a worker wired together.
pub struct Harness {
    pub dir: TempDir,
    pub stores: Stores,
    pub events: Arc<EventBus>,
    pub issues: Arc<InMemoryIssueTracker>,
    pub reviews: Arc<InMemoryReviewSystem>,
    pub publisher: Arc<InMemoryPublisher>,
    pub ticketing: Arc<InMemoryTicketing>,
    pub orchestrator: Orchestrator,
    pub gate: ApprovalGate,
    pub worker: Worker,
}

pub async fn harness(policy: DeployPolicy, scan: ScanResult) -> Harness {
    harness_with(policy, scan, None).await
}

pub async fn harness_with(
    policy: DeployPolicy,
    scan: ScanResult,
    generator: Option<Arc<dyn CodeGenerator>>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let stores = open_stores(&StoreBackend::File {
        state_dir: dir.path().to_path_buf(),
    })
    .await
    .unwrap();

    let events = Arc::new(EventBus::default());
    let issues = Arc::new(InMemoryIssueTracker::default());
    let reviews = Arc::new(InMemoryReviewSystem::default());
    let publisher = Arc::new(InMemoryPublisher::default().with_scan(scan));
    let ticketing = Arc::new(InMemoryTicketing::default());

    let mut integrations = Integrations::offline()
        .with_issues(issues.clone())
        .with_reviews(reviews.clone())
        .with_publisher(publisher.clone())
        .with_ticketing(ticketing.clone());
    if let Some(generator) = generator {
        integrations = integrations.with_generator(generator);
    }

    let orchestrator = Orchestrator::new(
        integrations,
        events.clone(),
        OrchestratorConfig {
            deploy_policy: policy,
            local_workspace: false,
        },
    );
    let gate = ApprovalGate::new(stores.approvals.clone(), stores.queue.clone());
    let worker = Worker::new(
        stores.queue.clone(),
        gate.clone(),
        orchestrator.clone(),
        WorkerConfig {
            worker_id: WORKER_ID.to_string(),
            claim: ClaimOptions::for_worker(WORKER_ID, chrono::Duration::seconds(30)),
            backoff: BackoffPolicy::from_millis(1_000, 10_000),
            poll_interval: Duration::from_millis(10),
        },
    );

    Harness {
        dir,
        stores,
        events,
        issues,
        reviews,
        publisher,
        ticketing,
        orchestrator,
        gate,
        worker,
    }
}

/// Generator whose output lacks the implementation marker.
pub struct MarkerlessGenerator;

#[async_trait]
impl CodeGenerator for MarkerlessGenerator {
    async fn generate(&self, item: &WorkItem) -> anyhow::Result<GeneratedChange> {
        Ok(GeneratedChange {
            summary: format!("draft for {}", item.title),
            files: vec![GeneratedFile {
                path: "draft.md".into(),
                contents: "TODO".into(),
            }],
        })
    }
}

pub fn high_finding() -> ScanResult {
    ScanResult {
        high: 1,
        ..Default::default()
    }
}
