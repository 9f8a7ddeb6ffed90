//! In-memory collaborators for offline and dry-run execution.
//!
//! They record what the orchestrator asked of them so callers (and tests)
//! can inspect the interaction afterwards. Each record keeps only the latest
//! [`RECORD_LIMIT`] entries, so a long-running daemon on these collaborators
//! stays bounded.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dockhand_state::WorkItemRef;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{
    ArtifactPublisher, CodeGenerator, IssueTracker, ReviewSystem, ShellExecutor, TicketingSystem,
};
use crate::resolver::ResolvedTarget;
use crate::work_item::{
    CommandReport, DeploymentResult, GeneratedChange, GeneratedFile, PublishedArtifact, ReviewRef,
    ScanResult, WorkItem,
};

/// Marker every generated implementation must carry for the synthetic tests
/// to pass.
pub const IMPLEMENTATION_MARKER: &str = "DOCKHAND-IMPLEMENTATION";

/// Entries kept per record; older ones are dropped first.
pub const RECORD_LIMIT: usize = 256;

#[derive(Debug)]
struct Recorded<T> {
    entries: VecDeque<T>,
}

impl<T> Default for Recorded<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T: Clone> Recorded<T> {
    fn push(&mut self, entry: T) {
        if self.entries.len() == RECORD_LIMIT {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// Issue tracker backed by a map; unknown ids yield a placeholder item.
#[derive(Debug, Default)]
pub struct InMemoryIssueTracker {
    items: Mutex<HashMap<String, WorkItem>>,
    comments: Mutex<Recorded<(String, String)>>,
}

impl InMemoryIssueTracker {
    pub async fn insert(&self, item: WorkItem) {
        if let Some(id) = item.issue_id().map(str::to_string) {
            self.items.lock().await.insert(id, item);
        }
    }

    /// `(issue_id, body)` pairs in posting order.
    pub async fn comments(&self) -> Vec<(String, String)> {
        self.comments.lock().await.snapshot()
    }
}

#[async_trait]
impl IssueTracker for InMemoryIssueTracker {
    async fn fetch_work_item(&self, issue_id: &str) -> anyhow::Result<WorkItem> {
        let items = self.items.lock().await;
        Ok(items.get(issue_id).cloned().unwrap_or_else(|| {
            WorkItem::new(WorkItemRef::issue(issue_id), format!("Issue {issue_id}"))
        }))
    }

    async fn comment(&self, issue_id: &str, body: &str) -> anyhow::Result<()> {
        self.comments
            .lock()
            .await
            .push((issue_id.to_string(), body.to_string()));
        Ok(())
    }
}

/// Review system that numbers opened reviews sequentially from 1.
#[derive(Debug, Default)]
pub struct InMemoryReviewSystem {
    next_number: AtomicU64,
    opened: Mutex<Recorded<ReviewRef>>,
    comments: Mutex<Recorded<(ReviewRef, String)>>,
}

impl InMemoryReviewSystem {
    pub async fn opened(&self) -> Vec<ReviewRef> {
        self.opened.lock().await.snapshot()
    }

    pub async fn comments(&self) -> Vec<(ReviewRef, String)> {
        self.comments.lock().await.snapshot()
    }
}

#[async_trait]
impl ReviewSystem for InMemoryReviewSystem {
    async fn fetch_review_work_item(&self, repo: &str, number: u64) -> anyhow::Result<WorkItem> {
        Ok(WorkItem::new(
            WorkItemRef::review_request(repo, number),
            format!("Review {repo}!{number}"),
        ))
    }

    async fn open_review(
        &self,
        item: &WorkItem,
        _change: &GeneratedChange,
    ) -> anyhow::Result<ReviewRef> {
        let review = ReviewRef {
            repo: item.repo.clone().unwrap_or_else(|| "local/dockhand".to_string()),
            number: self.next_number.fetch_add(1, Ordering::Relaxed) + 1,
            url: None,
        };
        self.opened.lock().await.push(review.clone());
        Ok(review)
    }

    async fn post_comment(&self, review: &ReviewRef, body: &str) -> anyhow::Result<()> {
        self.comments
            .lock()
            .await
            .push((review.clone(), body.to_string()));
        Ok(())
    }
}

/// Registry stand-in with a configurable scan result.
#[derive(Debug)]
pub struct InMemoryPublisher {
    registry: String,
    scan: ScanResult,
    deployments: Mutex<Recorded<DeploymentResult>>,
}

impl Default for InMemoryPublisher {
    fn default() -> Self {
        Self::new("registry.local")
    }
}

impl InMemoryPublisher {
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            scan: ScanResult::default(),
            deployments: Mutex::default(),
        }
    }

    /// Every scan reports these counts.
    pub fn with_scan(mut self, scan: ScanResult) -> Self {
        self.scan = scan;
        self
    }

    pub async fn deployments(&self) -> Vec<DeploymentResult> {
        self.deployments.lock().await.snapshot()
    }
}

#[async_trait]
impl ArtifactPublisher for InMemoryPublisher {
    async fn publish(
        &self,
        run_id: &str,
        item: &WorkItem,
        change: &GeneratedChange,
    ) -> anyhow::Result<PublishedArtifact> {
        let mut hasher = Sha256::new();
        hasher.update(run_id.as_bytes());
        hasher.update(change.combined_output().as_bytes());
        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));

        let repo = item.repo.as_deref().unwrap_or("dockhand");
        Ok(PublishedArtifact {
            image: format!("{}/{}:{}", self.registry, repo, run_id),
            digest,
        })
    }

    async fn deploy(
        &self,
        artifact: &PublishedArtifact,
        environment: &str,
    ) -> anyhow::Result<DeploymentResult> {
        let result = DeploymentResult {
            environment: environment.to_string(),
            image: artifact.image.clone(),
            status: "deployed".to_string(),
            url: None,
            cluster_reports: Vec::new(),
            deployed_at: Utc::now(),
        };
        self.deployments.lock().await.push(result.clone());
        Ok(result)
    }

    async fn scan_image(&self, _artifact: &PublishedArtifact) -> anyhow::Result<ScanResult> {
        Ok(self.scan)
    }
}

/// Ticketing stand-in recording appended notes.
#[derive(Debug, Default)]
pub struct InMemoryTicketing {
    notes: Mutex<Recorded<(String, String)>>,
}

impl InMemoryTicketing {
    pub async fn notes(&self) -> Vec<(String, String)> {
        self.notes.lock().await.snapshot()
    }
}

#[async_trait]
impl TicketingSystem for InMemoryTicketing {
    async fn append_note(&self, correlation_id: &str, note: &str) -> anyhow::Result<()> {
        self.notes
            .lock()
            .await
            .push((correlation_id.to_string(), note.to_string()));
        Ok(())
    }
}

/// Deterministic generator: one markdown file describing the work item.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateCodeGenerator;

#[async_trait]
impl CodeGenerator for TemplateCodeGenerator {
    async fn generate(&self, item: &WorkItem) -> anyhow::Result<GeneratedChange> {
        let slug: String = item
            .reference
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let contents = format!(
            "<!-- {IMPLEMENTATION_MARKER} -->\n# {}\n\n{}\n",
            item.title, item.body
        );
        Ok(GeneratedChange {
            summary: format!("Implement {}", item.title),
            files: vec![GeneratedFile {
                path: format!("changes/{slug}.md"),
                contents,
            }],
        })
    }
}

/// Shell executor that never provides a workspace.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopShellExecutor;

#[async_trait]
impl ShellExecutor for NoopShellExecutor {
    async fn run_build(&self, _workspace: &Path) -> anyhow::Result<CommandReport> {
        Ok(CommandReport::synthetic("build", true, "skipped"))
    }

    async fn run_tests(&self, _workspace: &Path) -> anyhow::Result<CommandReport> {
        Ok(CommandReport::synthetic("test", true, "skipped"))
    }

    async fn deploy_to_cluster(
        &self,
        _workspace: &Path,
        target: &ResolvedTarget,
    ) -> anyhow::Result<CommandReport> {
        Ok(CommandReport::synthetic(
            format!("deploy:{}", target.name),
            true,
            "skipped",
        ))
    }

    async fn validate_cluster(
        &self,
        _workspace: &Path,
        _target: &ResolvedTarget,
    ) -> anyhow::Result<Option<CommandReport>> {
        Ok(None)
    }
}
