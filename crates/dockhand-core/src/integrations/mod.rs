//! Collaborator capability traits.
//!
//! The orchestrator talks to the outside world only through these traits.
//! Each has an in-memory variant in [`memory`] for offline and dry-run
//! execution, and the shell has a real process-backed implementation in
//! [`shell`]. Collaborator methods return `anyhow::Result`: they sit at the
//! external I/O boundary and their failures are reported, not matched on.

pub mod memory;
pub mod shell;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::resolver::{ResolvedTarget, TargetResolver};
use crate::work_item::{
    CommandReport, DeploymentResult, GeneratedChange, PublishedArtifact, ReviewRef, ScanResult,
    WorkItem,
};

pub use memory::{
    InMemoryIssueTracker, InMemoryPublisher, InMemoryReviewSystem, InMemoryTicketing,
    NoopShellExecutor, TemplateCodeGenerator, IMPLEMENTATION_MARKER,
};
pub use shell::{ProcessShellExecutor, ShellConfig};

/// Issue-tracker tickets.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_work_item(&self, issue_id: &str) -> anyhow::Result<WorkItem>;

    async fn comment(&self, issue_id: &str, body: &str) -> anyhow::Result<()>;
}

/// Code-review requests.
#[async_trait]
pub trait ReviewSystem: Send + Sync {
    async fn fetch_review_work_item(&self, repo: &str, number: u64) -> anyhow::Result<WorkItem>;

    /// Open a review request carrying the generated change.
    async fn open_review(
        &self,
        item: &WorkItem,
        change: &GeneratedChange,
    ) -> anyhow::Result<ReviewRef>;

    async fn post_comment(&self, review: &ReviewRef, body: &str) -> anyhow::Result<()>;
}

/// Artifact registry and hosted deployments.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(
        &self,
        run_id: &str,
        item: &WorkItem,
        change: &GeneratedChange,
    ) -> anyhow::Result<PublishedArtifact>;

    async fn deploy(
        &self,
        artifact: &PublishedArtifact,
        environment: &str,
    ) -> anyhow::Result<DeploymentResult>;

    async fn scan_image(&self, artifact: &PublishedArtifact) -> anyhow::Result<ScanResult>;
}

/// External service-desk tickets keyed by correlation id.
#[async_trait]
pub trait TicketingSystem: Send + Sync {
    async fn append_note(&self, correlation_id: &str, note: &str) -> anyhow::Result<()>;
}

/// Produces the implementation for a work item.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, item: &WorkItem) -> anyhow::Result<GeneratedChange>;
}

/// Local workspace operations.
///
/// When `prepare_workspace` yields no workspace the orchestrator skips every
/// local step for the run.
#[async_trait]
pub trait ShellExecutor: Send + Sync {
    async fn prepare_workspace(
        &self,
        _run_id: &str,
        _item: &WorkItem,
    ) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Deployment targets available in the workspace for an environment.
    async fn probe_targets(
        &self,
        _workspace: &Path,
        _environment: &str,
        _image: &str,
    ) -> anyhow::Result<Vec<ResolvedTarget>> {
        Ok(Vec::new())
    }

    async fn run_build(&self, workspace: &Path) -> anyhow::Result<CommandReport>;

    async fn run_tests(&self, workspace: &Path) -> anyhow::Result<CommandReport>;

    async fn deploy_to_cluster(
        &self,
        workspace: &Path,
        target: &ResolvedTarget,
    ) -> anyhow::Result<CommandReport>;

    /// Run the target's validate command; `None` if it has none.
    async fn validate_cluster(
        &self,
        workspace: &Path,
        target: &ResolvedTarget,
    ) -> anyhow::Result<Option<CommandReport>>;
}

/// The full collaborator set handed to the orchestrator.
#[derive(Clone)]
pub struct Integrations {
    pub issues: Arc<dyn IssueTracker>,
    pub reviews: Arc<dyn ReviewSystem>,
    pub publisher: Arc<dyn ArtifactPublisher>,
    pub ticketing: Arc<dyn TicketingSystem>,
    pub generator: Arc<dyn CodeGenerator>,
    pub shell: Arc<dyn ShellExecutor>,
}

impl std::fmt::Debug for Integrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrations").finish_non_exhaustive()
    }
}

impl Integrations {
    /// In-memory collaborators only; nothing leaves the process.
    pub fn offline() -> Self {
        Self {
            issues: Arc::new(InMemoryIssueTracker::default()),
            reviews: Arc::new(InMemoryReviewSystem::default()),
            publisher: Arc::new(InMemoryPublisher::default()),
            ticketing: Arc::new(InMemoryTicketing::default()),
            generator: Arc::new(TemplateCodeGenerator),
            shell: Arc::new(NoopShellExecutor),
        }
    }

    /// Offline collaborators, plus the process shell when the config enables
    /// local workspaces.
    pub fn for_agent(config: &AgentConfig) -> crate::Result<Self> {
        let integrations = Self::offline();
        if !config.local_workspace {
            return Ok(integrations);
        }
        let mut shell = ShellConfig::new(&config.workspace_root);
        shell.clone_url_template = config.clone_url_template.clone();
        let resolver = TargetResolver::new(config.resolver_config()?);
        Ok(integrations.with_shell(Arc::new(ProcessShellExecutor::new(shell, resolver))))
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ArtifactPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn ShellExecutor>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_issues(mut self, issues: Arc<dyn IssueTracker>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_reviews(mut self, reviews: Arc<dyn ReviewSystem>) -> Self {
        self.reviews = reviews;
        self
    }

    pub fn with_ticketing(mut self, ticketing: Arc<dyn TicketingSystem>) -> Self {
        self.ticketing = ticketing;
        self
    }
}
