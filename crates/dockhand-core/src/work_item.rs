//! Work items and the per-run execution context.
//!
//! `AgentContext` is transient: it is built, mutated and returned by one
//! pipeline execution and never persisted. The run queue keeps only a
//! projection of it (run id and final status).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dockhand_state::{RunOptions, WorkItemRef};
use serde::{Deserialize, Serialize};

/// A unit of requested change, as fetched from the issue tracker or review
/// system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Where the item came from.
    pub reference: WorkItemRef,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Repository the change targets, when known.
    #[serde(default)]
    pub repo: Option<String>,
    /// Source branch (review requests) or base branch.
    #[serde(default)]
    pub branch: Option<String>,
}

impl WorkItem {
    pub fn new(reference: WorkItemRef, title: impl Into<String>) -> Self {
        let repo = match &reference {
            WorkItemRef::ReviewRequest { repo, .. } => Some(repo.clone()),
            WorkItemRef::Issue { .. } => None,
        };
        Self {
            reference,
            title: title.into(),
            body: String::new(),
            repo,
            branch: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Issue id, if this item is an issue.
    pub fn issue_id(&self) -> Option<&str> {
        match &self.reference {
            WorkItemRef::Issue { id } => Some(id),
            WorkItemRef::ReviewRequest { .. } => None,
        }
    }
}

/// Lifecycle of one pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    NeedsReview,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Succeeded => "succeeded",
            AgentStatus::Failed => "failed",
            AgentStatus::NeedsReview => "needs_review",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file produced by the code generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
}

/// Output of the generate step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedChange {
    pub summary: String,
    pub files: Vec<GeneratedFile>,
}

impl GeneratedChange {
    /// All generated contents concatenated, in file order.
    pub fn combined_output(&self) -> String {
        self.files
            .iter()
            .map(|f| f.contents.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Outcome of one command or synthetic check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReport {
    pub name: String,
    pub command: String,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandReport {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// Report for a check that ran in-process.
    pub fn synthetic(name: impl Into<String>, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: String::new(),
            exit_code: if passed { 0 } else { 1 },
            stdout: detail.into(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }
}

/// A review request opened (or reused) for the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRef {
    pub repo: String,
    pub number: u64,
    #[serde(default)]
    pub url: Option<String>,
}

/// Artifact pushed to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedArtifact {
    /// Image reference, e.g. `registry.local/acme/api:run-1`.
    pub image: String,
    /// `sha256:<hex>` digest of the published content.
    pub digest: String,
}

/// Result of deploying to one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub environment: String,
    pub image: String,
    pub status: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Local cluster deploy/validate reports, when a workspace was used.
    #[serde(default)]
    pub cluster_reports: Vec<CommandReport>,
    pub deployed_at: DateTime<Utc>,
}

/// Vulnerability counts from the image scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl ScanResult {
    /// One review note per blocking severity class with findings.
    pub fn review_notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.critical > 0 {
            notes.push(format!(
                "security scan reported {} critical vulnerabilit{}",
                self.critical,
                plural_y(self.critical)
            ));
        }
        if self.high > 0 {
            notes.push(format!(
                "security scan reported {} high vulnerabilit{}",
                self.high,
                plural_y(self.high)
            ));
        }
        notes
    }

    pub fn is_blocking(&self) -> bool {
        self.critical > 0 || self.high > 0
    }
}

fn plural_y(n: u32) -> &'static str {
    if n == 1 {
        "y"
    } else {
        "ies"
    }
}

/// Everything a run accumulates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub generated: Option<GeneratedChange>,
    pub test_report: Option<CommandReport>,
    pub workspace: Option<PathBuf>,
    pub build_report: Option<CommandReport>,
    pub local_test_report: Option<CommandReport>,
    pub review: Option<ReviewRef>,
    pub published: Option<PublishedArtifact>,
    pub scan: Option<ScanResult>,
    /// Deployment per environment name.
    pub deployments: BTreeMap<String, DeploymentResult>,
}

/// Per-execution state, exclusively owned by one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    pub run_id: String,
    pub work_item: WorkItem,
    pub status: AgentStatus,
    /// Ordered step names, fixed before the first step runs.
    pub plan: Vec<String>,
    pub artifacts: Artifacts,
    pub review_notes: Vec<String>,
    pub options: RunOptions,
    /// Error of the step that aborted the run.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentContext {
    pub fn new(run_id: impl Into<String>, work_item: WorkItem, options: RunOptions) -> Self {
        Self {
            run_id: run_id.into(),
            work_item,
            status: AgentStatus::Pending,
            plan: Vec::new(),
            artifacts: Artifacts::default(),
            review_notes: Vec::new(),
            options,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Review request the run reports to: the inbound one, or the one it
    /// opened.
    pub fn review(&self) -> Option<ReviewRef> {
        match &self.work_item.reference {
            WorkItemRef::ReviewRequest { repo, number } => Some(ReviewRef {
                repo: repo.clone(),
                number: *number,
                url: None,
            }),
            WorkItemRef::Issue { .. } => self.artifacts.review.clone(),
        }
    }

    pub fn has_note(&self, note: &str) -> bool {
        self.review_notes.iter().any(|n| n == note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_notes_only_for_blocking_severities() {
        let scan = ScanResult {
            critical: 0,
            high: 1,
            medium: 4,
            low: 9,
        };
        let notes = scan.review_notes();
        assert_eq!(notes, vec!["security scan reported 1 high vulnerability"]);
        assert!(scan.is_blocking());

        let clean = ScanResult {
            medium: 2,
            ..Default::default()
        };
        assert!(clean.review_notes().is_empty());
        assert!(!clean.is_blocking());
    }

    #[test]
    fn test_review_prefers_inbound_reference() {
        let ctx = AgentContext::new(
            "run-1",
            WorkItem::new(WorkItemRef::review_request("acme/api", 5), "fix"),
            RunOptions::default(),
        );
        assert_eq!(ctx.review().map(|r| r.number), Some(5));
        assert_eq!(ctx.work_item.repo.as_deref(), Some("acme/api"));

        let mut issue_ctx = AgentContext::new(
            "run-2",
            WorkItem::new(WorkItemRef::issue("PROJ-1"), "feature"),
            RunOptions::default(),
        );
        assert!(issue_ctx.review().is_none());
        issue_ctx.artifacts.review = Some(ReviewRef {
            repo: "acme/api".into(),
            number: 9,
            url: None,
        });
        assert_eq!(issue_ctx.review().map(|r| r.number), Some(9));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(AgentStatus::NeedsReview.as_str(), "needs_review");
        assert_eq!(
            serde_json::to_value(AgentStatus::NeedsReview).unwrap(),
            "needs_review"
        );
    }
}
