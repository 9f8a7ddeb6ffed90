//! Pipeline orchestrator.
//!
//! A run is a fixed, ordered list of [`PipelineStep`]s computed before the
//! first step executes. Every step goes through [`Orchestrator::run_step`],
//! which emits `task.started`, then `task.completed` or `task.failed`; a
//! failed step aborts the rest of the run.
//!
//! After the security scan the run either promotes to prod or stops in
//! `needs_review`. The notify step always runs last.

mod notify;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use chrono::Utc;
use dockhand_state::{RunOptions, WorkItemRef};
use serde_json::{json, Value};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::DeployPolicy;
use crate::error::PipelineError;
use crate::events::{EventBus, EventKind};
use crate::integrations::{Integrations, IMPLEMENTATION_MARKER};
use crate::obs;
use crate::work_item::{AgentContext, AgentStatus, CommandReport, DeploymentResult, WorkItem};

pub use notify::status_message;

/// Review note that asks the worker to open an approval request.
pub const MANUAL_APPROVAL_NOTE: &str = "manual approval required before production deployment";

/// Environment deployed before the scan.
pub const DEV_ENVIRONMENT: &str = "dev";
/// Environment deployed after a clean scan.
pub const PROD_ENVIRONMENT: &str = "prod";

/// Steps of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    Generate,
    SyntheticTests,
    PrepareWorkspace,
    LocalBuild,
    LocalTests,
    OpenReview,
    Publish,
    DeployDev,
    SecurityScan,
    DeployProd,
    Notify,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Generate => "generate",
            PipelineStep::SyntheticTests => "synthetic_tests",
            PipelineStep::PrepareWorkspace => "prepare_workspace",
            PipelineStep::LocalBuild => "local_build",
            PipelineStep::LocalTests => "local_tests",
            PipelineStep::OpenReview => "open_review",
            PipelineStep::Publish => "publish",
            PipelineStep::DeployDev => "deploy_dev",
            PipelineStep::SecurityScan => "security_scan",
            PipelineStep::DeployProd => "deploy_prod",
            PipelineStep::Notify => "notify",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered steps for a run.
///
/// Local steps appear only with a local workspace; `open_review` is dropped
/// when the work item already is a review request. `deploy_prod` is listed
/// but only runs when the scan/policy branch allows it.
pub fn plan_for(reference: &WorkItemRef, local_workspace: bool) -> Vec<PipelineStep> {
    let mut plan = vec![PipelineStep::Generate, PipelineStep::SyntheticTests];
    if local_workspace {
        plan.extend([
            PipelineStep::PrepareWorkspace,
            PipelineStep::LocalBuild,
            PipelineStep::LocalTests,
        ]);
    }
    if matches!(reference, WorkItemRef::Issue { .. }) {
        plan.push(PipelineStep::OpenReview);
    }
    plan.extend([
        PipelineStep::Publish,
        PipelineStep::DeployDev,
        PipelineStep::SecurityScan,
        PipelineStep::DeployProd,
        PipelineStep::Notify,
    ]);
    plan
}

/// Orchestrator settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorConfig {
    pub deploy_policy: DeployPolicy,
    /// Run the local workspace steps.
    pub local_workspace: bool,
}

/// Executes pipeline runs against a set of collaborators.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    integrations: Integrations,
    events: Arc<EventBus>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(integrations: Integrations, events: Arc<EventBus>, config: OrchestratorConfig) -> Self {
        Self {
            integrations,
            events,
            config,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Fetch the referenced work item and run the pipeline on it.
    pub async fn run_from_reference(
        &self,
        reference: &WorkItemRef,
        options: RunOptions,
    ) -> Result<AgentContext, PipelineError> {
        let item = match reference {
            WorkItemRef::Issue { id } => self.integrations.issues.fetch_work_item(id).await,
            WorkItemRef::ReviewRequest { repo, number } => {
                self.integrations
                    .reviews
                    .fetch_review_work_item(repo, *number)
                    .await
            }
        }
        .map_err(|e| PipelineError::Integration(format!("fetching {reference}: {e:#}")))?;

        self.run(item, options).await
    }

    /// Run the pipeline on an already fetched work item.
    pub async fn run(
        &self,
        item: WorkItem,
        options: RunOptions,
    ) -> Result<AgentContext, PipelineError> {
        let run_id = format!("run-{}", Uuid::new_v4().simple());
        let span = obs::run_span(&run_id);
        let mut ctx = AgentContext::new(run_id, item, options);
        self.execute(&mut ctx).instrument(span).await?;
        Ok(ctx)
    }

    async fn execute(&self, ctx: &mut AgentContext) -> Result<(), PipelineError> {
        let started = Instant::now();
        let plan = plan_for(&ctx.work_item.reference, self.config.local_workspace);
        ctx.plan = plan.iter().map(|s| s.as_str().to_string()).collect();
        ctx.status = AgentStatus::Running;

        self.publish(
            ctx,
            EventKind::RunStarted,
            None,
            json!({ "reference": ctx.work_item.reference, "plan": ctx.plan }),
        )
        .await;
        info!(reference = %ctx.work_item.reference, steps = plan.len(), "run started");

        let result = self.execute_plan(ctx, &plan).await;
        ctx.finished_at = Some(Utc::now());
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                self.publish(
                    ctx,
                    EventKind::RunCompleted,
                    None,
                    json!({ "status": ctx.status, "review_notes": ctx.review_notes }),
                )
                .await;
                obs::emit_run_finished(&ctx.run_id, ctx.status.as_str(), duration_ms);
                Ok(())
            }
            Err(err) => {
                ctx.status = AgentStatus::Failed;
                ctx.error = Some(err.to_string());
                // Best-effort failure report; the step error is what surfaces.
                if err.step() != Some(PipelineStep::Notify.as_str()) {
                    if let Err(notify_err) = self.run_step(ctx, PipelineStep::Notify).await {
                        warn!(error = %notify_err, "failure notification not delivered");
                    }
                }
                self.publish(
                    ctx,
                    EventKind::RunFailed,
                    None,
                    json!({ "step": err.step(), "error": err.to_string() }),
                )
                .await;
                obs::emit_run_finished(&ctx.run_id, ctx.status.as_str(), duration_ms);
                Err(err)
            }
        }
    }

    async fn execute_plan(
        &self,
        ctx: &mut AgentContext,
        plan: &[PipelineStep],
    ) -> Result<(), PipelineError> {
        for &step in plan {
            if step == PipelineStep::DeployProd {
                if self.stop_for_review(ctx).await {
                    continue;
                }
                self.run_step(ctx, step).await?;
                ctx.status = AgentStatus::Succeeded;
                continue;
            }
            self.run_step(ctx, step).await?;
        }
        Ok(())
    }

    /// Apply the scan/policy branch. Returns `true` if the run stops in
    /// `needs_review` instead of promoting to prod.
    async fn stop_for_review(&self, ctx: &mut AgentContext) -> bool {
        let scan = ctx.artifacts.scan.unwrap_or_default();
        let mut notes = scan.review_notes();
        if self
            .config
            .deploy_policy
            .requires_manual_approval(ctx.options.approval_override)
        {
            notes.push(MANUAL_APPROVAL_NOTE.to_string());
        }
        if notes.is_empty() {
            return false;
        }

        ctx.review_notes.extend(notes);
        ctx.status = AgentStatus::NeedsReview;
        self.publish(
            ctx,
            EventKind::ReviewRequested,
            None,
            json!({ "notes": ctx.review_notes, "scan": scan }),
        )
        .await;
        info!(notes = ctx.review_notes.len(), "run needs review");
        true
    }

    /// Execute one step with the uniform started/completed/failed contract.
    async fn run_step(
        &self,
        ctx: &mut AgentContext,
        step: PipelineStep,
    ) -> Result<(), PipelineError> {
        self.publish(ctx, EventKind::TaskStarted, Some(step), json!({}))
            .await;

        match self.dispatch(ctx, step).await {
            Ok(payload) => {
                self.publish(ctx, EventKind::TaskCompleted, Some(step), payload)
                    .await;
                Ok(())
            }
            Err(err) => {
                let message = format!("{err:#}");
                obs::emit_step_failed(&ctx.run_id, step.as_str(), &message);
                self.publish(
                    ctx,
                    EventKind::TaskFailed,
                    Some(step),
                    json!({ "error": message }),
                )
                .await;
                Err(PipelineError::StepFailed {
                    run_id: ctx.run_id.clone(),
                    step: step.as_str().to_string(),
                    message,
                })
            }
        }
    }

    async fn publish(
        &self,
        ctx: &AgentContext,
        kind: EventKind,
        step: Option<PipelineStep>,
        payload: Value,
    ) {
        self.events
            .publish(&ctx.run_id, kind, step.map(|s| s.as_str()), payload)
            .await;
    }

    async fn dispatch(&self, ctx: &mut AgentContext, step: PipelineStep) -> anyhow::Result<Value> {
        let it = &self.integrations;
        match step {
            PipelineStep::Generate => {
                let change = it.generator.generate(&ctx.work_item).await?;
                let payload = json!({ "summary": change.summary, "files": change.files.len() });
                ctx.artifacts.generated = Some(change);
                Ok(payload)
            }
            PipelineStep::SyntheticTests => {
                let change = ctx
                    .artifacts
                    .generated
                    .as_ref()
                    .context("no generated output to test")?;
                let passed = change.combined_output().contains(IMPLEMENTATION_MARKER);
                let report = CommandReport::synthetic(
                    "synthetic_tests",
                    passed,
                    format!("marker {IMPLEMENTATION_MARKER} present: {passed}"),
                );
                ctx.artifacts.test_report = Some(report);
                if !passed {
                    anyhow::bail!("generated output is missing the {IMPLEMENTATION_MARKER} marker");
                }
                Ok(json!({ "passed": true }))
            }
            PipelineStep::PrepareWorkspace => {
                let workspace = it
                    .shell
                    .prepare_workspace(&ctx.run_id, &ctx.work_item)
                    .await?;
                let payload = json!({ "workspace": workspace });
                ctx.artifacts.workspace = workspace;
                Ok(payload)
            }
            PipelineStep::LocalBuild => {
                let Some(workspace) = ctx.artifacts.workspace.clone() else {
                    return Ok(json!({ "skipped": true }));
                };
                let report = it.shell.run_build(&workspace).await?;
                ctx.artifacts.build_report = Some(report.clone());
                ensure_passed(&report)
            }
            PipelineStep::LocalTests => {
                let Some(workspace) = ctx.artifacts.workspace.clone() else {
                    return Ok(json!({ "skipped": true }));
                };
                let report = it.shell.run_tests(&workspace).await?;
                ctx.artifacts.local_test_report = Some(report.clone());
                ensure_passed(&report)
            }
            PipelineStep::OpenReview => {
                let change = ctx
                    .artifacts
                    .generated
                    .as_ref()
                    .context("no generated output to review")?;
                let review = it.reviews.open_review(&ctx.work_item, change).await?;
                let payload = json!({ "repo": review.repo, "number": review.number });
                ctx.artifacts.review = Some(review);
                Ok(payload)
            }
            PipelineStep::Publish => {
                let change = ctx
                    .artifacts
                    .generated
                    .as_ref()
                    .context("no generated output to publish")?;
                let artifact = it
                    .publisher
                    .publish(&ctx.run_id, &ctx.work_item, change)
                    .await?;
                let payload = json!({ "image": artifact.image, "digest": artifact.digest });
                ctx.artifacts.published = Some(artifact);
                Ok(payload)
            }
            PipelineStep::DeployDev => self.deploy(ctx, DEV_ENVIRONMENT).await,
            PipelineStep::SecurityScan => {
                let artifact = ctx
                    .artifacts
                    .published
                    .as_ref()
                    .context("no published artifact to scan")?;
                let scan = it.publisher.scan_image(artifact).await?;
                ctx.artifacts.scan = Some(scan);
                Ok(serde_json::to_value(scan)?)
            }
            PipelineStep::DeployProd => self.deploy(ctx, PROD_ENVIRONMENT).await,
            PipelineStep::Notify => self.notify(ctx).await,
        }
    }

    async fn deploy(&self, ctx: &mut AgentContext, environment: &str) -> anyhow::Result<Value> {
        let artifact = ctx
            .artifacts
            .published
            .clone()
            .context("no published artifact to deploy")?;
        let mut result: DeploymentResult = self
            .integrations
            .publisher
            .deploy(&artifact, environment)
            .await?;

        if let Some(workspace) = ctx.artifacts.workspace.clone() {
            let shell = &self.integrations.shell;
            let targets = shell
                .probe_targets(&workspace, environment, &artifact.image)
                .await?;
            for target in &targets {
                let report = shell.deploy_to_cluster(&workspace, target).await?;
                result.cluster_reports.push(report.clone());
                ensure_passed(&report)?;
                if let Some(report) = shell.validate_cluster(&workspace, target).await? {
                    result.cluster_reports.push(report.clone());
                    ensure_passed(&report)?;
                }
            }
        }

        let payload = json!({
            "environment": environment,
            "image": result.image,
            "status": result.status,
            "cluster_commands": result.cluster_reports.len(),
        });
        ctx.artifacts
            .deployments
            .insert(environment.to_string(), result);
        Ok(payload)
    }

    async fn notify(&self, ctx: &AgentContext) -> anyhow::Result<Value> {
        let message = status_message(ctx);
        let it = &self.integrations;
        let mut channels = Vec::new();

        if let Some(issue_id) = ctx.work_item.issue_id() {
            it.issues.comment(issue_id, &message).await?;
            channels.push("issue");
        }
        if let Some(review) = ctx.review() {
            it.reviews.post_comment(&review, &message).await?;
            channels.push("review");
        }
        if let Some(correlation_id) = &ctx.options.correlation_id {
            it.ticketing.append_note(correlation_id, &message).await?;
            channels.push("ticket");
        }
        Ok(json!({ "channels": channels }))
    }
}

fn ensure_passed(report: &CommandReport) -> anyhow::Result<Value> {
    if !report.passed() {
        let detail = report.stderr.trim();
        anyhow::bail!(
            "{} exited with code {}{}{}",
            report.name,
            report.exit_code,
            if detail.is_empty() { "" } else { ": " },
            detail
        );
    }
    Ok(json!({ "name": report.name, "duration_ms": report.duration_ms }))
}
