//! Dockhand CLI
//!
//! The `dockhand` command drives the delivery agent: foreground pipeline
//! runs, the durable run queue, approvals, cron schedules and the worker and
//! scheduler loops.
//!
//! ## Commands
//!
//! - `run`: Execute the pipeline for a work item in the foreground
//! - `enqueue`: Put a work item on the run queue
//! - `queue`: Inspect, cancel, retry and reap queue items
//! - `approvals`: Review pending approval requests
//! - `schedules`: Manage cron schedules
//! - `worker` / `scheduler`: Run the background loops in this process
//! - `targets`: Preview deployment target resolution
//! - `cron`: Preview the firing times of a cron expression

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, Level};
use uuid::Uuid;

use dockhand_core::resolver::TargetSource;
use dockhand_core::{
    init_tracing, status_message, Agent, AgentConfig, DeployPolicy, TargetResolver, TickOutcome,
};
use dockhand_state::{
    ApprovalStatus, CronExpr, EnqueueRequest, NewSchedule, QueueStatus, RunOptions, RunQueueItem,
    RunSchedule, ScheduleUpdate, WorkItemRef, DEFAULT_MAX_ATTEMPTS,
};

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dockhand delivery agent", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides applied on top of the `DOCKHAND_*` environment.
#[derive(Args, Debug, Default)]
struct StoreArgs {
    /// State directory for the file backend
    #[arg(long, global = true, env = "DOCKHAND_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Postgres URL; takes precedence over --state-dir
    #[arg(long, global = true, env = "DOCKHAND_DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Production deployment policy (auto or approval)
    #[arg(long, global = true, env = "DOCKHAND_DEPLOY_POLICY")]
    deploy_policy: Option<DeployPolicy>,

    /// Lease owner name used by `worker`
    #[arg(long, global = true, env = "DOCKHAND_WORKER_ID")]
    worker_id: Option<String>,
}

impl StoreArgs {
    fn apply(self, mut config: AgentConfig) -> Result<AgentConfig> {
        if let Some(dir) = self.state_dir {
            config.state_dir = dir;
        }
        if let Some(url) = self.database_url {
            config.database_url = Some(url);
        }
        if let Some(policy) = self.deploy_policy {
            config.deploy_policy = policy;
        }
        if let Some(worker_id) = self.worker_id {
            config.worker_id = worker_id;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a work item in the foreground
    Run {
        #[command(flatten)]
        target: ReferenceArgs,

        /// Service-desk ticket to report back to
        #[arg(long)]
        correlation_id: Option<String>,

        /// Print the run's event history
        #[arg(long)]
        events: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Put a work item on the run queue
    Enqueue {
        #[command(flatten)]
        target: ReferenceArgs,

        /// Attempts before the item fails for good
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,

        /// Service-desk ticket to report back to
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Inspect and manage the run queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Review approval requests
    Approvals {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Manage cron schedules
    Schedules {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Process the run queue until interrupted
    Worker {
        /// Process at most one item and exit
        #[arg(long)]
        once: bool,
    },

    /// Fire due schedules until interrupted
    Scheduler {
        /// Fire what is due now and exit
        #[arg(long)]
        once: bool,
    },

    /// Deployment target resolution
    Targets {
        #[command(subcommand)]
        action: TargetsAction,
    },

    /// Show the next firing times of a cron expression (UTC)
    Cron {
        /// Five-field cron expression, e.g. "0 2 * * 1-5"
        expr: String,

        /// Number of firing times to show
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// Start point (RFC 3339); defaults to now
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queue items, oldest first
    List {
        /// Only show items in this status
        #[arg(long)]
        status: Option<QueueStatus>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show one queue item
    Show {
        id: Uuid,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Cancel an item (advisory while it is running)
    Cancel {
        id: Uuid,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Reopen a finished item with a fresh attempt budget
    Retry { id: Uuid },

    /// Resolve running items whose lease or timeout lapsed
    Reap,
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List approval requests, oldest first
    List {
        /// Only show requests in this status
        #[arg(long)]
        status: Option<ApprovalStatus>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show one approval request
    Show {
        id: Uuid,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Approve a pending request and re-enqueue its run
    Approve {
        id: Uuid,

        /// Who signs off
        #[arg(long, env = "DOCKHAND_ACTOR")]
        actor: String,
    },

    /// Reject a pending request
    Reject {
        id: Uuid,

        /// Who rejects
        #[arg(long, env = "DOCKHAND_ACTOR")]
        actor: String,

        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Create a schedule
    Create {
        #[arg(long)]
        name: String,

        /// Five-field cron expression (UTC)
        #[arg(long)]
        cron: String,

        #[command(flatten)]
        target: ReferenceArgs,

        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,

        #[arg(long)]
        correlation_id: Option<String>,

        /// Create the schedule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List schedules
    List {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show one schedule
    Show {
        id: Uuid,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Change a schedule's name, cron expression or target
    Update {
        id: Uuid,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        cron: Option<String>,

        #[command(flatten)]
        target: OptionalReferenceArgs,

        #[arg(long)]
        max_attempts: Option<u32>,

        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Enable a schedule; its next run is recomputed from now
    Enable { id: Uuid },

    /// Disable a schedule; its next run is frozen
    Disable { id: Uuid },

    /// Delete a schedule
    Delete { id: Uuid },
}

#[derive(Subcommand)]
enum TargetsAction {
    /// Resolve deployment targets for an environment
    Resolve {
        /// Environment name (e.g. dev, prod)
        #[arg(long)]
        env: String,

        /// Workspace to probe for deployment manifests
        #[arg(long)]
        root: Option<PathBuf>,

        /// Image reference substituted into the commands
        #[arg(long, default_value = "dockhand:local")]
        image: String,

        /// JSON file of explicit targets
        #[arg(long, env = "DOCKHAND_TARGETS_FILE")]
        targets_file: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

/// Exactly one of `--issue` or `--review`.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
struct ReferenceArgs {
    /// Issue-tracker ticket id
    #[arg(long)]
    issue: Option<String>,

    /// Review request as REPO#NUMBER
    #[arg(long, value_name = "REPO#NUMBER")]
    review: Option<String>,
}

impl ReferenceArgs {
    fn reference(&self) -> Result<WorkItemRef> {
        match (&self.issue, &self.review) {
            (Some(id), None) => Ok(WorkItemRef::issue(id.clone())),
            (None, Some(review)) => parse_review(review),
            _ => anyhow::bail!("pass exactly one of --issue or --review"),
        }
    }
}

/// At most one of `--issue` or `--review`.
#[derive(Args, Debug, Clone)]
#[group(required = false, multiple = false)]
struct OptionalReferenceArgs {
    /// New target issue id
    #[arg(long)]
    issue: Option<String>,

    /// New target review request as REPO#NUMBER
    #[arg(long, value_name = "REPO#NUMBER")]
    review: Option<String>,
}

impl OptionalReferenceArgs {
    fn reference(&self) -> Result<Option<WorkItemRef>> {
        match (&self.issue, &self.review) {
            (Some(id), _) => Ok(Some(WorkItemRef::issue(id.clone()))),
            (None, Some(review)) => parse_review(review).map(Some),
            (None, None) => Ok(None),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Parse `owner/repo#12` (or the `owner/repo!12` display form).
fn parse_review(spec: &str) -> Result<WorkItemRef> {
    let (repo, number) = spec
        .rsplit_once(|c| c == '#' || c == '!')
        .with_context(|| format!("review '{}' is not in REPO#NUMBER form", spec))?;
    if repo.trim().is_empty() {
        anyhow::bail!("review '{}' has no repository", spec);
    }
    let number: u64 = number
        .parse()
        .with_context(|| format!("review number '{}' is not a positive integer", number))?;
    Ok(WorkItemRef::review_request(repo, number))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = cli
        .store
        .apply(AgentConfig::from_env().context("Invalid DOCKHAND_* configuration")?)?;

    match cli.command {
        Commands::Cron { expr, count, after } => {
            cmd_cron(&expr, count, after.unwrap_or_else(Utc::now))
        }
        Commands::Targets { action } => match action {
            TargetsAction::Resolve {
                env,
                root,
                image,
                targets_file,
                format,
            } => {
                let mut config = config;
                if targets_file.is_some() {
                    config.targets_file = targets_file;
                }
                cmd_targets_resolve(&config, &env, root.as_deref(), &image, format)
            }
        },
        command => {
            let agent = Agent::open(config)
                .await
                .context("Failed to open Dockhand state")?;
            dispatch(&agent, command).await
        }
    }
}

async fn dispatch(agent: &Agent, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            target,
            correlation_id,
            events,
            format,
        } => cmd_run(agent, &target.reference()?, correlation_id, events, format).await,
        Commands::Enqueue {
            target,
            max_attempts,
            correlation_id,
        } => cmd_enqueue(agent, target.reference()?, max_attempts, correlation_id).await,
        Commands::Queue { action } => match action {
            QueueAction::List { status, format } => cmd_queue_list(agent, status, format).await,
            QueueAction::Show { id, format } => cmd_queue_show(agent, id, format).await,
            QueueAction::Cancel { id, reason } => {
                cmd_queue_cancel(agent, id, reason.as_deref()).await
            }
            QueueAction::Retry { id } => cmd_queue_retry(agent, id).await,
            QueueAction::Reap => cmd_queue_reap(agent).await,
        },
        Commands::Approvals { action } => match action {
            ApprovalAction::List { status, format } => {
                cmd_approvals_list(agent, status, format).await
            }
            ApprovalAction::Show { id, format } => cmd_approvals_show(agent, id, format).await,
            ApprovalAction::Approve { id, actor } => cmd_approve(agent, id, &actor).await,
            ApprovalAction::Reject { id, actor, reason } => {
                cmd_reject(agent, id, &actor, reason.as_deref()).await
            }
        },
        Commands::Schedules { action } => match action {
            ScheduleAction::Create {
                name,
                cron,
                target,
                max_attempts,
                correlation_id,
                disabled,
            } => {
                let request = enqueue_request(target.reference()?, max_attempts, correlation_id);
                cmd_schedule_create(agent, &name, &cron, request, !disabled).await
            }
            ScheduleAction::List { format } => cmd_schedule_list(agent, format).await,
            ScheduleAction::Show { id, format } => cmd_schedule_show(agent, id, format).await,
            ScheduleAction::Update {
                id,
                name,
                cron,
                target,
                max_attempts,
                correlation_id,
            } => {
                cmd_schedule_update(
                    agent,
                    id,
                    name,
                    cron,
                    target.reference()?,
                    max_attempts,
                    correlation_id,
                )
                .await
            }
            ScheduleAction::Enable { id } => cmd_schedule_set_enabled(agent, id, true).await,
            ScheduleAction::Disable { id } => cmd_schedule_set_enabled(agent, id, false).await,
            ScheduleAction::Delete { id } => cmd_schedule_delete(agent, id).await,
        },
        Commands::Worker { once } => cmd_worker(agent, once).await,
        Commands::Scheduler { once } => cmd_scheduler(agent, once).await,
        Commands::Targets { .. } | Commands::Cron { .. } => {
            anyhow::bail!("command does not use the state backend")
        }
    }
}

fn enqueue_request(
    reference: WorkItemRef,
    max_attempts: u32,
    correlation_id: Option<String>,
) -> EnqueueRequest {
    EnqueueRequest::new(reference)
        .with_max_attempts(max_attempts)
        .with_options(RunOptions {
            correlation_id,
            ..RunOptions::default()
        })
}

/// Run the pipeline in the foreground
async fn cmd_run(
    agent: &Agent,
    reference: &WorkItemRef,
    correlation_id: Option<String>,
    show_events: bool,
    format: OutputFormat,
) -> Result<()> {
    let options = RunOptions {
        correlation_id,
        ..RunOptions::default()
    };
    let ctx = agent
        .orchestrator
        .run_from_reference(reference, options)
        .await
        .with_context(|| format!("Run for {} failed", reference))?;

    match format {
        OutputFormat::Json => print_json(&ctx)?,
        OutputFormat::Text => {
            println!("{}", status_message(&ctx));
            println!("Steps: {}", ctx.plan.join(" -> "));
        }
    }

    if show_events {
        for event in agent.events.history(&ctx.run_id).await {
            println!(
                "{:>3} {} {}{}",
                event.seq,
                event.timestamp.format("%H:%M:%S%.3f"),
                event.kind.as_str(),
                event
                    .step
                    .as_deref()
                    .map(|s| format!(" [{}]", s))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

/// Put a work item on the run queue
async fn cmd_enqueue(
    agent: &Agent,
    reference: WorkItemRef,
    max_attempts: u32,
    correlation_id: Option<String>,
) -> Result<()> {
    let item = agent
        .stores
        .queue
        .enqueue(enqueue_request(reference, max_attempts, correlation_id))
        .await
        .context("Failed to enqueue run")?;

    println!("Enqueued {} for {}", item.id, item.reference);
    Ok(())
}

fn print_queue_line(item: &RunQueueItem) {
    println!(
        "{}  {:<9}  {}/{}  {}  next={}",
        item.id,
        item.status.as_str(),
        item.attempts,
        item.max_attempts,
        item.reference,
        item.next_attempt_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

/// List queue items
async fn cmd_queue_list(
    agent: &Agent,
    status: Option<QueueStatus>,
    format: OutputFormat,
) -> Result<()> {
    let items = agent.stores.queue.list(status).await?;
    if format == OutputFormat::Json {
        return print_json(&items);
    }

    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for item in &items {
        print_queue_line(item);
    }
    Ok(())
}

/// Show one queue item
async fn cmd_queue_show(agent: &Agent, id: Uuid, format: OutputFormat) -> Result<()> {
    let item = agent
        .stores
        .queue
        .get(id)
        .await
        .with_context(|| format!("Queue item {} not found", id))?;
    if format == OutputFormat::Json {
        return print_json(&item);
    }

    print_queue_line(&item);
    if let Some(owner) = &item.lease_owner {
        println!("Lease:    {} until {:?}", owner, item.lease_expires_at);
    }
    if item.cancel_requested {
        println!(
            "Cancel:   requested ({})",
            item.cancel_reason.as_deref().unwrap_or("no reason")
        );
    }
    if let Some(run_id) = &item.run_id {
        println!(
            "Run:      {} ({})",
            run_id,
            item.result_status.as_deref().unwrap_or("unknown")
        );
    }
    if let Some(error) = &item.last_error {
        println!("Error:    {}", error);
    }
    if let Some(correlation) = &item.options.correlation_id {
        println!("Ticket:   {}", correlation);
    }
    if item.options.approval_override {
        println!("Approved: {:?}", item.options.approval_request_id);
    }
    Ok(())
}

/// Cancel a queue item
async fn cmd_queue_cancel(agent: &Agent, id: Uuid, reason: Option<&str>) -> Result<()> {
    let item = agent
        .stores
        .queue
        .cancel(id, reason)
        .await
        .with_context(|| format!("Failed to cancel {}", id))?;

    if item.status == QueueStatus::Running {
        println!("Cancel requested for running item {}", item.id);
    } else {
        println!("Item {} is {}", item.id, item.status);
    }
    Ok(())
}

/// Reopen a queue item
async fn cmd_queue_retry(agent: &Agent, id: Uuid) -> Result<()> {
    let item = agent
        .stores
        .queue
        .retry(id)
        .await
        .with_context(|| format!("Failed to retry {}", id))?;

    println!("Requeued {} ({} attempts allowed)", item.id, item.max_attempts);
    Ok(())
}

/// Reap lapsed running items
async fn cmd_queue_reap(agent: &Agent) -> Result<()> {
    let reaped = agent
        .stores
        .queue
        .reap_expired_running(Utc::now(), &agent.config.backoff())
        .await?;

    if reaped.is_empty() {
        println!("Nothing to reap.");
    }
    for item in &reaped {
        println!(
            "Reaped {} -> {} ({})",
            item.id,
            item.status,
            item.last_error
                .as_deref()
                .or(item.cancel_reason.as_deref())
                .unwrap_or("")
        );
    }
    Ok(())
}

/// List approval requests
async fn cmd_approvals_list(
    agent: &Agent,
    status: Option<ApprovalStatus>,
    format: OutputFormat,
) -> Result<()> {
    let requests = agent.gate.list(status).await?;
    if format == OutputFormat::Json {
        return print_json(&requests);
    }

    if requests.is_empty() {
        println!("No approval requests.");
        return Ok(());
    }
    for request in &requests {
        println!(
            "{}  {:<8}  {}  {}  {}",
            request.id,
            request.status.as_str(),
            request.run_id,
            request.reference,
            request.reason
        );
    }
    Ok(())
}

/// Show one approval request
async fn cmd_approvals_show(agent: &Agent, id: Uuid, format: OutputFormat) -> Result<()> {
    let request = agent
        .gate
        .get(id)
        .await
        .with_context(|| format!("Approval request {} not found", id))?;
    if format == OutputFormat::Json {
        return print_json(&request);
    }

    println!("Request:   {}", request.id);
    println!("Status:    {}", request.status);
    println!("Run:       {} (queue item {})", request.run_id, request.queue_item_id);
    println!("Reference: {}", request.reference);
    println!("Reason:    {}", request.reason);
    println!(
        "Requested: {}",
        request.requested_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(actor) = &request.approved_by {
        println!("Approved by {}", actor);
    }
    if let Some(actor) = &request.rejected_by {
        println!(
            "Rejected by {}: {}",
            actor,
            request.rejection_reason.as_deref().unwrap_or("no reason")
        );
    }
    Ok(())
}

/// Approve a pending request
async fn cmd_approve(agent: &Agent, id: Uuid, actor: &str) -> Result<()> {
    let (request, item) = agent
        .gate
        .approve(id, actor)
        .await
        .with_context(|| format!("Failed to approve {}", id))?;

    println!(
        "Approved {} by {}; re-enqueued {} as {}",
        request.id, actor, request.reference, item.id
    );
    Ok(())
}

/// Reject a pending request
async fn cmd_reject(agent: &Agent, id: Uuid, actor: &str, reason: Option<&str>) -> Result<()> {
    let request = agent
        .gate
        .reject(id, actor, reason)
        .await
        .with_context(|| format!("Failed to reject {}", id))?;

    println!("Rejected {} by {}", request.id, actor);
    Ok(())
}

fn print_schedule_line(schedule: &RunSchedule) {
    println!(
        "{}  {:<8}  {:<16}  '{}'  {}  next={}",
        schedule.id,
        if schedule.enabled { "enabled" } else { "disabled" },
        schedule.name,
        schedule.cron,
        schedule.target.reference,
        schedule.next_run_at.format("%Y-%m-%d %H:%M UTC")
    );
}

/// Create a schedule
async fn cmd_schedule_create(
    agent: &Agent,
    name: &str,
    cron: &str,
    target: EnqueueRequest,
    enabled: bool,
) -> Result<()> {
    let schedule = agent
        .stores
        .schedules
        .create(NewSchedule {
            name: name.to_string(),
            cron: cron.to_string(),
            enabled,
            target,
        })
        .await
        .with_context(|| format!("Failed to create schedule '{}'", name))?;

    println!("Created schedule {}", schedule.id);
    print_schedule_line(&schedule);
    Ok(())
}

/// List schedules
async fn cmd_schedule_list(agent: &Agent, format: OutputFormat) -> Result<()> {
    let schedules = agent.stores.schedules.list().await?;
    if format == OutputFormat::Json {
        return print_json(&schedules);
    }

    if schedules.is_empty() {
        println!("No schedules.");
        return Ok(());
    }
    for schedule in &schedules {
        print_schedule_line(schedule);
    }
    Ok(())
}

/// Show one schedule
async fn cmd_schedule_show(agent: &Agent, id: Uuid, format: OutputFormat) -> Result<()> {
    let schedule = agent
        .stores
        .schedules
        .get(id)
        .await
        .with_context(|| format!("Schedule {} not found", id))?;
    if format == OutputFormat::Json {
        return print_json(&schedule);
    }

    print_schedule_line(&schedule);
    if let Some(last) = schedule.last_run_at {
        println!("Last run: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Attempts: {}", schedule.target.max_attempts);
    Ok(())
}

/// Update a schedule
async fn cmd_schedule_update(
    agent: &Agent,
    id: Uuid,
    name: Option<String>,
    cron: Option<String>,
    reference: Option<WorkItemRef>,
    max_attempts: Option<u32>,
    correlation_id: Option<String>,
) -> Result<()> {
    let target = if reference.is_some() || max_attempts.is_some() || correlation_id.is_some() {
        let current = agent
            .stores
            .schedules
            .get(id)
            .await
            .with_context(|| format!("Schedule {} not found", id))?
            .target;
        let mut target = current;
        if let Some(reference) = reference {
            target.reference = reference;
        }
        if let Some(max_attempts) = max_attempts {
            target.max_attempts = max_attempts;
        }
        if correlation_id.is_some() {
            target.options.correlation_id = correlation_id;
        }
        Some(target)
    } else {
        None
    };

    let schedule = agent
        .stores
        .schedules
        .update(
            id,
            ScheduleUpdate {
                name,
                cron,
                enabled: None,
                target,
            },
        )
        .await
        .with_context(|| format!("Failed to update schedule {}", id))?;

    println!("Updated schedule {}", schedule.id);
    print_schedule_line(&schedule);
    Ok(())
}

/// Enable or disable a schedule
async fn cmd_schedule_set_enabled(agent: &Agent, id: Uuid, enabled: bool) -> Result<()> {
    let schedule = agent
        .stores
        .schedules
        .update(
            id,
            ScheduleUpdate {
                enabled: Some(enabled),
                ..ScheduleUpdate::default()
            },
        )
        .await
        .with_context(|| format!("Failed to update schedule {}", id))?;

    print_schedule_line(&schedule);
    Ok(())
}

/// Delete a schedule
async fn cmd_schedule_delete(agent: &Agent, id: Uuid) -> Result<()> {
    agent
        .stores
        .schedules
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete schedule {}", id))?;

    println!("Deleted schedule {}", id);
    Ok(())
}

/// Run the worker loop
async fn cmd_worker(agent: &Agent, once: bool) -> Result<()> {
    let worker = agent.worker();
    if once {
        match worker.tick().await? {
            TickOutcome::Idle => println!("No eligible run."),
            TickOutcome::Processed(item) => {
                println!(
                    "Processed {} -> {} ({})",
                    item.id,
                    item.status,
                    item.result_status
                        .as_deref()
                        .or(item.last_error.as_deref())
                        .unwrap_or("")
                );
            }
        }
        return Ok(());
    }

    worker.run(shutdown_on_ctrl_c()).await;
    Ok(())
}

/// Run the scheduler loop
async fn cmd_scheduler(agent: &Agent, once: bool) -> Result<()> {
    let scheduler = agent.scheduler();
    if once {
        let fired = scheduler.tick(Utc::now()).await?;
        if fired.is_empty() {
            println!("No schedules due.");
        }
        for f in &fired {
            println!(
                "Fired '{}' -> {} (next {})",
                f.schedule.name,
                f.item.id,
                f.schedule.next_run_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
        return Ok(());
    }

    scheduler.run(shutdown_on_ctrl_c()).await;
    Ok(())
}

/// Resolve deployment targets without deploying
fn cmd_targets_resolve(
    config: &AgentConfig,
    env: &str,
    root: Option<&Path>,
    image: &str,
    format: OutputFormat,
) -> Result<()> {
    let resolver = TargetResolver::new(config.resolver_config()?);
    let targets = resolver.resolve(root, env, image)?;
    if format == OutputFormat::Json {
        return print_json(&targets);
    }

    if targets.is_empty() {
        println!("No deployment targets for '{}'.", env);
        return Ok(());
    }
    for target in &targets {
        let source = match target.source {
            TargetSource::Explicit => "explicit",
            TargetSource::Detected => "detected",
            TargetSource::Legacy => "legacy",
        };
        let kind = target.kind.map(|k| k.as_str()).unwrap_or("legacy");
        println!("{} [{}] ({})", target.name, kind, source);
        println!("  deploy:   {}", target.deploy_command);
        if let Some(validate) = &target.validate_command {
            println!("  validate: {}", validate);
        }
    }
    Ok(())
}

/// Print upcoming firing times
fn cmd_cron(expr: &str, count: usize, after: DateTime<Utc>) -> Result<()> {
    let cron = CronExpr::parse(expr).with_context(|| format!("Invalid cron '{}'", expr))?;
    let mut at = after;
    for _ in 0..count {
        at = cron.next_after(at)?;
        println!("{}", at.format("%Y-%m-%d %H:%M UTC (%a)"));
    }
    Ok(())
}
