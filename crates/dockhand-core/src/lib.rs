//! Dockhand Core Library
//!
//! Orchestration layer of the Dockhand delivery agent: the pipeline that
//! turns a work item into a build/test/publish/deploy run, the worker that
//! feeds it from the run queue, the scheduler daemon, the approval gate and
//! the deployment target resolver.

pub mod agent;
pub mod approval_gate;
pub mod config;
pub mod error;
pub mod events;
pub mod integrations;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod resolver;
pub mod scheduler_daemon;
pub mod telemetry;
pub mod work_item;
pub mod worker;

pub use agent::Agent;
pub use approval_gate::ApprovalGate;
pub use config::{AgentConfig, DeployPolicy};
pub use error::{DockhandError, PipelineError, Result};
pub use events::{EventBus, EventKind, RunEvent};
pub use integrations::{
    ArtifactPublisher, CodeGenerator, Integrations, IssueTracker, ReviewSystem, ShellExecutor,
    TicketingSystem,
};
pub use pipeline::{
    plan_for, status_message, Orchestrator, OrchestratorConfig, PipelineStep,
    MANUAL_APPROVAL_NOTE,
};
pub use resolver::{
    ResolveError, ResolvedTarget, ResolverConfig, TargetKind, TargetResolver, TargetSpec,
};
pub use scheduler_daemon::{FiredSchedule, SchedulerDaemon};
pub use telemetry::{init_tracing, init_tracing_with, LogFormat};
pub use work_item::{AgentContext, AgentStatus, ScanResult, WorkItem};
pub use worker::{TickOutcome, Worker, WorkerConfig};

// Re-exported so binaries and tests need only this crate for the stores.
pub use dockhand_state;
