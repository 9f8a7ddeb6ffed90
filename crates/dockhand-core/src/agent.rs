//! Assembly of the stores, orchestrator and services from an [`AgentConfig`].

use std::sync::Arc;

use dockhand_state::{open_stores, Stores};

use crate::approval_gate::ApprovalGate;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::integrations::Integrations;
use crate::pipeline::{Orchestrator, OrchestratorConfig};
use crate::scheduler_daemon::SchedulerDaemon;
use crate::worker::{Worker, WorkerConfig};

/// Everything a Dockhand process needs, opened once.
#[derive(Debug, Clone)]
pub struct Agent {
    pub config: AgentConfig,
    pub stores: Stores,
    pub events: Arc<EventBus>,
    pub orchestrator: Orchestrator,
    pub gate: ApprovalGate,
}

impl Agent {
    /// Open the configured backend with the configured collaborators.
    pub async fn open(config: AgentConfig) -> Result<Self> {
        let integrations = Integrations::for_agent(&config)?;
        Self::with_integrations(config, integrations).await
    }

    pub async fn with_integrations(config: AgentConfig, integrations: Integrations) -> Result<Self> {
        let stores = open_stores(&config.store_backend()).await?;
        let events = Arc::new(EventBus::default());
        let orchestrator = Orchestrator::new(
            integrations,
            Arc::clone(&events),
            OrchestratorConfig {
                deploy_policy: config.deploy_policy,
                local_workspace: config.local_workspace,
            },
        );
        let gate = ApprovalGate::new(stores.approvals.clone(), stores.queue.clone());
        Ok(Self {
            config,
            stores,
            events,
            orchestrator,
            gate,
        })
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.stores.queue.clone(),
            self.gate.clone(),
            self.orchestrator.clone(),
            WorkerConfig::from_agent(&self.config),
        )
    }

    pub fn scheduler(&self) -> SchedulerDaemon {
        SchedulerDaemon::new(
            self.stores.schedules.clone(),
            self.stores.queue.clone(),
            self.config.poll_interval(),
        )
    }
}
