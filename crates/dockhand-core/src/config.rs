//! Agent configuration.
//!
//! Every setting has a default and can be overridden through a `DOCKHAND_*`
//! environment variable; the binaries layer their clap flags on top.

use std::path::PathBuf;

use dockhand_state::{BackoffPolicy, ClaimOptions, StoreBackend};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DockhandError, Result};
use crate::resolver::{LegacyCommands, ResolverConfig};

/// Whether production deployment needs a human sign-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployPolicy {
    /// Promote to prod automatically when the scan is clean.
    #[default]
    Auto,
    /// Always stop for approval before prod.
    Approval,
}

impl DeployPolicy {
    /// `true` when a run must stop for sign-off before prod. An approved
    /// re-run carries the override and is let through.
    pub fn requires_manual_approval(&self, approval_override: bool) -> bool {
        matches!(self, DeployPolicy::Approval) && !approval_override
    }
}

impl std::str::FromStr for DeployPolicy {
    type Err = DockhandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DeployPolicy::Auto),
            "approval" => Ok(DeployPolicy::Approval),
            other => Err(DockhandError::Config(format!(
                "unknown deploy policy '{other}' (expected auto or approval)"
            ))),
        }
    }
}

/// Runtime configuration shared by the CLI, the worker and the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// File backend state directory.
    pub state_dir: PathBuf,
    /// Postgres URL; when set it takes precedence over `state_dir`.
    pub database_url: Option<String>,
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub lease_ms: u64,
    pub run_timeout_ms: Option<u64>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub deploy_policy: DeployPolicy,
    /// Parent directory for local workspaces.
    pub workspace_root: PathBuf,
    /// Run the local prepare/build/test/deploy steps through the shell.
    pub local_workspace: bool,
    pub targets_file: Option<PathBuf>,
    pub project: String,
    pub legacy_deploy_command: Option<String>,
    pub legacy_validate_command: Option<String>,
    /// Clone URL with a `{repo}` placeholder, used to prepare workspaces.
    pub clone_url_template: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".dockhand"),
            database_url: None,
            worker_id: default_worker_id(),
            poll_interval_ms: 2_000,
            lease_ms: 60_000,
            run_timeout_ms: None,
            backoff_initial_ms: 30_000,
            backoff_max_ms: 30 * 60 * 1_000,
            deploy_policy: DeployPolicy::Auto,
            workspace_root: std::env::temp_dir().join("dockhand-workspaces"),
            local_workspace: false,
            targets_file: None,
            project: "dockhand".to_string(),
            legacy_deploy_command: None,
            legacy_validate_command: None,
            clone_url_template: None,
        }
    }
}

fn default_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

impl AgentConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup; unset or blank variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = var("DOCKHAND_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        config.database_url = var("DOCKHAND_DATABASE_URL");
        if let Some(worker_id) = var("DOCKHAND_WORKER_ID") {
            config.worker_id = worker_id;
        }
        if let Some(ms) = parse_ms(&var, "DOCKHAND_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = parse_ms(&var, "DOCKHAND_LEASE_MS")? {
            config.lease_ms = ms;
        }
        config.run_timeout_ms = parse_ms(&var, "DOCKHAND_RUN_TIMEOUT_MS")?;
        if let Some(ms) = parse_ms(&var, "DOCKHAND_BACKOFF_INITIAL_MS")? {
            config.backoff_initial_ms = ms;
        }
        if let Some(ms) = parse_ms(&var, "DOCKHAND_BACKOFF_MAX_MS")? {
            config.backoff_max_ms = ms;
        }
        if let Some(policy) = var("DOCKHAND_DEPLOY_POLICY") {
            config.deploy_policy = policy.parse()?;
        }
        if let Some(root) = var("DOCKHAND_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        config.local_workspace = var("DOCKHAND_LOCAL_WORKSPACE")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        config.targets_file = var("DOCKHAND_TARGETS_FILE").map(PathBuf::from);
        if let Some(project) = var("DOCKHAND_PROJECT") {
            config.project = project;
        }
        config.legacy_deploy_command = var("DOCKHAND_LEGACY_DEPLOY_COMMAND");
        config.legacy_validate_command = var("DOCKHAND_LEGACY_VALIDATE_COMMAND");
        config.clone_url_template = var("DOCKHAND_CLONE_URL_TEMPLATE");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_ms == 0 {
            return Err(DockhandError::Config("lease must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(DockhandError::Config("poll interval must be positive".into()));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(DockhandError::Config(format!(
                "initial backoff {}ms exceeds max backoff {}ms",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }

    pub fn store_backend(&self) -> StoreBackend {
        match &self.database_url {
            Some(url) => StoreBackend::Postgres {
                database_url: url.clone(),
            },
            None => StoreBackend::File {
                state_dir: self.state_dir.clone(),
            },
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(self.backoff_initial_ms, self.backoff_max_ms)
    }

    pub fn lease(&self) -> chrono::Duration {
        millis(self.lease_ms)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    /// Claim options stamping this worker's lease and optional run timeout.
    pub fn claim_options(&self) -> ClaimOptions {
        let options = ClaimOptions::for_worker(self.worker_id.clone(), self.lease());
        match self.run_timeout_ms {
            Some(ms) => options.with_run_timeout(millis(ms)),
            None => options,
        }
    }

    /// Resolver inputs, reading the targets file if one is configured.
    pub fn resolver_config(&self) -> Result<ResolverConfig> {
        let mut config = ResolverConfig::new(self.project.clone());
        if let Some(path) = &self.targets_file {
            config = config.with_targets(ResolverConfig::load_targets_file(path)?);
        }
        if let Some(deploy) = &self.legacy_deploy_command {
            config = config.with_legacy(LegacyCommands {
                deploy: deploy.clone(),
                validate: self.legacy_validate_command.clone(),
            });
        }
        Ok(config)
    }
}

fn parse_ms<F>(var: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|_| {
                DockhandError::Config(format!("{key} must be a number of milliseconds, got '{raw}'"))
            })
        })
        .transpose()
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms.min(i64::MAX as u64) as i64)
}
