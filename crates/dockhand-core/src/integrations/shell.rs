//! Process-backed shell executor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::ShellExecutor;
use crate::resolver::{ResolvedTarget, TargetResolver};
use crate::work_item::{CommandReport, WorkItem};

/// Default ceiling for a single shell command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Settings for [`ProcessShellExecutor`].
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Workspaces are created as `<workspace_root>/<run_id>`.
    pub workspace_root: PathBuf,
    /// Clone URL with a `{repo}` placeholder; without one no workspace is
    /// prepared.
    pub clone_url_template: Option<String>,
    /// Overrides the detected build command.
    pub build_command: Option<String>,
    /// Overrides the detected test command.
    pub test_command: Option<String>,
    pub command_timeout: Duration,
}

impl ShellConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            clone_url_template: None,
            build_command: None,
            test_command: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Runs workspace commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ProcessShellExecutor {
    config: ShellConfig,
    resolver: TargetResolver,
}

impl ProcessShellExecutor {
    pub fn new(config: ShellConfig, resolver: TargetResolver) -> Self {
        Self { config, resolver }
    }

    async fn run(&self, name: &str, command: &str, cwd: &Path) -> anyhow::Result<CommandReport> {
        run_command(name, command, cwd, self.config.command_timeout).await
    }
}

/// Run `command` with `sh -c` in `cwd`, capturing output.
///
/// A non-zero exit is reported in the returned report, not as an error;
/// spawn failures and timeouts are errors.
pub async fn run_command(
    name: &str,
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> anyhow::Result<CommandReport> {
    if command.trim().is_empty() {
        anyhow::bail!("command {} is empty", name);
    }
    let mut process = Command::new("sh");
    process.arg("-c").arg(command);
    run_process(name, command, process, cwd, timeout).await
}

/// Run `program` with `args` directly, without a shell in between.
///
/// Arguments reach the program verbatim, so they may carry caller-supplied
/// values such as branch names.
pub async fn run_program(
    name: &str,
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> anyhow::Result<CommandReport> {
    let display = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    let mut process = Command::new(program);
    process.args(args);
    run_process(name, &display, process, cwd, timeout).await
}

async fn run_process(
    name: &str,
    display: &str,
    mut process: Command,
    cwd: &Path,
    timeout: Duration,
) -> anyhow::Result<CommandReport> {
    let command = display;
    debug!(name = %name, command = %command, cwd = %cwd.display(), "running command");
    let start = Instant::now();

    let child = process
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "command {} timed out after {} seconds",
                name,
                timeout.as_secs()
            )
        })??;

    Ok(CommandReport {
        name: name.to_string(),
        command: display.to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Build command for the project layout at `workspace`.
pub fn detect_build_command(workspace: &Path) -> Option<&'static str> {
    if workspace.join("Cargo.toml").is_file() {
        Some("cargo build --locked")
    } else if workspace.join("go.mod").is_file() {
        Some("go build ./...")
    } else if workspace.join("package.json").is_file() {
        Some("npm ci && npm run build --if-present")
    } else if workspace.join("pom.xml").is_file() {
        Some("mvn -B -DskipTests package")
    } else if workspace.join("pyproject.toml").is_file()
        || workspace.join("requirements.txt").is_file()
    {
        Some("python3 -m compileall -q .")
    } else {
        None
    }
}

/// Test command for the project layout at `workspace`.
pub fn detect_test_command(workspace: &Path) -> Option<&'static str> {
    if workspace.join("Cargo.toml").is_file() {
        Some("cargo test --locked")
    } else if workspace.join("go.mod").is_file() {
        Some("go test ./...")
    } else if workspace.join("package.json").is_file() {
        Some("npm test")
    } else if workspace.join("pom.xml").is_file() {
        Some("mvn -B test")
    } else if workspace.join("pyproject.toml").is_file()
        || workspace.join("requirements.txt").is_file()
    {
        Some("python3 -m pytest -q")
    } else {
        None
    }
}

fn workspace_dir_name(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ShellExecutor for ProcessShellExecutor {
    async fn prepare_workspace(
        &self,
        run_id: &str,
        item: &WorkItem,
    ) -> anyhow::Result<Option<PathBuf>> {
        let (Some(template), Some(repo)) = (&self.config.clone_url_template, &item.repo) else {
            debug!(run_id = %run_id, "no clone source, skipping local workspace");
            return Ok(None);
        };

        tokio::fs::create_dir_all(&self.config.workspace_root).await?;
        let dir = self.config.workspace_root.join(workspace_dir_name(run_id));
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }

        let url = template.replace("{repo}", repo);
        let dir_arg = dir.to_string_lossy().into_owned();
        let branch_arg = item.branch.as_ref().map(|b| format!("--branch={b}"));
        let mut args = vec!["clone", "--depth", "1"];
        if let Some(branch_arg) = &branch_arg {
            args.push(branch_arg);
        }
        args.extend(["--", url.as_str(), dir_arg.as_str()]);

        let report = run_program(
            "clone",
            "git",
            &args,
            &self.config.workspace_root,
            self.config.command_timeout,
        )
        .await?;
        if !report.passed() {
            anyhow::bail!("clone of {} failed: {}", repo, report.stderr.trim());
        }
        info!(run_id = %run_id, workspace = %dir.display(), "workspace prepared");
        Ok(Some(dir))
    }

    async fn probe_targets(
        &self,
        workspace: &Path,
        environment: &str,
        image: &str,
    ) -> anyhow::Result<Vec<ResolvedTarget>> {
        Ok(self.resolver.resolve(Some(workspace), environment, image)?)
    }

    async fn run_build(&self, workspace: &Path) -> anyhow::Result<CommandReport> {
        let command = self
            .config
            .build_command
            .as_deref()
            .or_else(|| detect_build_command(workspace));
        match command {
            Some(command) => self.run("build", command, workspace).await,
            None => Ok(CommandReport::synthetic(
                "build",
                true,
                "no build command detected",
            )),
        }
    }

    async fn run_tests(&self, workspace: &Path) -> anyhow::Result<CommandReport> {
        let command = self
            .config
            .test_command
            .as_deref()
            .or_else(|| detect_test_command(workspace));
        match command {
            Some(command) => self.run("test", command, workspace).await,
            None => Ok(CommandReport::synthetic(
                "test",
                true,
                "no test command detected",
            )),
        }
    }

    async fn deploy_to_cluster(
        &self,
        workspace: &Path,
        target: &ResolvedTarget,
    ) -> anyhow::Result<CommandReport> {
        self.run(
            &format!("deploy:{}", target.name),
            &target.deploy_command,
            workspace,
        )
        .await
    }

    async fn validate_cluster(
        &self,
        workspace: &Path,
        target: &ResolvedTarget,
    ) -> anyhow::Result<Option<CommandReport>> {
        match &target.validate_command {
            Some(command) => Ok(Some(
                self.run(&format!("validate:{}", target.name), command, workspace)
                    .await?,
            )),
            None => Ok(None),
        }
    }
}
