//! `dockhandd`: runs the worker and the scheduler daemon side by side until
//! interrupted. All configuration comes from `DOCKHAND_*` variables.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, Level};

use dockhand_core::metrics::METRICS;
use dockhand_core::{init_tracing_with, Agent, AgentConfig, LogFormat};

const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

fn log_level() -> Level {
    std::env::var("DOCKHAND_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(Level::INFO)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing_with(LogFormat::from_env(), log_level());

    let config = AgentConfig::from_env().context("Invalid DOCKHAND_* configuration")?;
    info!(
        worker_id = %config.worker_id,
        deploy_policy = ?config.deploy_policy,
        local_workspace = config.local_workspace,
        "dockhandd starting"
    );
    let agent = Agent::open(config)
        .await
        .context("Failed to open Dockhand state")?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = tx.send(true);
        }
    });

    serve(&agent, rx, METRICS_FLUSH_INTERVAL).await;
    info!("dockhandd stopped");
    Ok(())
}

/// Drive the worker, the scheduler and periodic metric flushes until
/// `shutdown` flips.
async fn serve(agent: &Agent, shutdown: watch::Receiver<bool>, flush_every: Duration) {
    let worker = agent.worker();
    let scheduler = agent.scheduler();

    futures::join!(
        worker.run(shutdown.clone()),
        scheduler.run(shutdown.clone()),
        flush_metrics(shutdown, flush_every),
    );
    METRICS.flush();
}

async fn flush_metrics(mut shutdown: watch::Receiver<bool>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => METRICS.flush(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockhand_core::dockhand_state::{EnqueueRequest, QueueStatus, WorkItemRef};

    #[tokio::test]
    async fn test_serve_drains_queue_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            state_dir: dir.path().to_path_buf(),
            poll_interval_ms: 10,
            ..AgentConfig::default()
        };
        let agent = Agent::open(config).await.unwrap();
        let item = agent
            .stores
            .queue
            .enqueue(EnqueueRequest::new(WorkItemRef::issue("D-1")))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let queue = agent.stores.queue.clone();
        let stopper = tokio::spawn(async move {
            for _ in 0..200 {
                if queue.get(item.id).await.unwrap().status == QueueStatus::Succeeded {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tx.send(true).unwrap();
        });

        serve(&agent, rx, Duration::from_millis(20)).await;
        stopper.await.unwrap();

        let finished = agent.stores.queue.get(item.id).await.unwrap();
        assert_eq!(finished.status, QueueStatus::Succeeded);
        assert_eq!(finished.result_status.as_deref(), Some("succeeded"));
    }

    #[test]
    fn test_log_level_defaults_to_info() {
        if std::env::var("DOCKHAND_LOG_LEVEL").is_err() {
            assert_eq!(log_level(), Level::INFO);
        }
    }
}
