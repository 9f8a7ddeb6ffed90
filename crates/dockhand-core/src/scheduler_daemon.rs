//! Scheduler daemon: moves due schedules onto the run queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dockhand_state::{RunQueue, RunQueueItem, RunSchedule, ScheduleStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::metrics::METRICS;
use crate::obs;

/// A schedule that fired and the item it enqueued.
#[derive(Debug, Clone)]
pub struct FiredSchedule {
    pub schedule: RunSchedule,
    pub item: RunQueueItem,
}

/// Polls the schedule store and enqueues due targets.
#[derive(Clone)]
pub struct SchedulerDaemon {
    schedules: Arc<dyn ScheduleStore>,
    queue: Arc<dyn RunQueue>,
    poll_interval: Duration,
}

impl std::fmt::Debug for SchedulerDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerDaemon")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl SchedulerDaemon {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        queue: Arc<dyn RunQueue>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            schedules,
            queue,
            poll_interval,
        }
    }

    /// Claim every due schedule and enqueue its target.
    ///
    /// A failed enqueue is logged and skipped; the schedule has already
    /// advanced and fires again at its next match.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<FiredSchedule>> {
        let due = self.schedules.claim_due(now).await?;
        let mut fired = Vec::with_capacity(due.len());
        for schedule in due {
            match self.queue.enqueue(schedule.target.clone()).await {
                Ok(item) => {
                    METRICS.inc_schedules_fired();
                    obs::emit_schedule_fired(
                        &schedule.id.to_string(),
                        &schedule.name,
                        &item.id.to_string(),
                    );
                    fired.push(FiredSchedule { schedule, item });
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "enqueue for due schedule failed")
                }
            }
        }
        Ok(fired)
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler daemon started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "scheduler tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler daemon stopped");
    }
}
