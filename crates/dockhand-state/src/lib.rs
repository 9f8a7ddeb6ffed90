//! Dockhand-State: durable stores for the Dockhand delivery agent
//!
//! This crate is the persistence layer behind the worker, the scheduler
//! daemon and the operator CLI.
//!
//! ## Key Components
//!
//! - `RunQueue`: lease-based run queue with retry/backoff, cancel and reaping
//! - `ScheduleStore`: cron schedules with atomic due-claiming
//! - `ApprovalStore`: approval requests, at most one pending per run
//! - `cron`: five-field cron parser and next-run computation
//! - `file`: single-writer JSON document backend
//! - `postgres`: multi-writer backend using `FOR UPDATE SKIP LOCKED`

pub mod backoff;
pub mod cron;
mod error;
pub mod file;
mod lifecycle;
pub mod model;
pub mod postgres;
pub mod storage_traits;

use std::path::PathBuf;
use std::sync::Arc;

pub use backoff::{
    BackoffPolicy, FailureDecision, DEFAULT_CANCEL_REASON, LEASE_EXPIRED_REASON,
    RUN_TIMEOUT_REASON,
};
pub use cron::{next_run_after, CronError, CronExpr};
pub use error::StorageError;
pub use file::{FileApprovalStore, FileRunQueue, FileScheduleStore};
pub use model::{
    ApprovalRequest, ApprovalStatus, ClaimOptions, EnqueueRequest, NewApproval, NewSchedule,
    QueueStatus, RunOptions, RunOutcome, RunQueueItem, RunSchedule, ScheduleUpdate, WorkItemKind,
    WorkItemRef, DEFAULT_MAX_ATTEMPTS,
};
pub use postgres::{PgApprovalStore, PgHandle, PgRunQueue, PgScheduleStore};
pub use storage_traits::{ApprovalStore, RunQueue, ScheduleStore, StorageResult};

/// Where the stores live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// JSON documents under a state directory (single writer).
    File { state_dir: PathBuf },
    /// Postgres tables (any number of writers).
    Postgres { database_url: String },
}

/// The three stores, sharing one backend.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn RunQueue>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub approvals: Arc<dyn ApprovalStore>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Open all stores on the given backend.
pub async fn open_stores(backend: &StoreBackend) -> StorageResult<Stores> {
    match backend {
        StoreBackend::File { state_dir } => {
            tracing::info!(state_dir = %state_dir.display(), "using file state backend");
            Ok(Stores {
                queue: Arc::new(FileRunQueue::new(state_dir)?),
                schedules: Arc::new(FileScheduleStore::new(state_dir)?),
                approvals: Arc::new(FileApprovalStore::new(state_dir)?),
            })
        }
        StoreBackend::Postgres { database_url } => {
            tracing::info!("using postgres state backend");
            let handle = PgHandle::connect(database_url).await?;
            Ok(Stores {
                queue: Arc::new(PgRunQueue::new(handle.clone())),
                schedules: Arc::new(PgScheduleStore::new(handle.clone())),
                approvals: Arc::new(PgApprovalStore::new(handle)),
            })
        }
    }
}
