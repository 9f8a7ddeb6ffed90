//! Postgres backend.
//!
//! Every mutation runs in a short transaction that loads the owning row with
//! a row lock, applies the shared lifecycle transition and writes the whole
//! row back. Batch claims and reaps lock with `SKIP LOCKED`, so concurrent
//! workers never wait on or double-claim each other's rows. Single-row
//! transitions (heartbeat, success, failure, cancel, retry) wait for the lock.

mod approvals;
mod queue;
mod schedules;
pub mod schema;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::OnceCell;

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

pub use approvals::PgApprovalStore;
pub use queue::PgRunQueue;
pub use schedules::PgScheduleStore;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Shared pool plus one-time schema initialisation.
#[derive(Clone)]
pub struct PgHandle {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgHandle {
    /// Connect to `database_url`. The schema is created lazily on first use.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pool with the schema guaranteed to exist.
    pub(crate) async fn ready(&self) -> StorageResult<&PgPool> {
        self.schema_ready
            .get_or_try_init(|| schema::ensure_schema(&self.pool))
            .await?;
        Ok(&self.pool)
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

pub(crate) fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn from_db_int(value: i32, column: &str) -> StorageResult<u32> {
    u32::try_from(value)
        .map_err(|_| StorageError::Database(format!("negative value {value} in column {column}")))
}
