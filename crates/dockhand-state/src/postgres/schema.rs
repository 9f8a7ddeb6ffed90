//! Table and index definitions, applied idempotently on first use.

use sqlx::PgPool;
use tracing::debug;

use crate::storage_traits::StorageResult;

pub const RUN_QUEUE_TABLE: &str = "dockhand_run_queue";
pub const SCHEDULES_TABLE: &str = "dockhand_schedules";
pub const APPROVALS_TABLE: &str = "dockhand_approvals";

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS dockhand_run_queue (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        issue_id TEXT,
        repo TEXT,
        review_number BIGINT,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        lease_owner TEXT,
        lease_expires_at TIMESTAMPTZ,
        timeout_at TIMESTAMPTZ,
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        cancel_reason TEXT,
        options JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        run_id TEXT,
        result_status TEXT,
        last_error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_dockhand_run_queue_eligible
        ON dockhand_run_queue (status, next_attempt_at)",
    "CREATE TABLE IF NOT EXISTS dockhand_schedules (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        cron TEXT NOT NULL,
        enabled BOOLEAN NOT NULL,
        target JSONB NOT NULL,
        next_run_at TIMESTAMPTZ NOT NULL,
        last_run_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_dockhand_schedules_due
        ON dockhand_schedules (enabled, next_run_at)",
    "CREATE TABLE IF NOT EXISTS dockhand_approvals (
        id UUID PRIMARY KEY,
        status TEXT NOT NULL,
        run_id TEXT NOT NULL,
        queue_item_id UUID NOT NULL,
        kind TEXT NOT NULL,
        issue_id TEXT,
        repo TEXT,
        review_number BIGINT,
        reason TEXT NOT NULL,
        correlation_id TEXT,
        requested_at TIMESTAMPTZ NOT NULL,
        approved_by TEXT,
        approved_at TIMESTAMPTZ,
        rejected_by TEXT,
        rejected_at TIMESTAMPTZ,
        rejection_reason TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uniq_dockhand_approvals_pending_run
        ON dockhand_approvals (run_id) WHERE status = 'pending'",
];

/// Create all tables and indexes if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> StorageResult<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("dockhand postgres schema ready");
    Ok(())
}
