//! Structured observability hooks for the Dockhand run lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans via `run_span`
//! - Emission functions for queue, pipeline, approval and scheduler events
//!
//! Every event carries an `event` field so log pipelines can filter on it.

use tracing::{info, warn};

/// Span tagged with the run_id, for instrumenting a run's future.
///
/// ```ignore
/// orchestrator.execute(ctx).instrument(run_span("run-12345")).await
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("dockhand.run", run_id = %run_id)
}

/// Emit event: a worker claimed a queue item.
pub fn emit_run_claimed(item_id: &str, worker_id: &str, attempt: u32) {
    info!(
        event = "queue.claimed",
        item_id = %item_id,
        worker_id = %worker_id,
        attempt = attempt,
    );
}

/// Emit event: a pipeline run finished with its final status.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Emit event: a pipeline step failed (warning level).
pub fn emit_step_failed(run_id: &str, step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "task.failed", run_id = %run_id, step = %step, error = %error);
}

/// Emit event: an approval request was opened for a run.
pub fn emit_approval_created(approval_id: &str, run_id: &str) {
    info!(event = "approval.created", approval_id = %approval_id, run_id = %run_id);
}

/// Emit event: a schedule fired and enqueued a run.
pub fn emit_schedule_fired(schedule_id: &str, name: &str, item_id: &str) {
    info!(
        event = "schedule.fired",
        schedule_id = %schedule_id,
        name = %name,
        item_id = %item_id,
    );
}

/// Emit event: the reaper resolved a running item.
pub fn emit_reaped(item_id: &str, status: &str, reason: &str) {
    warn!(
        event = "queue.reaped",
        item_id = %item_id,
        status = %status,
        reason = %reason,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _entered = span.enter();
    }
}
