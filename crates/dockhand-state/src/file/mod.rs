//! Single-writer file backend.
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/run_queue.json
//! <state_dir>/schedules.json
//! <state_dir>/approvals.json
//! ```
//!
//! Every mutation rewrites the owning document atomically. Nothing here
//! locks across processes: run exactly one writer per state directory, or use
//! the Postgres backend.

mod approvals;
mod document;
mod queue;
mod schedules;

pub use approvals::FileApprovalStore;
pub use queue::FileRunQueue;
pub use schedules::FileScheduleStore;

pub const RUN_QUEUE_FILE: &str = "run_queue.json";
pub const SCHEDULES_FILE: &str = "schedules.json";
pub const APPROVALS_FILE: &str = "approvals.json";
