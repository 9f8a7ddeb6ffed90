//! Error taxonomy for dockhand-core.

use dockhand_state::StorageError;

use crate::resolver::ResolveError;

/// Errors raised while executing a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A step failed; the remainder of the run was aborted.
    #[error("run {run_id}: step {step} failed: {message}")]
    StepFailed {
        run_id: String,
        step: String,
        message: String,
    },

    /// A collaborator failed outside of any step (e.g. fetching the work item).
    #[error("integration error: {0}")]
    Integration(String),
}

impl PipelineError {
    /// Name of the failed step, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            PipelineError::StepFailed { step, .. } => Some(step),
            PipelineError::Integration(_) => None,
        }
    }
}

/// Dockhand domain errors.
#[derive(Debug, thiserror::Error)]
pub enum DockhandError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("target resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for Dockhand domain operations.
pub type Result<T> = std::result::Result<T, DockhandError>;
