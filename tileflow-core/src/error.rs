//! Error taxonomy for the scheduler core.
//!
//! Store violations are typed so the transport can map them to status codes
//! without string matching. Executor failures never appear here: they are
//! recorded on the job as FAILED and swallowed by the worker.

use crate::types::JobState;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Workflow is unknown, or owned by a different user than the caller.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Rejected write that would violate the job state machine. Indicates a
    /// scheduler bug, not a caller error.
    #[error("illegal job state transition: {from:?} -> {to:?}")]
    IllegalTransition { from: JobState, to: JobState },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `stop()` has been called; no new work is accepted.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// True for the errors that mean "the caller asked about something that
    /// does not exist (for them)".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::Store(StoreError::WorkflowNotFound(_))
                | SchedulerError::Store(StoreError::JobNotFound(_))
        )
    }
}
