//! Error taxonomy for task submission and execution.
//!
//! Two channels carry failures. Contract violations (`AlreadyRunning`,
//! `Terminated`, `SuccessorAlreadySet`) are returned synchronously from the
//! submitting call and never reach listeners. Run failures travel as a
//! [`FailureCause`] through the asynchronous `on_failed` notification, and
//! surface to result-handle callers only via [`ResultHandle::outcome`].
//!
//! [`ResultHandle::outcome`]: crate::task::ResultHandle::outcome

use std::sync::Arc;

use thiserror::Error;

/// Why a run aborted, delivered to `on_failed` listeners.
///
/// Cloneable so one failure can fan out to every listener; the execution
/// source is therefore shared behind an `Arc`.
#[derive(Debug, Clone)]
pub enum FailureCause {
    /// `cancel()` was called, before or during the run.
    Cancelled,
    /// `request_stop()` was called and a step boundary honored it.
    StopRequested,
    /// The work step itself returned an error.
    Execution(Arc<anyhow::Error>),
}

impl FailureCause {
    pub(crate) fn from_work_error(err: anyhow::Error) -> Self {
        Self::Execution(Arc::new(err))
    }

    /// Whether this cause came from an explicit control call rather than the
    /// work step.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::StopRequested)
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::StopRequested => write!(f, "stop requested"),
            Self::Execution(err) => write!(f, "execution failure: {err}"),
        }
    }
}

/// Errors raised synchronously by submission and configuration calls, plus
/// the wrapped run failure surfaced by `ResultHandle::outcome`.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task instance already has a run in flight. A programmer error:
    /// the conflicting submission fails, the first run is untouched.
    #[error("task {task_id} is already running")]
    AlreadyRunning { task_id: String },

    /// The dispatcher has been shut down and no longer accepts work.
    #[error("dispatcher is shut down")]
    Terminated,

    /// `set_next` was called twice on the same pipeline stage.
    #[error("pipeline stage {task_id} already has a successor")]
    SuccessorAlreadySet { task_id: String },

    /// The run settled with a failure. Only produced by
    /// `ResultHandle::outcome`; `join()` degrades to the default instead.
    #[error("task {task_id} failed: {cause}")]
    Failed { task_id: String, cause: FailureCause },
}
