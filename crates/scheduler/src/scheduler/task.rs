use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::deferred::Deferred;
use crate::pool::PoolError;

/// Error type for scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `add_task` was called after shutdown began.
    #[error("scheduler is shutting down")]
    ShuttingDown,
    /// Malformed task descriptor.
    #[error("invalid task: {0}")]
    InvalidTask(String),
    /// The worker pool refused the work.
    #[error("worker pool unavailable: {0}")]
    PoolUnavailable(#[from] PoolError),
}

/// Outcome of one callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Re-arm the task after its repeat delay.
    Continue,
    /// Retire the task; it will not run again.
    Terminate,
}

/// Callback invoked on each run of a task, producing a deferred outcome.
///
/// A callback may block and return an already-fulfilled value, or return
/// immediately and fulfill the producer side later from any thread.
pub type TaskCallback = Arc<dyn Fn() -> Deferred<TaskOutcome> + Send + Sync>;

/// A recurring unit of work: a name, two delays, and a callback.
#[derive(Clone)]
pub struct Task {
    /// Human-readable name, used only for diagnostics.
    pub name: String,
    /// Time from submission to the first callback invocation.
    pub start_delay: Duration,
    /// Time from completion of each callback to the next invocation.
    /// Zero means "as soon as possible, but yielding".
    pub repeat_delay: Duration,
    /// Produces the deferred outcome of each invocation.
    pub callback: TaskCallback,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        start_delay: Duration,
        repeat_delay: Duration,
        callback: impl Fn() -> Deferred<TaskOutcome> + Send + Sync + 'static,
    ) -> Task {
        Task {
            name: name.into(),
            start_delay,
            repeat_delay,
            callback: Arc::new(callback),
        }
    }

    /// Check the descriptor is well formed. Delays cannot be negative by
    /// construction, so only an empty name is rejected.
    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if self.name.is_empty() {
            return Err(SchedulerError::InvalidTask(
                "task name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("start_delay", &self.start_delay)
            .field("repeat_delay", &self.repeat_delay)
            .finish()
    }
}
