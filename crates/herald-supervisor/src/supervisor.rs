use std::{fmt, future::Future, pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::Result, job::JobRequest, shutdown::ShutdownReport};

/// Identifier assigned to every submitted unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generates a new random task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runs submitted jobs and shuts them down on request.
///
/// Implementations track every unit from submission until it exits or is
/// cleared by shutdown.
pub trait TaskSupervisor: Send + Sync {
    /// Starts a job without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::ShuttingDown` after shutdown began, or a
    /// strategy-specific error if the unit could not be started.
    fn submit(&self, request: JobRequest) -> Result<TaskId>;

    /// Number of units currently tracked.
    fn active(&self) -> usize;

    /// Terminates all tracked units.
    ///
    /// Polite termination is followed by up to `timeout` of waiting, then
    /// forced termination with a shorter wait of its own. Safe to call more
    /// than once; later calls find nothing to stop.
    fn shutdown(&self, timeout: Duration)
        -> Pin<Box<dyn Future<Output = ShutdownReport> + Send + '_>>;
}
