//! Error types for task submission and execution.

use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Errors surfaced to callers of the supervisor.
///
/// Failures inside a running job are never returned through `submit`; they
/// are logged by the strategy that ran the job.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No job with this name is registered.
    #[error("unknown job: {name}")]
    UnknownJob {
        /// Requested job name
        name: String,
    },

    /// Job payload could not be encoded or decoded.
    #[error("invalid payload for job {name}: {source}")]
    Payload {
        /// Job name
        name: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Child process could not be started.
    #[error("failed to spawn child process: {0}")]
    Spawn(#[from] std::io::Error),

    /// Shutdown has begun; no further work is accepted.
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl SupervisorError {
    /// Creates an unknown job error.
    pub fn unknown_job(name: impl Into<String>) -> Self {
        Self::UnknownJob { name: name.into() }
    }

    /// Creates a payload error.
    pub fn payload(name: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Payload { name: name.into(), source }
    }
}
