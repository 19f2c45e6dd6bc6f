//! Task supervisor for queued units of work.
//!
//! A unit of work is a typed [`Job`] addressed by name and a JSON payload
//! ([`JobRequest`]), so the same request can run inside the current runtime
//! or be shipped to a freshly spawned OS process that rebuilds its own
//! dependency graph. Two strategies implement [`TaskSupervisor`]:
//!
//! - [`InProcessSupervisor`] spawns the job on the current tokio runtime.
//!   Errors and panics are caught and logged; `submit` never observes them.
//! - [`ProcessSupervisor`] runs the job in a child process, so even a fatal
//!   crash stays contained. A watcher awaits every child and logs
//!   non-zero exits.
//!
//! Both share the same shutdown ladder: polite termination, a bounded wait,
//! forced termination, a short second wait, then an unconditional clear of
//! the tracking set with a [`ShutdownReport`]. Shutdown is idempotent.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use herald_supervisor::{InProcessSupervisor, JobRegistry, ShutdownConfig, TaskSupervisor};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry: JobRegistry<()> = JobRegistry::new();
//! let supervisor = InProcessSupervisor::new(registry, (), ShutdownConfig::default());
//!
//! let report = supervisor.shutdown(Duration::from_secs(5)).await;
//! assert_eq!(report.unconfirmed, 0);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod child;
pub mod error;
pub mod in_process;
pub mod job;
#[cfg(unix)]
pub mod process;
pub mod shutdown;
#[cfg(unix)]
pub mod signals;
mod supervisor;

pub use error::{Result, SupervisorError};
pub use in_process::InProcessSupervisor;
pub use job::{Job, JobRegistry, JobRequest};
#[cfg(unix)]
pub use process::{ChildCommand, ProcessSupervisor};
pub use shutdown::{ShutdownConfig, ShutdownReport};
#[cfg(unix)]
pub use signals::SignalHandler;
pub use supervisor::{TaskId, TaskSupervisor};

/// Default time granted to units after a polite termination request.
pub const DEFAULT_SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default time granted to units after forced termination.
pub const DEFAULT_KILL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);
