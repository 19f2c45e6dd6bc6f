//! Runs each job in its own OS process.
//!
//! The child is the same binary started with a hidden subcommand that
//! receives the job name and payload, rebuilds its dependencies from
//! configuration, and runs the job through [`crate::child::run_request`].
//! A crash in the child never reaches the parent.

use std::{
    collections::HashMap,
    ffi::OsString,
    future::Future,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{process::Command, sync::watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SupervisorError},
    job::JobRequest,
    shutdown::{stop_all, ShutdownConfig, ShutdownReport, Stoppable},
    supervisor::{TaskId, TaskSupervisor},
};

/// Environment variable carrying the task id into the child.
pub const TASK_ID_ENV: &str = "HERALD_TASK_ID";

/// Command line used to start a child for one job.
///
/// `--name <job> --payload <json>` is appended to the configured arguments.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ChildCommand {
    /// Starts children with an arbitrary program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), envs: Vec::new() }
    }

    /// Re-executes the running binary with the given subcommand.
    ///
    /// # Errors
    ///
    /// Returns error if the path of the current executable is unavailable.
    pub fn current_exe(subcommand: &str) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg(subcommand))
    }

    /// Appends a fixed argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for every child.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self, id: TaskId, request: &JobRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--name")
            .arg(&request.name)
            .arg("--payload")
            .arg(request.payload.to_string())
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(TASK_ID_ENV, id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(false);
        command
    }
}

struct ChildUnit {
    id: TaskId,
    name: String,
    pid: Pid,
    exited: watch::Receiver<bool>,
}

impl ChildUnit {
    fn signal(&self, signal: Signal) {
        // Reaped children must not be signalled; their pid may be reused.
        if *self.exited.borrow() {
            return;
        }
        if let Err(errno) = kill(self.pid, signal) {
            debug!(pid = self.pid.as_raw(), ?signal, %errno, "failed to signal child");
        }
    }
}

impl Stoppable for ChildUnit {
    fn has_exited(&mut self) -> bool {
        *self.exited.borrow()
    }

    fn terminate(&mut self) {
        self.signal(Signal::SIGTERM);
    }

    fn kill(&mut self) {
        self.signal(Signal::SIGKILL);
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            // A closed channel means the watcher is gone, which only happens
            // after the child was reaped.
            let _ = self.exited.wait_for(|exited| *exited).await;
        })
    }

    fn label(&self) -> String {
        format!("{}:{}:pid={}", self.name, self.id, self.pid)
    }
}

type ChildTable = Arc<Mutex<HashMap<TaskId, ChildUnit>>>;

fn lock(table: &ChildTable) -> MutexGuard<'_, HashMap<TaskId, ChildUnit>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Supervisor that isolates every job in a child process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    command: ChildCommand,
    config: ShutdownConfig,
    children: ChildTable,
    closed: Arc<AtomicBool>,
    shutdown_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor starting children with `command`.
    pub fn new(command: ChildCommand, config: ShutdownConfig) -> Self {
        Self {
            command,
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn shutdown_inner(&self, timeout: Duration) -> ShutdownReport {
        let _guard = self.shutdown_lock.lock().await;

        // Closed under the table lock, so no submit can insert after the drain.
        let units: Vec<ChildUnit> = {
            let mut children = lock(&self.children);
            self.closed.store(true, Ordering::SeqCst);
            children.drain().map(|(_, unit)| unit).collect()
        };
        if units.is_empty() {
            return ShutdownReport::default();
        }

        info!(
            children = units.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "stopping child processes"
        );
        let report = stop_all(units, timeout, self.config).await;
        report.log("child processes");
        report
    }
}

impl TaskSupervisor for ProcessSupervisor {
    fn submit(&self, request: JobRequest) -> Result<TaskId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        let id = TaskId::new();
        let mut child = self.command.build(id, &request).spawn()?;
        let raw_pid = child.id().and_then(|pid| i32::try_from(pid).ok()).ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::other("child exited before its pid was read"))
        })?;
        let pid = Pid::from_raw(raw_pid);

        let (exited_tx, exited_rx) = watch::channel(false);
        {
            let mut children = lock(&self.children);
            if self.closed.load(Ordering::SeqCst) {
                drop(children);
                warn!(
                    job = %request.name,
                    pid = raw_pid,
                    "shutdown began during spawn, killing child"
                );
                if let Err(error) = child.start_kill() {
                    warn!(pid = raw_pid, %error, "failed to kill child");
                }
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                return Err(SupervisorError::ShuttingDown);
            }
            children.insert(id, ChildUnit { id, name: request.name.clone(), pid, exited: exited_rx });
        }

        info!(job = %request.name, task_id = %id, pid = raw_pid, "child process started");

        let children = Arc::clone(&self.children);
        let name = request.name;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(job = %name, task_id = %id, pid = raw_pid, "child process exited");
                },
                Ok(status) => {
                    error!(
                        job = %name,
                        task_id = %id,
                        pid = raw_pid,
                        exit_code = ?status.code(),
                        signal = ?status.signal(),
                        "child process exited with failure"
                    );
                },
                Err(error) => {
                    warn!(job = %name, task_id = %id, pid = raw_pid, %error, "failed to await child process");
                },
            }
            lock(&children).remove(&id);
            let _ = exited_tx.send(true);
        });

        Ok(id)
    }

    fn active(&self) -> usize {
        lock(&self.children).len()
    }

    fn shutdown(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = ShutdownReport> + Send + '_>> {
        Box::pin(self.shutdown_inner(timeout))
    }
}
