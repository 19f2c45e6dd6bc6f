//! Runs jobs as tasks on the current tokio runtime.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::{
    error::{Result, SupervisorError},
    job::{JobRegistry, JobRequest},
    shutdown::{stop_all, ShutdownConfig, ShutdownReport, Stoppable},
    supervisor::{TaskId, TaskSupervisor},
};

struct TrackedTask {
    id: TaskId,
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    finished: bool,
}

impl Stoppable for TrackedTask {
    fn has_exited(&mut self) -> bool {
        self.finished || self.handle.is_finished()
    }

    fn terminate(&mut self) {
        self.cancel.cancel();
    }

    fn kill(&mut self) {
        self.handle.abort();
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if !self.finished {
                let _ = (&mut self.handle).await;
                self.finished = true;
            }
        })
    }

    fn label(&self) -> String {
        format!("{}:{}", self.name, self.id)
    }
}

struct Inner<Ctx> {
    registry: JobRegistry<Ctx>,
    context: Ctx,
    config: ShutdownConfig,
    tasks: Mutex<HashMap<TaskId, TrackedTask>>,
    closed: AtomicBool,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl<Ctx> Inner<Ctx> {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, TrackedTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Supervisor that spawns jobs on the current runtime.
///
/// A job's error or panic is logged and never propagates to the submitter.
/// Polite termination cancels the job's token; forced termination aborts
/// the task, which takes effect at its next await point.
pub struct InProcessSupervisor<Ctx> {
    inner: Arc<Inner<Ctx>>,
}

impl<Ctx> Clone for InProcessSupervisor<Ctx> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<Ctx: Clone + Send + Sync + 'static> InProcessSupervisor<Ctx> {
    /// Creates a supervisor running jobs from `registry` with `context`.
    pub fn new(registry: JobRegistry<Ctx>, context: Ctx, config: ShutdownConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                context,
                config,
                tasks: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    async fn shutdown_inner(&self, timeout: Duration) -> ShutdownReport {
        let _guard = self.inner.shutdown_lock.lock().await;

        // Closed under the table lock, so no submit can insert after the drain.
        let units: Vec<TrackedTask> = {
            let mut tasks = self.inner.tasks();
            self.inner.closed.store(true, Ordering::SeqCst);
            tasks.drain().map(|(_, task)| task).collect()
        };
        if units.is_empty() {
            return ShutdownReport::default();
        }

        info!(
            tasks = units.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "stopping in-process tasks"
        );
        let report = stop_all(units, timeout, self.inner.config).await;
        report.log("in-process tasks");
        report
    }
}

impl<Ctx: Clone + Send + Sync + 'static> TaskSupervisor for InProcessSupervisor<Ctx> {
    fn submit(&self, request: JobRequest) -> Result<TaskId> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        let id = TaskId::new();
        let name = request.name.clone();
        let cancel = CancellationToken::new();
        let job = self.inner.registry.prepare(self.inner.context.clone(), request, cancel.clone())?;

        let span = info_span!("job", job = %name, task_id = %id);
        let inner = Arc::clone(&self.inner);

        // Held across spawn so the task cannot untrack itself before insertion.
        let mut tasks = self.inner.tasks();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        let handle = tokio::spawn(
            async move {
                match AssertUnwindSafe(job).catch_unwind().await {
                    Ok(Ok(())) => debug!("job completed"),
                    Ok(Err(error)) => error!(error = ?error, "job failed"),
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "non-string panic payload".to_string());
                        error!(panic = %message, "job panicked");
                    },
                }
                inner.tasks().remove(&id);
            }
            .instrument(span),
        );
        tasks.insert(id, TrackedTask { id, name, cancel, handle, finished: false });

        Ok(id)
    }

    fn active(&self) -> usize {
        self.inner.tasks().len()
    }

    fn shutdown(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = ShutdownReport> + Send + '_>> {
        Box::pin(self.shutdown_inner(timeout))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::job::Job;

    #[derive(Clone, Default)]
    struct Ctx {
        runs: Arc<AtomicUsize>,
    }

    #[derive(Serialize, Deserialize)]
    enum Behaviour {
        Complete,
        Fail,
        Panic,
        WaitForCancel,
        IgnoreCancel,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob {
        behaviour: Behaviour,
    }

    impl Job for TestJob {
        const NAME: &'static str = "test";
        type Context = Ctx;

        async fn run(self, ctx: Ctx, cancel: CancellationToken) -> anyhow::Result<()> {
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Complete => Ok(()),
                Behaviour::Fail => anyhow::bail!("job failed on purpose"),
                Behaviour::Panic => panic!("job panicked on purpose"),
                Behaviour::WaitForCancel => {
                    cancel.cancelled().await;
                    Ok(())
                },
                Behaviour::IgnoreCancel => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
            }
        }
    }

    fn supervisor(config: ShutdownConfig) -> (InProcessSupervisor<Ctx>, Ctx) {
        let ctx = Ctx::default();
        let registry = JobRegistry::new().with::<TestJob>();
        (InProcessSupervisor::new(registry, ctx.clone(), config), ctx)
    }

    fn request(behaviour: Behaviour) -> JobRequest {
        JobRequest::new(&TestJob { behaviour }).unwrap()
    }

    async fn wait_until_idle(supervisor: &InProcessSupervisor<Ctx>) {
        for _ in 0..100 {
            if supervisor.active() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tasks still tracked: {}", supervisor.active());
    }

    #[tokio::test]
    async fn failures_and_panics_stay_inside_the_task() {
        let (supervisor, ctx) = supervisor(ShutdownConfig::default());

        supervisor.submit(request(Behaviour::Complete)).unwrap();
        supervisor.submit(request(Behaviour::Fail)).unwrap();
        supervisor.submit(request(Behaviour::Panic)).unwrap();

        wait_until_idle(&supervisor).await;
        assert_eq!(ctx.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_job_is_rejected_at_submit() {
        let (supervisor, _) = supervisor(ShutdownConfig::default());
        let result =
            supervisor.submit(JobRequest { name: "nope".into(), payload: serde_json::Value::Null });
        assert!(matches!(result, Err(SupervisorError::UnknownJob { .. })));
        assert_eq!(supervisor.active(), 0);
    }

    #[tokio::test]
    async fn shutdown_escalates_only_for_uncooperative_tasks() {
        let config = ShutdownConfig {
            timeout: Duration::from_millis(200),
            kill_timeout: Duration::from_millis(100),
        };
        let (supervisor, _) = supervisor(config);

        supervisor.submit(request(Behaviour::WaitForCancel)).unwrap();
        supervisor.submit(request(Behaviour::WaitForCancel)).unwrap();
        supervisor.submit(request(Behaviour::IgnoreCancel)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(supervisor.active(), 3);

        let started = tokio::time::Instant::now();
        let report = supervisor.shutdown(config.timeout).await;

        assert_eq!(report, ShutdownReport { terminated: 2, killed: 1, unconfirmed: 0 });
        assert!(started.elapsed() < config.timeout + config.kill_timeout + Duration::from_millis(200));
        assert_eq!(supervisor.active(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_submission() {
        let (supervisor, _) = supervisor(ShutdownConfig::default());
        supervisor.submit(request(Behaviour::WaitForCancel)).unwrap();

        let first = supervisor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(first.terminated, 1);

        let second = supervisor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(second, ShutdownReport::default());

        let result = supervisor.submit(request(Behaviour::Complete));
        assert!(matches!(result, Err(SupervisorError::ShuttingDown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_accounts_for_tasks_submitted_while_it_runs() {
        let config = ShutdownConfig {
            timeout: Duration::from_millis(200),
            kill_timeout: Duration::from_millis(100),
        };
        let (supervisor, _) = supervisor(config);

        let submitter = {
            let supervisor = supervisor.clone();
            tokio::task::spawn_blocking(move || {
                let mut accepted = 0;
                for _ in 0..500 {
                    match supervisor.submit(request(Behaviour::WaitForCancel)) {
                        Ok(_) => accepted += 1,
                        Err(SupervisorError::ShuttingDown) => {},
                        Err(other) => panic!("unexpected submit error: {other}"),
                    }
                }
                accepted
            })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        let report = supervisor.shutdown(config.timeout).await;
        let accepted = submitter.await.unwrap();

        assert_eq!(report.total(), accepted);
        assert_eq!(supervisor.active(), 0);
    }
}
