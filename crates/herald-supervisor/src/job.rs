//! Typed jobs and the name-keyed registry that runs them.
//!
//! Jobs cross process boundaries as a name plus a JSON payload, so the
//! registry is the only place that knows how to turn a [`JobRequest`] back
//! into a running future.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SupervisorError};

/// A unit of work that can be queued by name.
///
/// The payload is the job value itself. The context carries everything the
/// job needs from its environment and is rebuilt by child processes.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registry key. Must be unique within one registry.
    const NAME: &'static str;

    /// Dependencies handed to every run.
    type Context: Clone + Send + Sync + 'static;

    /// Executes the job.
    ///
    /// `cancel` fires on polite termination; jobs are expected to stop at
    /// the next safe point and return.
    fn run(
        self,
        ctx: Self::Context,
        cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// A job addressed by name with its serialized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Registered job name
    pub name: String,
    /// JSON-encoded job value
    pub payload: serde_json::Value,
}

impl JobRequest {
    /// Builds a request from a typed job.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Payload` if the job does not serialize.
    pub fn new<J: Job>(job: &J) -> Result<Self> {
        let payload =
            serde_json::to_value(job).map_err(|e| SupervisorError::payload(J::NAME, e))?;
        Ok(Self { name: J::NAME.to_string(), payload })
    }
}

type RunFn<Ctx> = Arc<
    dyn Fn(Ctx, serde_json::Value, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Maps job names to runners for one context type.
pub struct JobRegistry<Ctx> {
    jobs: HashMap<&'static str, RunFn<Ctx>>,
}

impl<Ctx: Clone + Send + Sync + 'static> JobRegistry<Ctx> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { jobs: HashMap::new() }
    }

    /// Registers a job type, replacing any previous job with the same name.
    pub fn register<J: Job<Context = Ctx>>(&mut self) -> &mut Self {
        let run: RunFn<Ctx> =
            Arc::new(|ctx: Ctx, payload: serde_json::Value, cancel: CancellationToken| {
                async move {
                    let job: J = serde_json::from_value(payload)
                        .map_err(|e| SupervisorError::payload(J::NAME, e))?;
                    job.run(ctx, cancel).await
                }
                .boxed()
            });
        self.jobs.insert(J::NAME, run);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with<J: Job<Context = Ctx>>(mut self) -> Self {
        self.register::<J>();
        self
    }

    /// Returns whether a job name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Resolves a request into a future ready to be polled.
    ///
    /// Payload decoding happens inside the returned future, so a malformed
    /// payload surfaces as a job failure rather than a submit error.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::UnknownJob` if the name is not registered.
    pub fn prepare(
        &self,
        ctx: Ctx,
        request: JobRequest,
        cancel: CancellationToken,
    ) -> Result<BoxFuture<'static, anyhow::Result<()>>> {
        let run = self
            .jobs
            .get(request.name.as_str())
            .ok_or_else(|| SupervisorError::unknown_job(&request.name))?;
        Ok(run(ctx, request.payload, cancel))
    }
}

impl<Ctx: Clone + Send + Sync + 'static> Default for JobRegistry<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> Clone for JobRegistry<Ctx> {
    fn clone(&self) -> Self {
        Self { jobs: self.jobs.clone() }
    }
}

impl<Ctx> fmt::Debug for JobRegistry<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry").field("jobs", &self.jobs.keys().collect::<Vec<_>>()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Add {
        amount: u64,
    }

    impl Job for Add {
        const NAME: &'static str = "add";
        type Context = Arc<AtomicU64>;

        async fn run(self, ctx: Self::Context, _cancel: CancellationToken) -> anyhow::Result<()> {
            ctx.fetch_add(self.amount, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn registered_job_runs_from_request() {
        let registry = JobRegistry::new().with::<Add>();
        let counter = Arc::new(AtomicU64::new(0));

        let request = JobRequest::new(&Add { amount: 7 }).unwrap();
        assert_eq!(request.name, "add");

        let future = registry.prepare(counter.clone(), request, CancellationToken::new()).unwrap();
        future.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn unknown_job_is_rejected() {
        let registry = JobRegistry::<Arc<AtomicU64>>::new().with::<Add>();
        let request = JobRequest { name: "missing".into(), payload: serde_json::Value::Null };

        let result =
            registry.prepare(Arc::new(AtomicU64::new(0)), request, CancellationToken::new());
        assert!(matches!(result, Err(SupervisorError::UnknownJob { .. })));
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_run() {
        let registry = JobRegistry::new().with::<Add>();
        let request = JobRequest { name: "add".into(), payload: serde_json::json!({"x": 1}) };

        let future = registry
            .prepare(Arc::new(AtomicU64::new(0)), request, CancellationToken::new())
            .unwrap();
        assert!(future.await.is_err());
    }

    #[test]
    fn names_are_sorted() {
        let registry = JobRegistry::<Arc<AtomicU64>>::new().with::<Add>();
        assert_eq!(registry.names(), vec!["add"]);
        assert!(registry.contains("add"));
    }
}
