//! Child-side entry point for jobs started by the process supervisor.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::job::{JobRegistry, JobRequest};

/// Runs one request to completion inside a child process.
///
/// SIGTERM (and Ctrl-C) cancel the job's token so it can stop at a safe
/// point; the parent escalates to SIGKILL if that takes too long.
///
/// # Errors
///
/// Returns error if the job is unknown or the job itself fails. Callers map
/// an error to a non-zero exit code.
pub async fn run_request<Ctx: Clone + Send + Sync + 'static>(
    registry: &JobRegistry<Ctx>,
    context: Ctx,
    request: JobRequest,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let name = request.name.clone();
    let job = registry.prepare(context, request, cancel.clone())?;

    let watcher = tokio::spawn(cancel_on_termination(cancel.clone()));

    info!(job = %name, "child job started");
    let result = job.await;
    watcher.abort();

    match &result {
        Ok(()) => info!(job = %name, cancelled = cancel.is_cancelled(), "child job finished"),
        Err(error) => warn!(job = %name, error = ?error, "child job failed"),
    }
    result
}

async fn cancel_on_termination(cancel: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("termination requested, cancelling job");
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{error::SupervisorError, job::Job};

    #[derive(Serialize, Deserialize)]
    struct Flip;

    impl Job for Flip {
        const NAME: &'static str = "flip";
        type Context = Arc<AtomicBool>;

        async fn run(self, ctx: Self::Context, _cancel: CancellationToken) -> anyhow::Result<()> {
            ctx.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_request_and_reports_success() {
        let registry = JobRegistry::new().with::<Flip>();
        let flag = Arc::new(AtomicBool::new(false));

        run_request(&registry, flag.clone(), JobRequest::new(&Flip).unwrap()).await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let registry = JobRegistry::<Arc<AtomicBool>>::new();
        let request = JobRequest { name: "flip".into(), payload: serde_json::Value::Null };

        let error = run_request(&registry, Arc::new(AtomicBool::new(false)), request)
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::UnknownJob { .. })
        ));
    }
}
