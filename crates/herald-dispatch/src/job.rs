//! The dispatch job handed to the task supervisor.

use std::sync::Arc;

use herald_core::models::MailingId;
use herald_supervisor::{Job, JobRegistry};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::{DispatchEngine, DispatchOutcome};

/// Dependencies of a dispatch job.
///
/// Built once per process; child processes build their own from
/// configuration.
#[derive(Clone)]
pub struct DispatchContext {
    /// Engine running the mailing.
    pub engine: Arc<DispatchEngine>,
}

/// Dispatches one claimed mailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMailing {
    /// Mailing to dispatch.
    pub mailing_id: MailingId,
}

impl Job for DispatchMailing {
    const NAME: &'static str = "dispatch_mailing";
    type Context = DispatchContext;

    async fn run(self, ctx: DispatchContext, cancel: CancellationToken) -> anyhow::Result<()> {
        match ctx.engine.dispatch(self.mailing_id, cancel).await {
            DispatchOutcome::Failed { error } => {
                anyhow::bail!("dispatch of mailing {} failed: {error}", self.mailing_id)
            },
            _ => Ok(()),
        }
    }
}

/// Builds the registry of every job this crate defines.
pub fn job_registry() -> JobRegistry<DispatchContext> {
    JobRegistry::new().with::<DispatchMailing>()
}

#[cfg(test)]
mod tests {
    use herald_supervisor::JobRequest;

    use super::*;

    #[test]
    fn payload_is_the_mailing_id() {
        let request = JobRequest::new(&DispatchMailing { mailing_id: MailingId(42) }).unwrap();
        assert_eq!(request.name, "dispatch_mailing");
        assert_eq!(request.payload, serde_json::json!({ "mailing_id": 42 }));
    }

    #[test]
    fn registry_knows_the_dispatch_job() {
        assert_eq!(job_registry().names(), vec![DispatchMailing::NAME]);
    }
}
