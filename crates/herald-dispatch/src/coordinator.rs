//! Periodic claim cycle.
//!
//! Each cycle claims the due mailings and submits one [`DispatchMailing`]
//! job per id. Overlapping cycles, on this host or others, are safe: the
//! store's lock-and-skip claim hands every id to exactly one claimant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_core::{
    models::{MailingId, MailingStatus},
    Clock,
};
use herald_supervisor::{JobRequest, TaskSupervisor};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{error::Result, job::DispatchMailing, storage::MailingStore, DEFAULT_CLAIM_LIMIT};

/// Counters for one claim cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Mailings moved to `PENDING`.
    pub claimed: usize,
    /// Jobs accepted by the supervisor.
    pub submitted: usize,
    /// Mailings returned to `CREATED` after a failed submission.
    pub reverted: usize,
}

/// Claims due mailings and hands them to the supervisor.
pub struct ClaimCoordinator {
    store: Arc<dyn MailingStore>,
    supervisor: Arc<dyn TaskSupervisor>,
    clock: Arc<dyn Clock>,
    claim_limit: usize,
}

impl ClaimCoordinator {
    /// Creates a coordinator claiming at most [`DEFAULT_CLAIM_LIMIT`] per cycle.
    pub fn new(
        store: Arc<dyn MailingStore>,
        supervisor: Arc<dyn TaskSupervisor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, supervisor, clock, claim_limit: DEFAULT_CLAIM_LIMIT }
    }

    /// Overrides the per-cycle claim limit.
    #[must_use]
    pub fn with_claim_limit(mut self, claim_limit: usize) -> Self {
        self.claim_limit = claim_limit;
        self
    }

    /// Claims up to `limit` mailings due at `now`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Storage` if the claim transaction fails; in
    /// that case nothing was claimed.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MailingId>> {
        Ok(self.store.claim_due(now, limit).await?)
    }

    /// Runs one claim cycle.
    ///
    /// A failed submission returns that mailing to `CREATED` so a later
    /// cycle picks it up; the remaining submissions continue.
    ///
    /// # Errors
    ///
    /// Returns error only if the claim itself fails.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        async move {
            let ids = self.claim_due(self.clock.now_utc(), self.claim_limit).await?;
            let mut report = CycleReport { claimed: ids.len(), ..CycleReport::default() };
            if ids.is_empty() {
                debug!("no mailings due");
                return Ok(report);
            }

            let mut rejected = Vec::new();
            for mailing_id in ids {
                let submitted = JobRequest::new(&DispatchMailing { mailing_id })
                    .and_then(|request| self.supervisor.submit(request));

                match submitted {
                    Ok(task_id) => {
                        report.submitted += 1;
                        debug!(mailing_id = %mailing_id, task_id = %task_id, "dispatch job submitted");
                    },
                    Err(error) => {
                        warn!(mailing_id = %mailing_id, error = %error, "failed to submit dispatch job");
                        rejected.push(mailing_id);
                    },
                }
            }

            if !rejected.is_empty() {
                match self.store.update_status(rejected, MailingStatus::Created).await {
                    Ok(reverted) => report.reverted = usize::try_from(reverted).unwrap_or(usize::MAX),
                    Err(error) => error!(error = %error, "failed to revert unsubmitted mailings"),
                }
            }

            info!(
                claimed = report.claimed,
                submitted = report.submitted,
                reverted = report.reverted,
                "claim cycle finished"
            );
            Ok(report)
        }
        .instrument(info_span!("claim_cycle"))
        .await
    }
}
