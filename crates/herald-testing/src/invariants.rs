//! Invariant checks shared by dispatch tests.

use std::{collections::HashSet, time::Duration};

use anyhow::{ensure, Result};
use herald_core::models::{Mailing, MailingId, MailingRecipient, RecipientStatus};

/// System invariants that must hold after any sequence of operations.
pub struct Invariants;

impl Invariants {
    /// Claim exclusivity: no mailing id is handed to two claimants.
    pub fn claims_disjoint(claims: &[Vec<MailingId>]) -> Result<()> {
        let mut seen = HashSet::new();
        for (batch, ids) in claims.iter().enumerate() {
            for id in ids {
                ensure!(seen.insert(*id), "mailing {id} claimed twice (again in claim {batch})");
            }
        }
        Ok(())
    }

    /// Rate bound: no `window`-length interval holds more than `rate` grants.
    pub fn window_rate_bound(
        grants: &[std::time::Instant],
        rate: usize,
        window: Duration,
    ) -> Result<()> {
        let mut sorted = grants.to_vec();
        sorted.sort();

        for (i, pair) in sorted.windows(rate + 1).enumerate() {
            let span = pair[rate].duration_since(pair[0]);
            ensure!(
                span >= window,
                "{} grants within {span:?} starting at grant {i} (limit {rate} per {window:?})",
                rate + 1
            );
        }
        Ok(())
    }

    /// Timestamp ordering: `ended_at` never precedes `started_at`.
    pub fn timestamps_ordered(mailing: &Mailing) -> Result<()> {
        if let (Some(started), Some(ended)) = (mailing.started_at, mailing.ended_at) {
            ensure!(
                ended >= started,
                "mailing {} ended at {ended} before it started at {started}",
                mailing.id
            );
        }
        Ok(())
    }

    /// Every recipient was attempted: none is left in `CREATED`.
    pub fn all_recipients_attempted(recipients: &[MailingRecipient]) -> Result<()> {
        let untouched: Vec<_> = recipients
            .iter()
            .filter(|r| r.status == RecipientStatus::Created)
            .map(|r| r.recipient_id.0)
            .collect();
        ensure!(untouched.is_empty(), "recipients never attempted: {untouched:?}");
        Ok(())
    }
}
