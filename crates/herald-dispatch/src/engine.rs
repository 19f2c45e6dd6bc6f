//! Per-mailing dispatch state machine.
//!
//! A run validates the mailing, moves it to `SENDING`, then walks its
//! recipients page by page. Every page is fanned out concurrently; each send
//! first takes a rate-gate permit. Between pages the run re-reads the
//! mailing status, so an operator pause takes effect at the next page
//! boundary, and honours cancellation from the supervisor.
//!
//! Offsets advance only past recipients that remain candidates (those that
//! just failed). Sent recipients leave the `CREATED | FAILED` filter, so
//! advancing by the page length would skip rows.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use herald_core::{
    models::{
        Mailing, MailingId, MailingRecipient, MailingStatus, MessageId, RecipientId,
        RecipientStatus,
    },
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{DispatchError, ErrorCategory, Result},
    rate_gate::RateGate,
    storage::MailingStore,
    transport::DeliveryTransport,
    DEFAULT_BATCH_SIZE, DEFAULT_RETRY_PASSES,
};

/// Configuration for dispatch runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Recipients per page; also the fan-out width.
    pub batch_size: usize,

    /// Extra sweeps over recipients that failed in the first sweep.
    pub retry_passes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, retry_passes: DEFAULT_RETRY_PASSES }
    }
}

/// Counters for one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Recipients marked `SENT` by this run.
    pub sent: usize,
    /// Recipients still `FAILED` when the run stopped.
    pub failed: usize,
    /// Non-empty pages processed.
    pub pages: usize,
}

/// Why a mailing was refused before sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Already `SENT` or `FAILED`; nothing was written.
    AlreadyFinished(MailingStatus),
    /// Not in `PENDING`; the mailing was marked `FAILED`.
    UnexpectedStatus(MailingStatus),
    /// No messages to forward; the mailing was marked `FAILED`.
    NoMessages,
}

/// Result of one dispatch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchOutcome {
    /// Every page was processed and the mailing is `SENT`.
    Completed(DispatchStats),
    /// The mailing left `SENDING` mid-run; its status was kept.
    Paused {
        /// Status observed at the page boundary
        status: MailingStatus,
        /// Progress made before stopping
        stats: DispatchStats,
    },
    /// Cancellation was requested; the mailing was re-armed as `RESUME`.
    Interrupted(DispatchStats),
    /// Validation refused the mailing.
    Rejected(RejectReason),
    /// The mailing does not exist.
    Skipped,
    /// An engine-level error ended the run; the mailing is `FAILED`.
    Failed {
        /// Error message
        error: String,
    },
}

/// Checks whether a loaded mailing may be dispatched.
///
/// # Errors
///
/// Returns the reason the mailing must not be sent.
pub fn validate(mailing: &Mailing) -> std::result::Result<(), RejectReason> {
    if mailing.status.is_terminal() {
        return Err(RejectReason::AlreadyFinished(mailing.status));
    }
    if mailing.status != MailingStatus::Pending {
        return Err(RejectReason::UnexpectedStatus(mailing.status));
    }
    if !mailing.has_messages() {
        return Err(RejectReason::NoMessages);
    }
    Ok(())
}

/// Sends claimed mailings.
#[derive(Clone)]
pub struct DispatchEngine {
    store: Arc<dyn MailingStore>,
    transport: Arc<dyn DeliveryTransport>,
    gate: Arc<RateGate>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

struct PageResult {
    sent: Vec<RecipientId>,
    failed: Vec<RecipientId>,
    retry_after: Option<Duration>,
    gate_error: Option<DispatchError>,
}

impl DispatchEngine {
    /// Creates an engine.
    pub fn new(
        store: Arc<dyn MailingStore>,
        transport: Arc<dyn DeliveryTransport>,
        gate: Arc<RateGate>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self { store, transport, gate, clock, config }
    }

    /// Runs one mailing to a stopping point.
    ///
    /// Never returns an error: engine failures are logged, recorded on the
    /// mailing as `FAILED`, and reported as [`DispatchOutcome::Failed`].
    pub async fn dispatch(&self, id: MailingId, cancel: CancellationToken) -> DispatchOutcome {
        let span = info_span!("dispatch", mailing_id = %id);

        async move {
            let mailing = match self.store.get(id).await {
                Ok(Some(mailing)) => mailing,
                Ok(None) => {
                    warn!("mailing not found, skipping");
                    return DispatchOutcome::Skipped;
                },
                Err(error) => return self.fail(id, error.into()).await,
            };

            if let Err(reason) = validate(&mailing) {
                return self.reject(id, reason).await;
            }

            match self.run(&mailing, &cancel).await {
                Ok(outcome) => outcome,
                Err(error) => self.fail(id, error).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn reject(&self, id: MailingId, reason: RejectReason) -> DispatchOutcome {
        match &reason {
            RejectReason::AlreadyFinished(status) => {
                info!(status = %status, "mailing already finished, nothing to do");
            },
            RejectReason::UnexpectedStatus(_) | RejectReason::NoMessages => {
                warn!(reason = ?reason, "mailing failed validation");
                if let Err(error) = self.store.finish_sending(id, false, self.clock.now_utc()).await
                {
                    error!(error = %error, "failed to mark invalid mailing as failed");
                }
            },
        }
        DispatchOutcome::Rejected(reason)
    }

    async fn fail(&self, id: MailingId, error: DispatchError) -> DispatchOutcome {
        error!(error = %error, category = %ErrorCategory::from(&error), "dispatch failed");
        if let Err(store_error) = self.store.finish_sending(id, false, self.clock.now_utc()).await {
            error!(error = %store_error, "failed to mark mailing as failed");
        }
        DispatchOutcome::Failed { error: error.to_string() }
    }

    async fn run(&self, mailing: &Mailing, cancel: &CancellationToken) -> Result<DispatchOutcome> {
        let id = mailing.id;
        let batch_size = self.config.batch_size.max(1);

        self.store.start_sending(id, self.clock.now_utc()).await?;
        info!(messages = mailing.message_ids.len(), batch_size, "dispatch started");

        let mut stats = DispatchStats::default();

        for pass in 0..=self.config.retry_passes {
            let mut offset = 0;
            let mut pass_failed = 0;

            loop {
                if let Some(stop) = self.checkpoint(id, cancel, stats).await? {
                    return Ok(stop);
                }

                let page = self
                    .store
                    .page_recipients(id, RecipientStatus::READY.to_vec(), batch_size, offset)
                    .await?;
                if page.is_empty() {
                    break;
                }

                let result = self.send_page(&page, &mailing.message_ids).await;
                self.store.update_recipient_status(result.sent.clone(), RecipientStatus::Sent).await?;
                self.store
                    .update_recipient_status(result.failed.clone(), RecipientStatus::Failed)
                    .await?;

                debug!(
                    pass,
                    offset,
                    sent = result.sent.len(),
                    failed = result.failed.len(),
                    "page processed"
                );

                stats.pages += 1;
                stats.sent += result.sent.len();
                pass_failed += result.failed.len();
                offset += result.failed.len();

                if let Some(error) = result.gate_error {
                    return Err(error);
                }
                if let Some(wait) = result.retry_after {
                    warn!(
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "transport asked to back off"
                    );
                    self.clock.sleep(wait).await;
                }
            }

            stats.failed = pass_failed;
            if pass_failed == 0 {
                break;
            }
            if pass < self.config.retry_passes {
                info!(pass = pass + 1, failed = pass_failed, "retrying failed recipients");
            }
        }

        self.store.finish_sending(id, true, self.clock.now_utc()).await?;
        info!(sent = stats.sent, failed = stats.failed, pages = stats.pages, "dispatch completed");

        Ok(DispatchOutcome::Completed(stats))
    }

    /// Page-boundary check for cancellation and operator status changes.
    async fn checkpoint(
        &self,
        id: MailingId,
        cancel: &CancellationToken,
        stats: DispatchStats,
    ) -> Result<Option<DispatchOutcome>> {
        if cancel.is_cancelled() {
            self.store.update_status(vec![id], MailingStatus::Resume).await?;
            self.store.mark_ended(id, self.clock.now_utc()).await?;
            warn!(sent = stats.sent, "dispatch interrupted, mailing re-armed");
            return Ok(Some(DispatchOutcome::Interrupted(stats)));
        }

        match self.store.get_status(id).await? {
            Some(MailingStatus::Sending) => Ok(None),
            Some(status) => {
                self.store.mark_ended(id, self.clock.now_utc()).await?;
                info!(status = %status, sent = stats.sent, "mailing left sending, stopping");
                Ok(Some(DispatchOutcome::Paused { status, stats }))
            },
            None => {
                warn!("mailing deleted during dispatch");
                Ok(Some(DispatchOutcome::Skipped))
            },
        }
    }

    async fn send_page(&self, page: &[MailingRecipient], messages: &[MessageId]) -> PageResult {
        let identity = self.transport.identity();
        let results =
            join_all(page.iter().map(|recipient| self.send_one(identity, recipient, messages)))
                .await;

        let mut outcome =
            PageResult { sent: Vec::new(), failed: Vec::new(), retry_after: None, gate_error: None };

        // join_all yields results in input order, so position identifies the recipient.
        for (recipient, result) in page.iter().zip(results) {
            match result {
                Ok(()) => outcome.sent.push(recipient.id),
                Err(error) => {
                    debug!(
                        chat_id = %recipient.recipient_id,
                        error = %error,
                        category = %ErrorCategory::from(&error),
                        "send failed"
                    );
                    outcome.failed.push(recipient.id);
                    if let Some(wait) = error.retry_after() {
                        outcome.retry_after = Some(outcome.retry_after.map_or(wait, |w| w.max(wait)));
                    }
                    if matches!(error, DispatchError::RateGate { .. }) {
                        outcome.gate_error.get_or_insert(error);
                    }
                },
            }
        }

        outcome
    }

    async fn send_one(
        &self,
        identity: &str,
        recipient: &MailingRecipient,
        messages: &[MessageId],
    ) -> Result<()> {
        let _permit = self.gate.acquire(identity).await?;
        self.transport.deliver(recipient.recipient_id, messages).await
    }
}
