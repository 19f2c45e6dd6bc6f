//! Storage abstraction for the claim coordinator and dispatch engine.
//!
//! Production code goes through [`PostgresMailingStore`], a thin adapter over
//! `herald_core::storage::Storage`. Tests use [`mock::MockMailingStore`],
//! which keeps the same claim and timestamp semantics in memory.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    models::{
        Mailing, MailingId, MailingRecipient, MailingStatus, NewMailing, RecipientId,
        RecipientStatus,
    },
};

/// Boxed future returned by every store operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations needed to claim and dispatch mailings.
pub trait MailingStore: Send + Sync + 'static {
    /// Claims up to `limit` due mailings and moves them to `PENDING`.
    ///
    /// Concurrent callers never receive the same id. Mailings locked by
    /// another claimant are skipped, so contention returns fewer ids rather
    /// than blocking.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MailingId>>;

    /// Loads one mailing.
    fn get(&self, id: MailingId) -> StoreFuture<'_, Option<Mailing>>;

    /// Loads only the status of one mailing.
    fn get_status(&self, id: MailingId) -> StoreFuture<'_, Option<MailingStatus>>;

    /// Sets the status of several mailings. Returns the number changed.
    fn update_status(&self, ids: Vec<MailingId>, status: MailingStatus) -> StoreFuture<'_, u64>;

    /// Moves a mailing to `SENDING`, setting `started_at` only when unset.
    fn start_sending(&self, id: MailingId, now: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Moves a mailing to `SENT` or `FAILED` and records `ended_at`.
    fn finish_sending(
        &self,
        id: MailingId,
        success: bool,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Records `ended_at` without changing the status.
    fn mark_ended(&self, id: MailingId, now: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Returns one page of recipients in `statuses`, ordered by id.
    fn page_recipients(
        &self,
        mailing_id: MailingId,
        statuses: Vec<RecipientStatus>,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'_, Vec<MailingRecipient>>;

    /// Sets the status of several recipients. Returns the number changed.
    fn update_recipient_status(
        &self,
        ids: Vec<RecipientId>,
        status: RecipientStatus,
    ) -> StoreFuture<'_, u64>;

    /// Pauses a `SENDING` mailing. Returns `false` in any other status.
    fn pause(&self, id: MailingId) -> StoreFuture<'_, bool>;

    /// Re-arms a `PAUSED` or `FAILED` mailing as `RESUME`.
    fn resume(&self, id: MailingId) -> StoreFuture<'_, bool>;

    /// Inserts a mailing with its recipients.
    fn create(&self, mailing: NewMailing) -> StoreFuture<'_, MailingId>;
}

/// Production store backed by PostgreSQL.
pub struct PostgresMailingStore {
    storage: Arc<herald_core::storage::Storage>,
}

impl PostgresMailingStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<herald_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl MailingStore for PostgresMailingStore {
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MailingId>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.claim_due(now, limit).await })
    }

    fn get(&self, id: MailingId) -> StoreFuture<'_, Option<Mailing>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.find_by_id(id).await })
    }

    fn get_status(&self, id: MailingId) -> StoreFuture<'_, Option<MailingStatus>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.find_status(id).await })
    }

    fn update_status(&self, ids: Vec<MailingId>, status: MailingStatus) -> StoreFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.update_statuses(&ids, status).await })
    }

    fn start_sending(&self, id: MailingId, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.start_sending(id, now).await })
    }

    fn finish_sending(
        &self,
        id: MailingId,
        success: bool,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.finish_sending(id, success, now).await })
    }

    fn mark_ended(&self, id: MailingId, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.mark_ended(id, now).await })
    }

    fn page_recipients(
        &self,
        mailing_id: MailingId,
        statuses: Vec<RecipientStatus>,
        limit: usize,
        offset: usize,
    ) -> StoreFuture<'_, Vec<MailingRecipient>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.recipients.page(mailing_id, &statuses, limit, offset).await })
    }

    fn update_recipient_status(
        &self,
        ids: Vec<RecipientId>,
        status: RecipientStatus,
    ) -> StoreFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.recipients.update_statuses(&ids, status).await })
    }

    fn pause(&self, id: MailingId) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.pause(id).await })
    }

    fn resume(&self, id: MailingId) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.resume(id).await })
    }

    fn create(&self, mailing: NewMailing) -> StoreFuture<'_, MailingId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.mailings.create(&mailing).await })
    }
}

pub mod mock {
    //! In-memory store for testing claim and dispatch logic without a
    //! database.
    //!
    //! All state sits behind one lock. A claim marks its rows locked while
    //! its transaction is in flight (see [`MockMailingStore::with_claim_latency`])
    //! and concurrent claims skip locked rows, matching `SKIP LOCKED` in the
    //! production store.

    use std::{
        collections::{BTreeMap, HashMap, HashSet},
        sync::Arc,
        time::Duration,
    };

    use chrono::{DateTime, Utc};
    use herald_core::{error::CoreError, models::ChatId};
    use tokio::sync::RwLock;

    use super::{
        Mailing, MailingId, MailingRecipient, MailingStatus, MailingStore, NewMailing,
        RecipientId, RecipientStatus, StoreFuture,
    };

    /// Operations that accept an injected one-shot error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Operation {
        /// `claim_due`
        Claim,
        /// `get`
        Get,
        /// `start_sending`
        StartSending,
        /// `page_recipients`
        PageRecipients,
        /// `update_recipient_status`
        UpdateRecipients,
        /// `finish_sending`
        FinishSending,
        /// `update_status`
        UpdateStatus,
    }

    #[derive(Default)]
    struct State {
        mailings: BTreeMap<MailingId, Mailing>,
        recipients: BTreeMap<RecipientId, MailingRecipient>,
        next_mailing_id: i64,
        next_recipient_id: i64,
        errors: HashMap<Operation, String>,
        pages_served: HashMap<MailingId, usize>,
        status_after_pages: HashMap<MailingId, (usize, MailingStatus)>,
        claims: Vec<Vec<MailingId>>,
        locked: HashSet<MailingId>,
    }

    impl State {
        fn take_error(&mut self, operation: Operation) -> Result<(), CoreError> {
            match self.errors.remove(&operation) {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }

        fn mailing_mut(&mut self, id: MailingId) -> Result<&mut Mailing, CoreError> {
            self.mailings
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("mailing {id}")))
        }
    }

    fn end_of_epoch(mailing: &mut Mailing, now: DateTime<Utc>) {
        if mailing.ended_at.is_none() {
            mailing.ended_at = Some(mailing.started_at.map_or(now, |started| started.max(now)));
        }
    }

    /// Mock store for testing dispatch logic without a database.
    #[derive(Clone, Default)]
    pub struct MockMailingStore {
        state: Arc<RwLock<State>>,
        claim_latency: Duration,
    }

    impl MockMailingStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Keeps every claim transaction open for `latency` between locking
        /// its rows and committing, so overlapping claims can be observed.
        #[must_use]
        pub fn with_claim_latency(mut self, latency: Duration) -> Self {
            self.claim_latency = latency;
            self
        }

        /// Inserts a mailing row as-is, recipients included.
        pub async fn insert(&self, mailing: Mailing, recipients: Vec<MailingRecipient>) {
            let mut state = self.state.write().await;
            state.next_mailing_id = state.next_mailing_id.max(mailing.id.0);
            for recipient in recipients {
                state.next_recipient_id = state.next_recipient_id.max(recipient.id.0);
                state.recipients.insert(recipient.id, recipient);
            }
            state.mailings.insert(mailing.id, mailing);
        }

        /// Injects an error returned by the next call of `operation`.
        pub async fn inject_error(&self, operation: Operation, message: impl Into<String>) {
            self.state.write().await.errors.insert(operation, message.into());
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, message: impl Into<String>) {
            self.inject_error(Operation::Claim, message).await;
        }

        /// Sets the mailing status once `pages` recipient pages were served
        /// for it, simulating an operator acting mid-dispatch.
        pub async fn set_status_after_pages(
            &self,
            id: MailingId,
            pages: usize,
            status: MailingStatus,
        ) {
            self.state.write().await.status_after_pages.insert(id, (pages, status));
        }

        /// Overwrites a mailing status directly.
        pub async fn set_status(&self, id: MailingId, status: MailingStatus) {
            if let Some(mailing) = self.state.write().await.mailings.get_mut(&id) {
                mailing.status = status;
            }
        }

        /// Returns a snapshot of one mailing.
        pub async fn mailing(&self, id: MailingId) -> Option<Mailing> {
            self.state.read().await.mailings.get(&id).cloned()
        }

        /// Returns every recipient of a mailing, ordered by id.
        pub async fn recipients(&self, mailing_id: MailingId) -> Vec<MailingRecipient> {
            self.state
                .read()
                .await
                .recipients
                .values()
                .filter(|r| r.mailing_id == mailing_id)
                .cloned()
                .collect()
        }

        /// Returns the status of one recipient chat within a mailing.
        pub async fn recipient_status(
            &self,
            mailing_id: MailingId,
            chat: ChatId,
        ) -> Option<RecipientStatus> {
            self.state
                .read()
                .await
                .recipients
                .values()
                .find(|r| r.mailing_id == mailing_id && r.recipient_id == chat)
                .map(|r| r.status)
        }

        /// Every id list returned by `claim_due`, in call order.
        pub async fn claim_history(&self) -> Vec<Vec<MailingId>> {
            self.state.read().await.claims.clone()
        }

        /// Number of recipient pages served for a mailing.
        pub async fn pages_served(&self, id: MailingId) -> usize {
            self.state.read().await.pages_served.get(&id).copied().unwrap_or(0)
        }
    }

    impl MailingStore for MockMailingStore {
        fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MailingId>> {
            let state = self.state.clone();
            let latency = self.claim_latency;
            Box::pin(async move {
                let claimed = {
                    let mut state = state.write().await;
                    state.take_error(Operation::Claim)?;

                    let mut due: Vec<&Mailing> = state
                        .mailings
                        .values()
                        .filter(|m| m.is_due(now) && !state.locked.contains(&m.id))
                        .collect();
                    due.sort_by_key(|m| (m.scheduled_at, m.id));
                    let claimed: Vec<MailingId> =
                        due.into_iter().take(limit).map(|m| m.id).collect();

                    state.locked.extend(claimed.iter().copied());
                    claimed
                };

                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }

                let mut state = state.write().await;
                let updated_at = Utc::now();
                for id in &claimed {
                    state.locked.remove(id);
                    let mailing = state.mailing_mut(*id)?;
                    mailing.status = MailingStatus::Pending;
                    mailing.updated_at = updated_at;
                }
                state.claims.push(claimed.clone());

                Ok(claimed)
            })
        }

        fn get(&self, id: MailingId) -> StoreFuture<'_, Option<Mailing>> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.take_error(Operation::Get)?;
                Ok(state.mailings.get(&id).cloned())
            })
        }

        fn get_status(&self, id: MailingId) -> StoreFuture<'_, Option<MailingStatus>> {
            let state = self.state.clone();
            Box::pin(async move { Ok(state.read().await.mailings.get(&id).map(|m| m.status)) })
        }

        fn update_status(
            &self,
            ids: Vec<MailingId>,
            status: MailingStatus,
        ) -> StoreFuture<'_, u64> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.take_error(Operation::UpdateStatus)?;

                let mut changed = 0;
                for id in ids {
                    if let Some(mailing) = state.mailings.get_mut(&id) {
                        mailing.status = status;
                        mailing.updated_at = Utc::now();
                        changed += 1;
                    }
                }
                Ok(changed)
            })
        }

        fn start_sending(&self, id: MailingId, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.take_error(Operation::StartSending)?;

                let mailing = state.mailing_mut(id)?;
                mailing.status = MailingStatus::Sending;
                mailing.started_at.get_or_insert(now);
                mailing.ended_at = None;
                mailing.updated_at = Utc::now();
                Ok(())
            })
        }

        fn finish_sending(
            &self,
            id: MailingId,
            success: bool,
            now: DateTime<Utc>,
        ) -> StoreFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.take_error(Operation::FinishSending)?;

                let mailing = state.mailing_mut(id)?;
                mailing.status = if success { MailingStatus::Sent } else { MailingStatus::Failed };
                end_of_epoch(mailing, now);
                mailing.updated_at = Utc::now();
                Ok(())
            })
        }

        fn mark_ended(&self, id: MailingId, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                let mailing = state.mailing_mut(id)?;
                end_of_epoch(mailing, now);
                mailing.updated_at = Utc::now();
                Ok(())
            })
        }

        fn page_recipients(
            &self,
            mailing_id: MailingId,
            statuses: Vec<RecipientStatus>,
            limit: usize,
            offset: usize,
        ) -> StoreFuture<'_, Vec<MailingRecipient>> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.take_error(Operation::PageRecipients)?;

                let page: Vec<MailingRecipient> = state
                    .recipients
                    .values()
                    .filter(|r| r.mailing_id == mailing_id && statuses.contains(&r.status))
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect();

                let served = {
                    let served = state.pages_served.entry(mailing_id).or_insert(0);
                    *served += 1;
                    *served
                };
                if let Some(&(pages, status)) = state.status_after_pages.get(&mailing_id) {
                    if served >= pages {
                        state.status_after_pages.remove(&mailing_id);
                        if let Some(mailing) = state.mailings.get_mut(&mailing_id) {
                            mailing.status = status;
                        }
                    }
                }

                Ok(page)
            })
        }

        fn update_recipient_status(
            &self,
            ids: Vec<RecipientId>,
            status: RecipientStatus,
        ) -> StoreFuture<'_, u64> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.take_error(Operation::UpdateRecipients)?;

                let mut changed = 0;
                for id in ids {
                    if let Some(recipient) = state.recipients.get_mut(&id) {
                        recipient.status = status;
                        recipient.updated_at = Utc::now();
                        changed += 1;
                    }
                }
                Ok(changed)
            })
        }

        fn pause(&self, id: MailingId) -> StoreFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                match state.mailings.get_mut(&id) {
                    Some(mailing) if mailing.status == MailingStatus::Sending => {
                        mailing.status = MailingStatus::Paused;
                        mailing.updated_at = Utc::now();
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn resume(&self, id: MailingId) -> StoreFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                match state.mailings.get_mut(&id) {
                    Some(mailing)
                        if matches!(
                            mailing.status,
                            MailingStatus::Paused | MailingStatus::Failed
                        ) =>
                    {
                        mailing.status = MailingStatus::Resume;
                        mailing.ended_at = None;
                        mailing.updated_at = Utc::now();
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn create(&self, new: NewMailing) -> StoreFuture<'_, MailingId> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut unique = HashSet::new();
                if let Some(duplicate) = new.recipients.iter().find(|chat| !unique.insert(**chat)) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "recipient {duplicate} listed twice"
                    )));
                }

                let mut state = state.write().await;
                let now = Utc::now();

                state.next_mailing_id += 1;
                let id = MailingId(state.next_mailing_id);

                for chat in new.recipients {
                    state.next_recipient_id += 1;
                    let recipient_id = RecipientId(state.next_recipient_id);
                    state.recipients.insert(
                        recipient_id,
                        MailingRecipient {
                            id: recipient_id,
                            mailing_id: id,
                            recipient_id: chat,
                            status: RecipientStatus::Created,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }

                state.mailings.insert(
                    id,
                    Mailing {
                        id,
                        message_ids: new.message_ids,
                        status: MailingStatus::Created,
                        scheduled_at: new.scheduled_at,
                        started_at: None,
                        ended_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );

                Ok(id)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use herald_core::models::{ChatId, MessageId};

    use super::{mock::MockMailingStore, *};

    fn new_mailing(scheduled_at: DateTime<Utc>, recipients: &[i64]) -> NewMailing {
        NewMailing {
            message_ids: vec![MessageId(10)],
            scheduled_at,
            recipients: recipients.iter().copied().map(ChatId).collect(),
        }
    }

    #[tokio::test]
    async fn claim_takes_only_due_claimable_mailings() {
        let store = MockMailingStore::new();
        let now = Utc::now();

        let due = store.create(new_mailing(now - ChronoDuration::minutes(1), &[1])).await.unwrap();
        let future = store.create(new_mailing(now + ChronoDuration::hours(1), &[2])).await.unwrap();
        let sent = store.create(new_mailing(now - ChronoDuration::minutes(2), &[3])).await.unwrap();
        store.set_status(sent, MailingStatus::Sent).await;

        let claimed = store.claim_due(now, 100).await.unwrap();

        assert_eq!(claimed, vec![due]);
        assert_eq!(store.mailing(due).await.unwrap().status, MailingStatus::Pending);
        assert_eq!(store.mailing(future).await.unwrap().status, MailingStatus::Created);
        assert_eq!(store.mailing(sent).await.unwrap().status, MailingStatus::Sent);
    }

    #[tokio::test]
    async fn claim_respects_limit_and_schedule_order() {
        let store = MockMailingStore::new();
        let now = Utc::now();

        let later = store.create(new_mailing(now - ChronoDuration::seconds(1), &[])).await.unwrap();
        let earlier =
            store.create(new_mailing(now - ChronoDuration::seconds(5), &[])).await.unwrap();

        assert_eq!(store.claim_due(now, 1).await.unwrap(), vec![earlier]);
        // PENDING stays claimable, so the next call returns both in order.
        assert_eq!(store.claim_due(now, 10).await.unwrap(), vec![earlier, later]);
    }

    #[tokio::test]
    async fn injected_claim_error_is_one_shot() {
        let store = MockMailingStore::new();
        store.inject_claim_error("connection reset").await;

        assert!(store.claim_due(Utc::now(), 10).await.is_err());
        assert!(store.claim_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_sending_keeps_first_started_at() {
        let store = MockMailingStore::new();
        let t0 = Utc::now();
        let id = store.create(new_mailing(t0, &[1])).await.unwrap();

        store.start_sending(id, t0).await.unwrap();
        store.mark_ended(id, t0 + ChronoDuration::seconds(1)).await.unwrap();
        store.start_sending(id, t0 + ChronoDuration::seconds(5)).await.unwrap();

        let mailing = store.mailing(id).await.unwrap();
        assert_eq!(mailing.started_at, Some(t0));
        assert_eq!(mailing.ended_at, None);
    }

    #[tokio::test]
    async fn ended_at_never_precedes_started_at() {
        let store = MockMailingStore::new();
        let t0 = Utc::now();
        let id = store.create(new_mailing(t0, &[1])).await.unwrap();

        store.start_sending(id, t0).await.unwrap();
        store.finish_sending(id, true, t0 - ChronoDuration::seconds(30)).await.unwrap();

        let mailing = store.mailing(id).await.unwrap();
        assert_eq!(mailing.status, MailingStatus::Sent);
        assert_eq!(mailing.ended_at, Some(t0));
    }

    #[tokio::test]
    async fn pause_and_resume_follow_the_operator_rules() {
        let store = MockMailingStore::new();
        let id = store.create(new_mailing(Utc::now(), &[1])).await.unwrap();

        assert!(!store.pause(id).await.unwrap());
        store.start_sending(id, Utc::now()).await.unwrap();
        assert!(store.pause(id).await.unwrap());
        assert!(store.resume(id).await.unwrap());
        assert_eq!(store.mailing(id).await.unwrap().status, MailingStatus::Resume);
        assert!(!store.resume(id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_recipients_are_rejected() {
        let store = MockMailingStore::new();
        let result = store.create(new_mailing(Utc::now(), &[5, 6, 5])).await;
        assert!(matches!(result, Err(herald_core::CoreError::ConstraintViolation(_))));
    }

    #[tokio::test]
    async fn pages_follow_id_order_and_status_filter() {
        let store = MockMailingStore::new();
        let id = store.create(new_mailing(Utc::now(), &[1, 2, 3, 4, 5])).await.unwrap();
        let all = store.recipients(id).await;

        store
            .update_recipient_status(vec![all[1].id], RecipientStatus::Sent)
            .await
            .unwrap();

        let page = store
            .page_recipients(id, RecipientStatus::READY.to_vec(), 2, 1)
            .await
            .unwrap();
        let chats: Vec<i64> = page.iter().map(|r| r.recipient_id.0).collect();
        assert_eq!(chats, vec![3, 4]);
    }
}
