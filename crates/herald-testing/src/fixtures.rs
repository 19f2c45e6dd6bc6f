//! Builders for mailing fixtures.

use chrono::{DateTime, Utc};
use herald_core::models::{
    ChatId, Mailing, MailingId, MailingRecipient, MailingStatus, MessageId, NewMailing,
    RecipientId, RecipientStatus,
};
use herald_dispatch::storage::mock::MockMailingStore;

/// Builder for a mailing and its recipients.
///
/// Defaults to a `PENDING` mailing scheduled now with one message (`10`) and
/// no recipients, i.e. the state the engine sees right after a claim.
#[derive(Debug, Clone)]
pub struct MailingBuilder {
    id: MailingId,
    message_ids: Vec<MessageId>,
    status: MailingStatus,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    recipients: Vec<(ChatId, RecipientStatus)>,
}

impl MailingBuilder {
    /// Starts a builder for mailing `id`.
    pub fn new(id: i64) -> Self {
        Self {
            id: MailingId(id),
            message_ids: vec![MessageId(10)],
            status: MailingStatus::Pending,
            scheduled_at: Utc::now(),
            started_at: None,
            ended_at: None,
            recipients: Vec::new(),
        }
    }

    /// Sets the forwarded messages.
    #[must_use]
    pub fn messages(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.message_ids = ids.into_iter().map(MessageId).collect();
        self
    }

    /// Sets the mailing status.
    #[must_use]
    pub fn status(mut self, status: MailingStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the schedule time.
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Sets `started_at`, as left by an earlier dispatch run.
    #[must_use]
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Sets `ended_at`.
    #[must_use]
    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    /// Adds `CREATED` recipients.
    #[must_use]
    pub fn recipients(mut self, chats: impl IntoIterator<Item = i64>) -> Self {
        self.recipients.extend(chats.into_iter().map(|c| (ChatId(c), RecipientStatus::Created)));
        self
    }

    /// Adds one recipient in a given status.
    #[must_use]
    pub fn recipient(mut self, chat: i64, status: RecipientStatus) -> Self {
        self.recipients.push((ChatId(chat), status));
        self
    }

    /// Builds the rows. Recipient ids are derived from the mailing id so
    /// several mailings can share one store.
    pub fn build(self) -> (Mailing, Vec<MailingRecipient>) {
        let now = Utc::now();
        let id = self.id;

        let recipients = self
            .recipients
            .into_iter()
            .zip(1i64..)
            .map(|((chat, status), n)| MailingRecipient {
                id: RecipientId(id.0 * 100_000 + n),
                mailing_id: id,
                recipient_id: chat,
                status,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let mailing = Mailing {
            id,
            message_ids: self.message_ids,
            status: self.status,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            created_at: now,
            updated_at: now,
        };

        (mailing, recipients)
    }

    /// Builds the producer-side input, ignoring id, status and timestamps.
    pub fn to_new_mailing(&self) -> NewMailing {
        NewMailing {
            message_ids: self.message_ids.clone(),
            scheduled_at: self.scheduled_at,
            recipients: self.recipients.iter().map(|(chat, _)| *chat).collect(),
        }
    }

    /// Inserts the rows into a mock store and returns the mailing id.
    pub async fn insert_into(self, store: &MockMailingStore) -> MailingId {
        let (mailing, recipients) = self.build();
        let id = mailing.id;
        store.insert(mailing, recipients).await;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_ids_follow_insertion_order() {
        let (mailing, recipients) = MailingBuilder::new(3).recipients([101, 102]).build();

        assert_eq!(mailing.status, MailingStatus::Pending);
        assert_eq!(recipients[0].id, RecipientId(300_001));
        assert_eq!(recipients[1].id, RecipientId(300_002));
        assert!(recipients.iter().all(|r| r.mailing_id == MailingId(3)));
    }

    #[test]
    fn new_mailing_keeps_messages_and_chats() {
        let new = MailingBuilder::new(1).messages([10, 11]).recipients([7]).to_new_mailing();
        assert_eq!(new.message_ids, vec![MessageId(10), MessageId(11)]);
        assert_eq!(new.recipients, vec![ChatId(7)]);
    }
}
