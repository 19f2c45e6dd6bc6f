//! Mailing domain models and strongly-typed identifiers.
//!
//! A [`Mailing`] is one outbound campaign: an ordered list of Telegram message
//! references that get forwarded to every [`MailingRecipient`]. Identifiers
//! are `BIGINT` in the database and wrapped in newtypes here so a recipient
//! row id can never be passed where a chat id is expected.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! bigint_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <i64 as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl sqlx::postgres::PgHasArrayType for $name {
            fn array_type_info() -> PgTypeInfo {
                <i64 as sqlx::postgres::PgHasArrayType>::array_type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

bigint_id! {
    /// Identifier of a mailing campaign.
    MailingId
}

bigint_id! {
    /// Row identifier of a mailing recipient.
    ///
    /// Assigned in insertion order; recipient pages are ordered by it.
    RecipientId
}

bigint_id! {
    /// Telegram chat the messages are forwarded to.
    ChatId
}

bigint_id! {
    /// Telegram message id inside the service chat.
    MessageId
}

/// Error returned when a status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status: {0}")]
pub struct InvalidStatus(pub String);

/// Lifecycle state of a mailing.
///
/// ```text
/// CREATED ─┐
/// RESUME  ─┼─ claim ─> PENDING ─> SENDING ─┬─> SENT
/// PENDING ─┘                               ├─> FAILED
///                                          └─> PAUSED (operator)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MailingStatus {
    /// Created by a producer, waiting for `scheduled_at`.
    Created,
    /// Claimed by a dispatcher, not yet started.
    Pending,
    /// Re-armed by an operator; claimable again.
    Resume,
    /// A dispatch run is delivering batches.
    Sending,
    /// Stopped by an operator while sending.
    Paused,
    /// Every batch was processed.
    Sent,
    /// Rejected by validation or aborted by an engine error.
    Failed,
}

impl MailingStatus {
    /// Statuses the claim coordinator may pick up.
    pub const CLAIMABLE: [Self; 3] = [Self::Created, Self::Pending, Self::Resume];

    /// Textual representation stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Pending => "PENDING",
            Self::Resume => "RESUME",
            Self::Sending => "SENDING",
            Self::Paused => "PAUSED",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    /// Whether a claim cycle may select a mailing in this status.
    pub fn is_claimable(self) -> bool {
        Self::CLAIMABLE.contains(&self)
    }

    /// Whether this status ends a dispatch run for good.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for MailingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailingStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "PENDING" => Ok(Self::Pending),
            "RESUME" => Ok(Self::Resume),
            "SENDING" => Ok(Self::Sending),
            "PAUSED" => Ok(Self::Paused),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

impl sqlx::Type<PgDb> for MailingStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MailingStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Delivery state of a single recipient.
///
/// Uses the same textual values as [`MailingStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientStatus {
    /// Not attempted yet.
    Created,
    /// Messages were forwarded.
    Sent,
    /// Last attempt failed; retried while the mailing is sending.
    Failed,
}

impl RecipientStatus {
    /// Statuses that are still candidates for a send attempt.
    pub const READY: [Self; 2] = [Self::Created, Self::Failed];

    /// Textual representation stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipientStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

impl From<RecipientStatus> for MailingStatus {
    fn from(status: RecipientStatus) -> Self {
        match status {
            RecipientStatus::Created => Self::Created,
            RecipientStatus::Sent => Self::Sent,
            RecipientStatus::Failed => Self::Failed,
        }
    }
}

impl sqlx::Type<PgDb> for RecipientStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RecipientStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// One outbound campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Mailing {
    /// Unique identifier.
    pub id: MailingId,

    /// Messages to forward, in order, to every recipient.
    pub message_ids: Vec<MessageId>,

    /// Current lifecycle state.
    pub status: MailingStatus,

    /// Earliest time the mailing may be claimed.
    pub scheduled_at: DateTime<Utc>,

    /// When the first dispatch run began sending. Set at most once.
    pub started_at: Option<DateTime<Utc>>,

    /// When the current dispatch run stopped.
    pub ended_at: Option<DateTime<Utc>>,

    /// When the row was inserted.
    pub created_at: DateTime<Utc>,

    /// When the row was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Mailing {
    /// A mailing without messages can never be sent.
    pub fn has_messages(&self) -> bool {
        !self.message_ids.is_empty()
    }

    /// Whether a claim at `now` may select this mailing.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at <= now
    }
}

/// One addressee of a mailing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MailingRecipient {
    /// Row identifier, monotonically increasing with insertion.
    pub id: RecipientId,

    /// Owning mailing.
    pub mailing_id: MailingId,

    /// Telegram chat receiving the forwarded messages.
    pub recipient_id: ChatId,

    /// Delivery state.
    pub status: RecipientStatus,

    /// When the row was inserted.
    pub created_at: DateTime<Utc>,

    /// When the row was last modified.
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a mailing together with its recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMailing {
    /// Messages to forward.
    pub message_ids: Vec<MessageId>,

    /// Earliest claim time.
    pub scheduled_at: DateTime<Utc>,

    /// Addressees; duplicates are rejected by the store.
    pub recipients: Vec<ChatId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MailingStatus; 7] = [
        MailingStatus::Created,
        MailingStatus::Pending,
        MailingStatus::Resume,
        MailingStatus::Sending,
        MailingStatus::Paused,
        MailingStatus::Sent,
        MailingStatus::Failed,
    ];

    #[test]
    fn status_text_matches_parse() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<MailingStatus>(), Ok(status));
        }
        assert!("sending".parse::<MailingStatus>().is_err());
    }

    #[test]
    fn only_created_pending_and_resume_are_claimable() {
        let claimable: Vec<_> = ALL.into_iter().filter(|s| s.is_claimable()).collect();
        assert_eq!(claimable, MailingStatus::CLAIMABLE.to_vec());
    }

    #[test]
    fn terminal_statuses() {
        assert!(MailingStatus::Sent.is_terminal());
        assert!(MailingStatus::Failed.is_terminal());
        assert!(!MailingStatus::Paused.is_terminal());
        assert!(!MailingStatus::Sending.is_terminal());
    }

    #[test]
    fn recipient_statuses_share_mailing_text() {
        for status in [RecipientStatus::Created, RecipientStatus::Sent, RecipientStatus::Failed] {
            assert_eq!(status.as_str(), MailingStatus::from(status).as_str());
        }
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&MailingId(42)).unwrap();
        assert_eq!(json, "42");
        assert_eq!(serde_json::to_string(&MailingStatus::Resume).unwrap(), "\"RESUME\"");
    }

    #[test]
    fn due_requires_claimable_status_and_schedule() {
        let now = Utc::now();
        let mut mailing = Mailing {
            id: MailingId(1),
            message_ids: vec![MessageId(10)],
            status: MailingStatus::Created,
            scheduled_at: now,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(mailing.is_due(now));
        assert!(!mailing.is_due(now - chrono::Duration::seconds(1)));

        mailing.status = MailingStatus::Sending;
        assert!(!mailing.is_due(now));
    }
}
