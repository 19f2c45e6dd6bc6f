//! Core domain types for the herald mailing engine.
//!
//! Provides strongly-typed identifiers, mailing and recipient entities with
//! their status machines, the storage error taxonomy, a clock abstraction for
//! deterministic tests, and the PostgreSQL repositories that back the
//! dispatch pipeline.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    ChatId, Mailing, MailingId, MailingRecipient, MailingStatus, MessageId, NewMailing,
    RecipientId, RecipientStatus,
};
pub use time::{Clock, RealClock, TestClock};
