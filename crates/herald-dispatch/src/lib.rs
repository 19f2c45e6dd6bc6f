//! Mailing dispatch: claiming, sending and throttling.
//!
//! This crate turns due mailings into delivered messages. It is driven by a
//! periodic trigger and runs every mailing as an independent job under a
//! [`herald_supervisor::TaskSupervisor`].
//!
//! # Architecture
//!
//! 1. **Claim** - [`ClaimCoordinator::run_cycle`] locks due mailings with
//!    `FOR UPDATE SKIP LOCKED`, flips them to `PENDING` and submits one
//!    [`DispatchMailing`] job per id.
//! 2. **Dispatch** - [`DispatchEngine::dispatch`] validates the mailing,
//!    pages its recipients and fans every page out concurrently.
//! 3. **Throttle** - every send first takes a [`RatePermit`] from the
//!    [`RateGate`], whose sliding window lives in Redis and is shared by all
//!    dispatcher processes using the same bot.
//! 4. **Deliver** - the [`DeliveryTransport`] forwards the mailing's
//!    messages to one chat.
//!
//! Recipient failures are recorded per recipient and retried in a later
//! sweep; they never fail the mailing. Engine-level failures are contained
//! to the mailing that hit them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::RealClock;
//! use herald_dispatch::{
//!     rate_gate::{MemoryRateStore, RateGate, RateGateConfig},
//!     storage::mock::MockMailingStore,
//!     DispatchConfig, DispatchEngine, DeliveryTransport,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(transport: Arc<dyn DeliveryTransport>) -> herald_dispatch::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let gate = RateGate::new(
//!     Arc::new(MemoryRateStore::new(clock.clone())),
//!     clock.clone(),
//!     RateGateConfig::default(),
//! );
//! let engine = DispatchEngine::new(
//!     Arc::new(MockMailingStore::new()),
//!     transport,
//!     Arc::new(gate),
//!     clock,
//!     DispatchConfig::default(),
//! );
//!
//! let outcome = engine.dispatch(1.into(), CancellationToken::new()).await;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod job;
pub mod rate_gate;
pub mod storage;
pub mod transport;

pub use coordinator::{ClaimCoordinator, CycleReport};
pub use engine::{DispatchConfig, DispatchEngine, DispatchOutcome, DispatchStats, RejectReason};
pub use error::{DispatchError, ErrorCategory, Result};
pub use job::{job_registry, DispatchContext, DispatchMailing};
pub use rate_gate::{RateGate, RatePermit};
pub use storage::{MailingStore, PostgresMailingStore};
pub use transport::{DeliveryTransport, TelegramConfig, TelegramTransport};

/// Default number of recipients per page.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Default number of extra sweeps over failed recipients.
pub const DEFAULT_RETRY_PASSES: usize = 1;

/// Default maximum number of mailings claimed per cycle.
pub const DEFAULT_CLAIM_LIMIT: usize = 100;

/// Default number of sends admitted per window for one bot.
pub const DEFAULT_THROTTLE_RATE: u32 = 23;

/// Default length of the rate window in milliseconds.
pub const DEFAULT_THROTTLE_WINDOW_MS: u64 = 1000;
