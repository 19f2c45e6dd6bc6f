//! Test infrastructure for the dispatch engine.
//!
//! Provides fixture builders for mailings, a scripted transport with
//! per-chat failure scripts and call recording, invariant checks, and a
//! [`DispatchHarness`] wiring the in-memory store, a [`TestClock`] and an
//! in-memory rate gate around a real [`DispatchEngine`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use herald_dispatch::{
    rate_gate::{MemoryRateStore, RateGate, RateGateConfig},
    storage::mock::MockMailingStore,
    DispatchConfig, DispatchEngine,
};

pub mod fixtures;
pub mod invariants;
pub mod transport;

pub use fixtures::MailingBuilder;
pub use herald_core::{Clock, TestClock};
pub use invariants::Invariants;
pub use transport::{Delivery, ScriptedTransport};

/// Bot identity used by harness transports.
pub const TEST_BOT: &str = "4242";

/// Engine wired to in-memory collaborators.
pub struct DispatchHarness {
    /// In-memory mailing store.
    pub store: Arc<MockMailingStore>,
    /// Shared virtual clock; rate-gate waits advance it.
    pub clock: TestClock,
    /// Scripted transport recording every delivery.
    pub transport: Arc<ScriptedTransport>,
    /// Gate in front of the transport.
    pub gate: Arc<RateGate>,
    /// Engine under test.
    pub engine: Arc<DispatchEngine>,
}

impl DispatchHarness {
    /// Creates a harness with default dispatch and throttle settings.
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default(), RateGateConfig::default())
    }

    /// Creates a harness with explicit settings. Jitter is disabled so runs
    /// are deterministic.
    pub fn with_config(dispatch: DispatchConfig, throttle: RateGateConfig) -> Self {
        let store = Arc::new(MockMailingStore::new());
        let clock = TestClock::new();
        let transport = Arc::new(ScriptedTransport::new(TEST_BOT));

        let throttle = RateGateConfig { max_jitter: std::time::Duration::ZERO, ..throttle };
        let gate = Arc::new(RateGate::new(
            Arc::new(MemoryRateStore::new(Arc::new(clock.clone()))),
            Arc::new(clock.clone()),
            throttle,
        ));

        let engine = Arc::new(DispatchEngine::new(
            store.clone(),
            transport.clone(),
            gate.clone(),
            Arc::new(clock.clone()),
            dispatch,
        ));

        Self { store, clock, transport, gate, engine }
    }
}

impl Default for DispatchHarness {
    fn default() -> Self {
        Self::new()
    }
}
