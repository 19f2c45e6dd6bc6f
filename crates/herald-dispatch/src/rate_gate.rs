//! Shared send-rate gate.
//!
//! Every send takes a [`RatePermit`] first. Permits are counted in a sliding
//! window per quota key, and the count lives in a [`RateStore`]. With
//! [`RedisRateStore`] the window is shared by every dispatcher process on
//! every host that uses the same bot, which is what the Bot API limits.
//!
//! For any set of concurrent acquirers sharing a key, no `window`-length
//! interval contains more than `rate` grants.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use herald_core::Clock;
use rand::Rng;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::{DispatchError, Result},
    DEFAULT_THROTTLE_RATE, DEFAULT_THROTTLE_WINDOW_MS,
};

/// Prefix of every quota key.
pub const KEY_PREFIX: &str = "mailing:send:";

/// Answer of a rate store to one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The attempt was counted.
    Granted,
    /// The window is full; retry after at least this long.
    Wait(Duration),
}

/// Backing store for sliding-window counters.
pub trait RateStore: Send + Sync + 'static {
    /// Counts one acquisition under `key` if fewer than `rate` were counted
    /// in the trailing `window`. Check and insert are atomic.
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        rate: u32,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Admission>> + Send + 'a>>;
}

/// Sliding window over a sorted set, evaluated atomically inside Redis with
/// the server's own clock.
const SLIDING_WINDOW_LUA: &str = r"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local member = ARGV[3]

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
if redis.call('ZCARD', key) < rate then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    return 0
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local wait = tonumber(oldest[2]) + window - now
if wait < 1 then
    wait = 1
end
return wait
";

/// Rate store shared through Redis.
#[derive(Clone)]
pub struct RedisRateStore {
    connection: ConnectionManager,
    script: Arc<redis::Script>,
}

impl RedisRateStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::RateGate` if the URL is invalid or the first
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection))
    }

    /// Wraps an existing connection manager.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self { connection, script: Arc::new(redis::Script::new(SLIDING_WINDOW_LUA)) }
    }
}

impl fmt::Debug for RedisRateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisRateStore").finish_non_exhaustive()
    }
}

impl RateStore for RedisRateStore {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        rate: u32,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Admission>> + Send + 'a>> {
        let mut connection = self.connection.clone();
        Box::pin(async move {
            let member = format!("{}-{:016x}", std::process::id(), rand::random::<u64>());
            let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);

            let wait_ms: u64 = self
                .script
                .key(key)
                .arg(rate)
                .arg(window_ms)
                .arg(member)
                .invoke_async(&mut connection)
                .await?;

            Ok(if wait_ms == 0 {
                Admission::Granted
            } else {
                Admission::Wait(Duration::from_millis(wait_ms))
            })
        })
    }
}

/// Process-local rate store.
///
/// Suitable for a single dispatcher process and for tests; time comes from
/// the injected [`Clock`].
#[derive(Debug)]
pub struct MemoryRateStore {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MemoryRateStore {
    /// Creates an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, windows: Mutex::new(HashMap::new()) }
    }

    /// Applies one acquisition attempt at `now`.
    pub fn admit(&self, key: &str, rate: u32, window: Duration, now: Instant) -> Admission {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let log = windows.entry(key.to_string()).or_default();

        while log.front().is_some_and(|granted| now.saturating_duration_since(*granted) >= window) {
            log.pop_front();
        }

        if log.len() < rate as usize {
            log.push_back(now);
            return Admission::Granted;
        }

        match log.front() {
            Some(oldest) => {
                let wait = (*oldest + window).saturating_duration_since(now);
                Admission::Wait(wait.max(Duration::from_millis(1)))
            },
            // rate == 0: nothing is ever admitted.
            None => Admission::Wait(window),
        }
    }
}

impl RateStore for MemoryRateStore {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        rate: u32,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Admission>> + Send + 'a>> {
        let now = self.clock.now();
        Box::pin(std::future::ready(Ok(self.admit(key, rate, window, now))))
    }
}

/// Rate gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateGateConfig {
    /// Permits per window.
    pub rate: u32,
    /// Window length.
    pub window: Duration,
    /// Upper bound of the random delay added to each wait.
    pub max_jitter: Duration,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_THROTTLE_RATE,
            window: Duration::from_millis(DEFAULT_THROTTLE_WINDOW_MS),
            max_jitter: Duration::from_millis(25),
        }
    }
}

/// Proof that one send was admitted by the gate.
#[derive(Debug, Clone)]
pub struct RatePermit {
    key: String,
    granted_at: Instant,
}

impl RatePermit {
    /// Quota key the permit was counted under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Clock instant of the grant.
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

/// Cooperative gate in front of every send.
pub struct RateGate {
    store: Arc<dyn RateStore>,
    clock: Arc<dyn Clock>,
    config: RateGateConfig,
}

impl RateGate {
    /// Creates a gate over `store`.
    pub fn new(store: Arc<dyn RateStore>, clock: Arc<dyn Clock>, config: RateGateConfig) -> Self {
        Self { store, clock, config }
    }

    /// Returns the gate configuration.
    pub fn config(&self) -> &RateGateConfig {
        &self.config
    }

    /// Waits until the store admits one more send for `identity`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::RateGate` if the store fails, or
    /// `DispatchError::Configuration` if the configured rate is zero.
    pub async fn acquire(&self, identity: &str) -> Result<RatePermit> {
        if self.config.rate == 0 {
            return Err(DispatchError::configuration("throttle rate must be positive"));
        }

        let key = format!("{KEY_PREFIX}{identity}");
        let mut waits = 0u32;

        loop {
            match self.store.try_acquire(&key, self.config.rate, self.config.window).await? {
                Admission::Granted => {
                    if waits > 0 {
                        trace!(key = %key, waits, "rate permit granted after waiting");
                    }
                    return Ok(RatePermit { key, granted_at: self.clock.now() });
                },
                Admission::Wait(wait) => {
                    waits += 1;
                    let jitter = self.jitter();
                    self.clock.sleep(wait + jitter).await;
                },
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.config.max_jitter.as_micros()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=max))
    }
}
