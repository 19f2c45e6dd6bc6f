//! Configuration for the herald service.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_core::models::ChatId;
use herald_dispatch::{
    rate_gate::RateGateConfig, DispatchConfig, TelegramConfig, DEFAULT_BATCH_SIZE,
    DEFAULT_CLAIM_LIMIT, DEFAULT_RETRY_PASSES, DEFAULT_THROTTLE_RATE, DEFAULT_THROTTLE_WINDOW_MS,
};
use herald_supervisor::ShutdownConfig;
use serde::{Deserialize, Serialize};

/// Default configuration file, relative to the working directory.
pub const CONFIG_FILE: &str = "herald.toml";

/// Prefix of environment overrides, e.g. `HERALD_DATABASE_URL`.
pub const ENV_PREFIX: &str = "HERALD_";

/// How dispatch jobs are isolated from the serving process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One child process per job.
    Process,
    /// One tokio task per job.
    InProcess,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Complete service configuration.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed with `HERALD_` (highest)
/// 2. Configuration file (`herald.toml` unless overridden)
/// 3. Built-in defaults (lowest)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of pooled database connections.
    pub database_max_connections: u32,

    // Rate gate
    /// Redis URL of the shared rate window.
    pub redis_url: String,
    /// Sends admitted per window for one bot.
    pub throttle_rate: u32,
    /// Rate window length in milliseconds.
    pub throttle_window_ms: u64,

    // Telegram
    /// Bot token, `<bot id>:<secret>`.
    pub telegram_bot_token: String,
    /// Chat holding the messages to forward.
    pub telegram_service_chat_id: i64,
    /// Bot API base URL.
    pub telegram_api_url: String,
    /// Bot API request timeout in seconds.
    pub telegram_timeout_secs: u64,

    // Dispatch
    /// Recipients per page.
    pub batch_size: usize,
    /// Extra sweeps over failed recipients.
    pub retry_passes: usize,
    /// Mailings claimed per cycle.
    pub claim_limit: usize,
    /// Seconds between claim cycles in `serve`.
    pub cycle_interval_secs: u64,

    // Supervisor
    /// Job isolation strategy.
    pub isolation: Isolation,
    /// Time granted to jobs after a polite stop request, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Time granted to jobs after a forced stop, in milliseconds.
    pub kill_timeout_ms: u64,

    // Logging
    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from defaults, `path` and `HERALD_*` variables.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Converts to dispatch engine settings.
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig { batch_size: self.batch_size, retry_passes: self.retry_passes }
    }

    /// Converts to rate gate settings.
    pub fn to_gate_config(&self) -> RateGateConfig {
        RateGateConfig {
            rate: self.throttle_rate,
            window: Duration::from_millis(self.throttle_window_ms),
            ..RateGateConfig::default()
        }
    }

    /// Converts to supervisor shutdown settings.
    pub fn to_supervisor_config(&self) -> ShutdownConfig {
        ShutdownConfig {
            timeout: Duration::from_millis(self.shutdown_timeout_ms),
            kill_timeout: Duration::from_millis(self.kill_timeout_ms),
        }
    }

    /// Converts to Telegram transport settings.
    ///
    /// # Errors
    ///
    /// Returns error if the bot token or service chat is not configured.
    pub fn to_telegram_config(&self) -> Result<TelegramConfig> {
        if self.telegram_bot_token.is_empty() {
            anyhow::bail!("telegram_bot_token is not set (HERALD_TELEGRAM_BOT_TOKEN)");
        }
        if self.telegram_service_chat_id == 0 {
            anyhow::bail!("telegram_service_chat_id is not set (HERALD_TELEGRAM_SERVICE_CHAT_ID)");
        }

        Ok(TelegramConfig {
            api_url: self.telegram_api_url.clone(),
            timeout: Duration::from_secs(self.telegram_timeout_secs),
            ..TelegramConfig::new(
                self.telegram_bot_token.clone(),
                ChatId(self.telegram_service_chat_id),
            )
        })
    }

    /// Interval of the periodic claim cycle.
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        mask_password(&self.database_url)
    }

    /// Redis URL with the password masked for logging.
    pub fn redis_url_masked(&self) -> String {
        mask_password(&self.redis_url)
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.throttle_rate == 0 {
            anyhow::bail!("throttle_rate must be greater than 0");
        }

        if self.throttle_window_ms == 0 {
            anyhow::bail!("throttle_window_ms must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.claim_limit == 0 {
            anyhow::bail!("claim_limit must be greater than 0");
        }

        if self.cycle_interval_secs == 0 {
            anyhow::bail!("cycle_interval_secs must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/herald".to_string(),
            database_max_connections: 10,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            throttle_rate: DEFAULT_THROTTLE_RATE,
            throttle_window_ms: DEFAULT_THROTTLE_WINDOW_MS,
            telegram_bot_token: String::new(),
            telegram_service_chat_id: 0,
            telegram_api_url: TelegramConfig::DEFAULT_API_URL.to_string(),
            telegram_timeout_secs: 30,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_passes: DEFAULT_RETRY_PASSES,
            claim_limit: DEFAULT_CLAIM_LIMIT,
            cycle_interval_secs: 60,
            isolation: Isolation::Process,
            shutdown_timeout_ms: 5_000,
            kill_timeout_ms: 1_000,
            log_format: LogFormat::Pretty,
        }
    }
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // `scheme://host@...` has no password, only the scheme colon.
            if !url[colon_pos..].starts_with("://") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}
