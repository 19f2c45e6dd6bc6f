//! Dependency graph of a herald process.
//!
//! Both the serving process and every `exec-job` child build their graph
//! here from configuration, so a child never shares state with its parent.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{storage::Storage, Clock, RealClock};
use herald_dispatch::{
    job_registry,
    rate_gate::{RateGate, RedisRateStore},
    DispatchContext, DispatchEngine, MailingStore, PostgresMailingStore, TelegramTransport,
};
use herald_supervisor::{InProcessSupervisor, TaskSupervisor};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::{Config, Isolation};

const MAX_CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Everything a dispatcher needs, built once per process.
pub struct AppContext {
    /// Database access.
    pub storage: Arc<Storage>,
    /// Mailing store over `storage`.
    pub store: Arc<dyn MailingStore>,
    /// Context handed to dispatch jobs.
    pub dispatch: DispatchContext,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
}

impl AppContext {
    /// Connects to Postgres and Redis and wires the dispatch engine.
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = connect_database(config).await?;
        let storage = Arc::new(Storage::new(pool));
        let store: Arc<dyn MailingStore> = Arc::new(PostgresMailingStore::new(storage.clone()));
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

        let rate_store = RedisRateStore::connect(&config.redis_url).await.with_context(|| {
            format!("failed to connect to redis at {}", config.redis_url_masked())
        })?;
        let gate =
            Arc::new(RateGate::new(Arc::new(rate_store), clock.clone(), config.to_gate_config()));

        let transport = Arc::new(
            TelegramTransport::new(config.to_telegram_config()?)
                .context("failed to create telegram transport")?,
        );

        let engine = Arc::new(DispatchEngine::new(
            store.clone(),
            transport,
            gate,
            clock.clone(),
            config.to_dispatch_config(),
        ));

        Ok(Self { storage, store, dispatch: DispatchContext { engine }, clock })
    }

    /// Builds the supervisor selected by `config.isolation`.
    ///
    /// Isolated children re-execute this binary with the same configuration
    /// file.
    pub fn supervisor(
        &self,
        config: &Config,
        config_path: &Path,
    ) -> Result<Arc<dyn TaskSupervisor>> {
        let shutdown = config.to_supervisor_config();

        match config.isolation {
            Isolation::InProcess => Ok(Arc::new(InProcessSupervisor::new(
                job_registry(),
                self.dispatch.clone(),
                shutdown,
            ))),
            #[cfg(unix)]
            Isolation::Process => {
                use herald_supervisor::{ChildCommand, ProcessSupervisor};

                let command = ChildCommand::current_exe("exec-job")
                    .context("failed to locate the herald executable")?
                    .arg("--config")
                    .arg(config_path);
                Ok(Arc::new(ProcessSupervisor::new(command, shutdown)))
            },
            #[cfg(not(unix))]
            Isolation::Process => {
                let _ = config_path;
                anyhow::bail!("process isolation is only available on unix")
            },
        }
    }
}

/// Creates the database pool, retrying while the server comes up.
pub async fn connect_database(config: &Config) -> Result<PgPool> {
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                Storage::new(pool.clone())
                    .health_check()
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_) if retries < MAX_CONNECT_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_CONNECT_RETRIES,
                    database_url = %config.database_url_masked(),
                    "database connection failed, retrying"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}
