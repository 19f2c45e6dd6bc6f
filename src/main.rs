//! herald mailing dispatch service.
//!
//! Claims due mailings on a fixed cadence and runs each one as a supervised
//! dispatch job that forwards the mailing's messages to every recipient
//! through the Telegram Bot API.

mod config;
mod context;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use herald_core::storage::Storage;
use herald_dispatch::{job_registry, ClaimCoordinator};
use herald_supervisor::{child::run_request, InProcessSupervisor, JobRequest, TaskSupervisor};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{
    config::{Config, LogFormat, CONFIG_FILE},
    context::{connect_database, AppContext},
};

const DEFAULT_LOG_FILTER: &str = "info,herald=debug";

#[derive(Debug, Parser)]
#[command(name = "herald", version, about = "Claims due mailings and delivers them")]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, env = "HERALD_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run claim cycles on a fixed interval until SIGINT or SIGTERM
    Serve,
    /// Run a single claim cycle and wait for its dispatch jobs
    Cycle,
    /// Create the database schema
    Migrate,
    /// Run one job; entry point of isolated child processes
    #[command(hide = true)]
    ExecJob {
        /// Registered job name
        #[arg(long)]
        name: String,
        /// JSON payload
        #[arg(long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(config.log_format);

    match cli.command {
        Command::Serve => serve(&config, &cli.config).await,
        Command::Cycle => cycle(&config).await,
        Command::Migrate => migrate(&config).await,
        Command::ExecJob { name, payload } => exec_job(&config, name, &payload).await,
    }
}

/// Initializes tracing; `RUST_LOG` overrides the default filter.
fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_current_span(true).with_target(true)).init();
        },
        LogFormat::Pretty => {
            registry
                .with(fmt::layer().with_target(true).with_file(true).with_line_number(true))
                .init();
        },
    }
}

async fn serve(config: &Config, config_path: &std::path::Path) -> Result<()> {
    info!(
        database_url = %config.database_url_masked(),
        redis_url = %config.redis_url_masked(),
        isolation = ?config.isolation,
        interval_secs = config.cycle_interval_secs,
        "starting herald"
    );

    let app = AppContext::build(config).await?;
    let supervisor = app.supervisor(config, config_path)?;
    let coordinator =
        ClaimCoordinator::new(app.store.clone(), supervisor.clone(), app.clock.clone())
            .with_claim_limit(config.claim_limit);

    let stop = install_signal_handler(supervisor.clone(), config)?;

    let mut ticker = tokio::time::interval(config.cycle_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("herald is dispatching");
    loop {
        tokio::select! {
            () = stop.requested.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = coordinator.run_cycle().await {
                    error!(error = %error, "claim cycle failed");
                }
            },
        }
    }

    info!(active = supervisor.active(), "shutdown requested, stopping dispatch jobs");
    stop.finished().await;

    app.storage.pool().close().await;
    info!("herald shutdown complete");
    Ok(())
}

/// Shutdown hook of the serving process.
struct ShutdownHook {
    requested: tokio_util::sync::CancellationToken,
    #[cfg(unix)]
    handler: herald_supervisor::SignalHandler,
    #[cfg(not(unix))]
    supervisor: Arc<dyn TaskSupervisor>,
    #[cfg(not(unix))]
    timeout: Duration,
}

impl ShutdownHook {
    async fn finished(self) {
        #[cfg(unix)]
        self.handler.finished().await;

        #[cfg(not(unix))]
        {
            let report = self.supervisor.shutdown(self.timeout).await;
            info!(stopped = report.total(), forced = report.forced(), "supervisor stopped");
        }
    }
}

#[cfg(unix)]
fn install_signal_handler(
    supervisor: Arc<dyn TaskSupervisor>,
    config: &Config,
) -> Result<ShutdownHook> {
    let handler = herald_supervisor::SignalHandler::install(
        supervisor,
        config.to_supervisor_config().timeout,
    )
    .context("failed to install signal handlers")?;

    Ok(ShutdownHook { requested: handler.shutdown_requested(), handler })
}

#[cfg(not(unix))]
fn install_signal_handler(
    supervisor: Arc<dyn TaskSupervisor>,
    config: &Config,
) -> Result<ShutdownHook> {
    let requested = tokio_util::sync::CancellationToken::new();
    let token = requested.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    Ok(ShutdownHook { requested, supervisor, timeout: config.to_supervisor_config().timeout })
}

async fn cycle(config: &Config) -> Result<()> {
    let app = AppContext::build(config).await?;
    let supervisor = Arc::new(InProcessSupervisor::new(
        job_registry(),
        app.dispatch.clone(),
        config.to_supervisor_config(),
    ));
    let coordinator =
        ClaimCoordinator::new(app.store.clone(), supervisor.clone(), app.clock.clone())
            .with_claim_limit(config.claim_limit);

    let report = coordinator.run_cycle().await?;

    let drained = async {
        while supervisor.active() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::select! {
        () = drained => {},
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping dispatch jobs");
            let stopped = supervisor.shutdown(config.to_supervisor_config().timeout).await;
            info!(stopped = stopped.total(), forced = stopped.forced(), "dispatch jobs stopped");
        },
    }

    info!(
        claimed = report.claimed,
        submitted = report.submitted,
        reverted = report.reverted,
        "cycle complete"
    );
    app.storage.pool().close().await;
    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    let pool = connect_database(config).await?;
    let storage = Storage::new(pool);
    storage.migrate().await.context("failed to create schema")?;
    info!(database_url = %config.database_url_masked(), "schema ready");
    storage.pool().close().await;
    Ok(())
}

/// Child entry point. A returned error becomes a non-zero exit status,
/// which the parent's watcher logs.
async fn exec_job(config: &Config, name: String, payload: &str) -> Result<()> {
    let payload = serde_json::from_str(payload).context("job payload is not valid JSON")?;
    let app = AppContext::build(config).await?;

    let request = JobRequest { name, payload };
    let result = run_request(&job_registry(), app.dispatch.clone(), request).await;
    app.storage.pool().close().await;
    result
}
