use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cacheout::api::{self, ApiState};
use cacheout::config::{CoordinatorConfig, PricingConfig};
use cacheout::coordinator::Coordinator;
use cacheout::ledger::Credits;
use cacheout::reaper::Reaper;
use cacheout::shutdown::install_shutdown_handler;
use cacheout::store::{FileStore, MemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "cacheout")]
#[command(version)]
#[command(about = "Coordinator for a credit-based compute marketplace")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator and its HTTP API
    Serve(ServeArgs),
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address for the HTTP API
    #[arg(long, env = "CACHEOUT_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Directory holding the durable state file. In-memory only when omitted.
    #[arg(long, env = "CACHEOUT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Bearer token for admin routes (submit, transfer, award)
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    admin_token: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "CACHEOUT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Credits granted to an account on first reference
    #[arg(long, env = "CACHEOUT_STARTING_CREDITS", default_value_t = 100.0)]
    starting_credits: f64,

    #[arg(long, env = "CACHEOUT_COST_PER_CORE", default_value_t = 0.1)]
    cost_per_core: f64,

    #[arg(long, env = "CACHEOUT_COST_PER_100MB_RAM", default_value_t = 0.001)]
    cost_per_100mb_ram: f64,

    /// Seconds without a heartbeat before a worker is reaped
    #[arg(long, env = "CACHEOUT_WORKER_TIMEOUT_SECS", default_value_t = 60)]
    worker_timeout_secs: u64,

    #[arg(long, env = "CACHEOUT_REAPER_INTERVAL_SECS", default_value_t = 10)]
    reaper_interval_secs: u64,

    /// Maximum number of pending + running jobs
    #[arg(long, env = "CACHEOUT_MAX_QUEUE_SIZE", default_value_t = 1000)]
    max_queue_size: usize,

    #[arg(long, env = "CACHEOUT_MAX_WORKERS", default_value_t = 100)]
    max_workers: usize,

    #[arg(long, env = "CACHEOUT_JOB_TIMEOUT_SECS", default_value_t = 3600)]
    job_timeout_secs: u64,

    /// Minutes of waiting worth one priority step
    #[arg(long, env = "CACHEOUT_SCHEDULING_EPOCH_MINS", default_value_t = 60)]
    scheduling_epoch_mins: u64,

    #[arg(long, env = "CACHEOUT_STORAGE_TIMEOUT_MS", default_value_t = 5000)]
    storage_timeout_ms: u64,

    /// Days finished jobs and ledger entries are kept
    #[arg(long, env = "CACHEOUT_HISTORY_RETENTION_DAYS", default_value_t = 7)]
    history_retention_days: u64,
}

fn credits_arg(name: &str, value: f64) -> Result<Credits, Box<dyn std::error::Error>> {
    Credits::from_credits(value)
        .ok_or_else(|| format!("--{name} must be a non-negative number, got {value}").into())
}

impl ServeArgs {
    fn coordinator_config(&self) -> Result<CoordinatorConfig, Box<dyn std::error::Error>> {
        let pricing = PricingConfig {
            cost_per_core: credits_arg("cost-per-core", self.cost_per_core)?,
            cost_per_100mb_ram: credits_arg("cost-per-100mb-ram", self.cost_per_100mb_ram)?,
        };
        Ok(CoordinatorConfig::default()
            .with_starting_credits(credits_arg("starting-credits", self.starting_credits)?)
            .with_pricing(pricing)
            .with_worker_timeout(Duration::from_secs(self.worker_timeout_secs))
            .with_reaper_interval(Duration::from_secs(self.reaper_interval_secs.max(1)))
            .with_max_queue_size(self.max_queue_size)
            .with_max_workers(self.max_workers)
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs))
            .with_scheduling_epoch(Duration::from_secs(self.scheduling_epoch_mins * 60))
            .with_storage_timeout(Duration::from_millis(self.storage_timeout_ms))
            .with_history_retention(Duration::from_secs(
                self.history_retention_days.saturating_mul(24 * 3600),
            )))
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    if args.admin_token.trim().is_empty() {
        return Err("ADMIN_TOKEN must not be empty".into());
    }

    let config = args.coordinator_config()?;
    let store: Arc<dyn Store> = match &args.data_dir {
        Some(dir) => Arc::new(FileStore::open(dir).await?),
        None => {
            tracing::warn!("No --data-dir given, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    tracing::info!(
        listen = %args.listen,
        data_dir = ?args.data_dir,
        starting_credits = %config.starting_credits,
        worker_timeout = ?config.worker_timeout,
        max_queue_size = config.max_queue_size,
        max_workers = config.max_workers,
        "Starting cacheout coordinator"
    );

    let coordinator = Arc::new(Coordinator::open(store, config).await?);
    let shutdown = install_shutdown_handler()?;

    let reaper = tokio::spawn(Reaper::new(coordinator.clone()).run(shutdown.clone()));

    let state = ApiState::new(coordinator, args.admin_token);
    let served = api::serve(args.listen, state, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = reaper.await {
        tracing::error!(error = %e, "Reaper task panicked");
    }
    served?;

    tracing::info!("Coordinator stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
    }
}
