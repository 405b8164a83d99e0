//! mirrorhost CLI
//!
//! Runs the replay service and inspects the task store. Replication and
//! re-linking are driven through `mirrorhost_core::lifecycle` by whatever
//! embeds the monitoring server clients.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mirrorhost_core::config::{Config, FaultConfig};
use mirrorhost_core::error::LifecycleError;
use mirrorhost_core::faults::FaultInjector;
use mirrorhost_core::filter::ItemFilter;
use mirrorhost_core::logging::init_logging;
use mirrorhost_core::replay::ReplayEngine;
use mirrorhost_core::scheduler::ReplayScheduler;
use mirrorhost_core::sink::{TelemetrySink, TrapperSink};
use mirrorhost_core::store::TaskStore;

#[derive(Parser, Debug)]
#[command(name = "mirrorhost", version, about = "Replicate monitoring hosts and replay their history")]
struct Cli {
    /// Configuration file (defaults to $MIRRORHOST_CONFIG, then the user config dir)
    #[arg(long, short, global = true, env = "MIRRORHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resume every registered replay job and tick until interrupted
    Serve,

    /// Show task status (all tasks, or one source host)
    Status {
        /// Source host id
        #[arg(long)]
        host: Option<String>,
    },

    /// Run a single replay tick for a source host now
    Tick {
        /// Source host id
        host: String,

        /// Send recorded values without fault injection
        #[arg(long)]
        no_faults: bool,
    },

    /// List persisted replay job registrations
    Jobs,

    /// Validate and print the resolved configuration
    ConfigCheck,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            config
        }
        None => Config::load()?,
    };
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<TaskStore> {
    let path = config.db_path();
    TaskStore::open(&path, &config.storage)
        .with_context(|| format!("opening task store at {}", path.display()))
}

fn build_engine(config: &Config, store: TaskStore, faults: &FaultConfig) -> Result<ReplayEngine> {
    let sink: Arc<dyn TelemetrySink> = Arc::new(TrapperSink::new(&config.sink)?);
    Ok(ReplayEngine::new(
        store,
        sink,
        Arc::new(FaultInjector::new(faults)),
        ItemFilter::from_config(&config.filter),
        config.replay.window(),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let engine = build_engine(config, store, &config.faults)?;
    let scheduler = ReplayScheduler::new(engine);

    let resumed = scheduler.resume().await?;
    info!(
        jobs = resumed,
        sink = %format!("{}:{}", config.sink.host, config.sink.port),
        "mirrorhost serving"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal; stopping");
    }
    info!("Shutdown requested");
    scheduler.shutdown().await;
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Status { host: Some(host) } => {
            let store = open_store(&config)?;
            let task = store
                .get(&host)
                .await?
                .ok_or_else(|| mirrorhost_core::Error::from(LifecycleError::TaskNotFound(host)))?;
            print_json(&task.summary())
        }
        Commands::Status { host: None } => {
            let store = open_store(&config)?;
            print_json(&store.summaries().await?)
        }
        Commands::Tick { host, no_faults } => {
            let store = open_store(&config)?;
            let faults = FaultConfig {
                enabled: config.faults.enabled && !no_faults,
                ..config.faults.clone()
            };
            let engine = build_engine(&config, store, &faults)?;
            print_json(&engine.tick(&host).await)
        }
        Commands::Jobs => {
            let store = open_store(&config)?;
            print_json(&store.list_jobs().await?)
        }
        Commands::ConfigCheck => {
            print_json(&serde_json::json!({
                "db_path": config.db_path(),
                "config": config,
            }))
        }
    }
}

fn report(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    if let Some(remediation) = err
        .downcast_ref::<mirrorhost_core::Error>()
        .and_then(mirrorhost_core::Error::remediation)
    {
        eprint!("{}", remediation.render_plain());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            report(&e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("warning: logging disabled: {e}");
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
