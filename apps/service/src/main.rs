mod config;
mod database;
mod pool;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use probe_engine::{
    AssetRepository, ConfigStore, HistoryStore, LivenessProbe, ProbeEvent, RoundOutcome, Scheduler,
};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::DatabaseImpl;
use crate::database::models::NewAsset;

const POOL_SIZE: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "assetpulse", version, about = "Liveness prober for network assets")]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/assetpulse/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe all assets in a loop until Ctrl-C
    Run {
        /// Fixed wait between rounds, overriding the stored probe_interval
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Probe all assets once
    Once,
    /// Print recorded round history, oldest first
    History {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print per-region asset counts
    Regions {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Read or write live probe settings
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Manage the asset table
    #[command(subcommand)]
    Assets(AssetsCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    /// Show the static config file in use
    Show,
}

#[derive(Subcommand, Debug)]
enum AssetsCommand {
    Add {
        #[arg(long)]
        host: String,
        #[arg(long)]
        ip: String,
        /// Omit for ICMP
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        protocol: String,
        #[arg(long)]
        region: Option<String>,
    },
    List,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init_with_level(logger::level_for_verbosity(cli.verbose));

    let config = Config::from_config(cli.config.as_ref()).context("loading config")?;
    debug!("{}", config);

    let pool = pool::open_pool(&config.database.path, POOL_SIZE)
        .await
        .with_context(|| format!("opening database {}", config.database.path))?;
    {
        let conn = pool.get().await?;
        database::initialize_database(&conn).await?;
    }
    let db = Arc::new(DatabaseImpl::new_from_pool(pool));

    match cli.command {
        Command::Run { interval_ms } => run_loop(&config, db, interval_ms.map(Duration::from_millis)).await,
        Command::Once => run_once(&config, db).await,
        Command::History { limit } => print_json(&db.list(limit).await?),
        Command::Regions { limit } => print_json(&db.region_stats(limit).await?),
        Command::Config(ConfigCommand::Get { key }) => {
            match db.get(&key).await? {
                Some(value) => println!("{value}"),
                None => warn!(key = %key, "No value stored"),
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            db.set_config(&key, &value).await?;
            info!(key = %key, value = %value, "Config updated");
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            print!("{config}");
            Ok(())
        }
        Command::Assets(AssetsCommand::Add { host, ip, port, protocol, region }) => {
            let id = db.add_asset(&NewAsset { host, ip, port, protocol, region }).await?;
            info!(asset_id = id, "Asset added");
            Ok(())
        }
        Command::Assets(AssetsCommand::List) => print_json(&db.list_all().await?),
        Command::Assets(AssetsCommand::Clear) => {
            let removed = db.clear_assets().await?;
            info!(removed, "Assets cleared");
            Ok(())
        }
    }
}

fn build_scheduler(config: &Config, db: Arc<DatabaseImpl>) -> Result<Scheduler> {
    let probe = Arc::new(LivenessProbe::new()?);
    Ok(Scheduler::new(probe, db.clone(), db.clone(), db, config.probe_defaults()))
}

async fn run_loop(config: &Config, db: Arc<DatabaseImpl>, interval: Option<Duration>) -> Result<()> {
    let scheduler = build_scheduler(config, db)?;
    let events = tokio::spawn(log_events(scheduler.subscribe()));

    scheduler.start(interval).await?;
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    scheduler.stop();
    events.abort();

    info!(status = ?scheduler.status(), "Shut down");
    Ok(())
}

async fn run_once(config: &Config, db: Arc<DatabaseImpl>) -> Result<()> {
    let scheduler = build_scheduler(config, db)?;
    let events = tokio::spawn(log_events(scheduler.subscribe()));

    let outcome = scheduler.run_once().await?;
    events.abort();

    match outcome {
        RoundOutcome::Completed { token, snapshot } => {
            info!(%token, "Round completed");
            print_json(&snapshot)
        }
        RoundOutcome::Cancelled { token, snapshot } => {
            warn!(%token, processed = snapshot.processed, "Round cancelled");
            print_json(&snapshot)
        }
        RoundOutcome::AlreadyRunning => {
            warn!("A round was already running");
            Ok(())
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<ProbeEvent>) {
    loop {
        match rx.recv().await {
            Ok(ProbeEvent::Progress(snapshot)) => {
                debug!(processed = snapshot.processed, total = snapshot.total, alive = snapshot.alive, "Progress")
            }
            Ok(ProbeEvent::Status { running }) => info!(running, "Scheduler status"),
            Ok(ProbeEvent::AssetUpdated(asset)) => debug!(
                asset_id = asset.id,
                host = %asset.host,
                protocol = %asset.protocol,
                status = %asset.status,
                "Asset checked"
            ),
            Ok(ProbeEvent::ProbeFault { asset_id, message }) => warn!(asset_id, "Probe fault: {}", message),
            Ok(ProbeEvent::RoundComplete { total, alive }) => info!(total, alive, "Round complete"),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event log lagging"),
            Err(RecvError::Closed) => {
                error!("Event bus closed");
                break;
            }
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
