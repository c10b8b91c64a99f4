//! ORBIT Node
//!
//! Validates the ORBIT token ledger from a chain node's blocks.
//! Runs one-shot sync commands, a continuous sync daemon, and the read-only
//! web API over the committed ledger.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orbit_api::ApiServer;
use orbit_chain::RpcChainSource;
use orbit_ledger::{
    stop_signal, BlockProcessor, BlockSummary, LedgerStore, ProcessorConfig, SyncHandle,
    SyncWorker,
};
use orbit_protocol::EnvelopeCodec;
use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{ConfigKey, NodeConfig, LEDGER_DB};

/// ORBIT token ledger node
#[derive(Parser, Debug)]
#[command(name = "orbit-node")]
#[command(about = "Validate and serve the ORBIT token ledger", long_about = None)]
struct Cli {
    /// Configuration and data directory
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show or change a configuration value
    Config {
        key: ConfigKey,
        value: Option<String>,
    },
    /// Show chain and ledger sync status
    Info,
    /// Process the next block
    Next,
    /// Process every available block
    All,
    /// Sync continuously and serve the web API
    Daemon {
        /// Only sync, do not start the web API
        #[arg(long)]
        no_webapi: bool,
    },
    /// Serve the web API only
    Webapi,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dir = match cli.config_dir {
        Some(dir) => dir,
        None => NodeConfig::default_dir()?,
    };
    let config = NodeConfig::load(&dir)?;

    let result = match cli.command {
        Command::Config { key, value } => run_config(&dir, config, key, value),
        Command::Info => run_info(&dir, &config).await,
        Command::Next => run_next(&dir, &config).await,
        Command::All => run_all(&dir, &config).await,
        Command::Daemon { no_webapi } => run_daemon(&dir, &config, !no_webapi).await,
        Command::Webapi => run_webapi(&dir, &config).await,
    };

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}

fn open_store(dir: &Path) -> Result<Arc<LedgerStore>> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LEDGER_DB);
    let store = LedgerStore::open(&path)
        .with_context(|| format!("Failed to open ledger at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_processor(dir: &Path, config: &NodeConfig) -> Result<Arc<BlockProcessor>> {
    let source = RpcChainSource::new(
        config.rpc_url()?,
        Duration::from_secs(config.rpc_timeout_secs),
    )?;
    tracing::debug!("Chain source at {}", source.endpoint());

    Ok(Arc::new(BlockProcessor::new(
        open_store(dir)?,
        Arc::new(source),
        Arc::new(EnvelopeCodec),
        ProcessorConfig {
            launch_height: config.launch_height(),
            network: config.network,
        },
    )))
}

fn print_summary(summary: &BlockSummary) {
    println!(
        "block {} ({}): {} txs, {} applied, {} voided, {} payments",
        summary.height,
        summary.hash,
        summary.transactions,
        summary.applied,
        summary.voided,
        summary.payments
    );
    println!("    digest {}", summary.digest);
}

fn print_info(processor: &BlockProcessor) {
    println!("{}", processor.info());
    let committed_at = processor.store().committed().committed_at();
    if let Some(at) = committed_at.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)) {
        println!("last commit:          {}", at.to_rfc3339());
    }
}

fn run_config(dir: &Path, mut config: NodeConfig, key: ConfigKey, value: Option<String>) -> Result<()> {
    match value {
        Some(value) => {
            config.set(key, &value)?;
            config.save(dir)?;
            println!("{:?} set to {}", key, value.trim());
        }
        None => match config.get(key) {
            Some(value) => println!("{}", value),
            None => println!("{:?} is not set", key),
        },
    }
    Ok(())
}

async fn run_info(dir: &Path, config: &NodeConfig) -> Result<()> {
    let processor = build_processor(dir, config)?;
    processor.refresh().await?;
    print_info(&processor);
    Ok(())
}

async fn run_next(dir: &Path, config: &NodeConfig) -> Result<()> {
    let processor = build_processor(dir, config)?;
    processor.refresh().await?;
    match processor.next().await? {
        Some(summary) => print_summary(&summary),
        None => println!("No more blocks"),
    }
    Ok(())
}

async fn run_all(dir: &Path, config: &NodeConfig) -> Result<()> {
    let processor = build_processor(dir, config)?;
    processor.refresh().await?;

    let mut processed = 0u64;
    while let Some(summary) = processor.next().await? {
        print_summary(&summary);
        processed += 1;
    }
    println!("No more blocks ({} processed)", processed);
    Ok(())
}

async fn run_webapi(dir: &Path, config: &NodeConfig) -> Result<()> {
    let store = open_store(dir)?;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    ApiServer::new(store)
        .run(&config.webapi_addr(), shutdown)
        .await
}

async fn run_daemon(dir: &Path, config: &NodeConfig, webapi: bool) -> Result<()> {
    let processor = build_processor(dir, config)?;
    let worker = SyncWorker::spawn(
        processor.clone(),
        Duration::from_secs(config.poll_interval_secs),
    );

    let (api_stop, mut api_signal) = stop_signal();
    let api = webapi.then(|| {
        let server = ApiServer::new(processor.store().clone());
        let addr = config.webapi_addr();
        tokio::spawn(async move {
            let shutdown = async move { while !api_signal.wait(Duration::from_secs(60)).await {} };
            server.run(&addr, shutdown).await
        })
    });

    if std::io::stdin().is_terminal() {
        println!("Daemon running: 'i' + Enter for info, 'q' + Enter to quit, Ctrl-C to exit now");
        interactive(&processor, &worker).await?;
    } else {
        wait_for_interrupt(&worker).await?;
    }

    println!("Stopping after the current block...");
    let synced = worker.stop().await;
    api_stop.stop();
    if let Some(api) = api {
        api.await.context("Web API task failed")??;
    }

    let processed = synced?;
    tracing::info!("Daemon stopped after {} blocks", processed);
    Ok(())
}

/// Until `q`, end of input, or the worker ending on its own
async fn interactive(processor: &BlockProcessor, worker: &SyncHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while !worker.is_finished() {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match line.trim() {
                    "i" => print_info(processor),
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command '{}': 'i' for info, 'q' to quit", other),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                std::process::exit(130);
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    Ok(())
}

/// Until Ctrl-C or the worker ending on its own
async fn wait_for_interrupt(worker: &SyncHandle) -> Result<()> {
    while !worker.is_finished() {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    Ok(())
}
