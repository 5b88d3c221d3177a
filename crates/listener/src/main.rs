//! bridge-listener: scan the source chain for TokensLocked events and notify the relayer.
//!
//! Configuration comes from the environment (SOURCE_CHAIN_RPC_URL, BRIDGE_CONTRACT_ADDRESS,
//! RELAYER_API_ENDPOINT, ...), optionally seeded from a `.env` file; flags override it.
//!
//! Usage:
//!
//!   bridge-listener [--rpc-url URL] [--contract 0x...] [--relayer URL] [--state-file PATH]
//!                   [--start-block N] [--depth K] [--poll-secs S]
//!
//! Ctrl-C stops the loop after the in-flight event and flushes the state file.

use anyhow::{Context, Result};
use listener::{Coordinator, ListenerConfig, Shutdown};
use std::collections::HashMap;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: bridge-listener [--rpc-url URL] [--contract 0xADDR] [--relayer URL] \
[--state-file PATH] [--start-block N] [--depth K] [--poll-secs S]\n\
Settings not given as flags are read from the environment \
(SOURCE_CHAIN_RPC_URL, BRIDGE_CONTRACT_ADDRESS, RELAYER_API_ENDPOINT, STATE_FILE, START_BLOCK, \
CONFIRMATION_BLOCKS, POLL_INTERVAL_SECONDS, ...).";

fn parse_flags(args: &[String]) -> HashMap<String, String> {
    let mut flags = HashMap::new();
    let mut i = 1;
    while i < args.len() {
        let key = match args[i].as_str() {
            "--rpc-url" => "SOURCE_CHAIN_RPC_URL",
            "--contract" => "BRIDGE_CONTRACT_ADDRESS",
            "--relayer" => "RELAYER_API_ENDPOINT",
            "--state-file" => "STATE_FILE",
            "--start-block" => "START_BLOCK",
            "--depth" => "CONFIRMATION_BLOCKS",
            "--poll-secs" => "POLL_INTERVAL_SECONDS",
            "--help" | "-h" => {
                eprintln!("{}", USAGE);
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {}\n{}", other, USAGE);
                std::process::exit(2);
            }
        };
        i += 1;
        if let Some(v) = args.get(i) {
            flags.insert(key.to_string(), v.clone());
        }
        i += 1;
    }
    flags
}

/// `KEY=value` entries of a .env file. Unparsable lines are skipped.
fn parse_dotenv<R: std::io::Read>(reader: R) -> HashMap<String, String> {
    dotenvy::from_read_iter(reader).filter_map(|entry| entry.ok()).collect()
}

/// Flags win over environment variables, which win over .env entries.
fn load_config(flags: &HashMap<String, String>, dotenv: &HashMap<String, String>) -> Result<ListenerConfig> {
    ListenerConfig::from_lookup(|key| {
        flags
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .or_else(|| dotenv.get(key).cloned())
    })
    .context("invalid configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let flags = parse_flags(&args);
    let dotenv = std::fs::File::open(".env").map(parse_dotenv).unwrap_or_default();
    if !dotenv.is_empty() {
        tracing::debug!(entries = dotenv.len(), "loaded .env");
    }
    let config = load_config(&flags, &dotenv)?;
    tracing::info!(
        rpc_url = %config.rpc_url,
        contract = %format!("0x{}", hex::encode(config.contract_address)),
        relayer = %config.relayer_endpoint,
        depth = config.confirmation_depth,
        poll_secs = config.poll_interval.as_secs(),
        state_file = %config.state_file.display(),
        "starting bridge listener"
    );

    let mut coordinator = Coordinator::from_config(&config).context("build coordinator")?;
    let (handle, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, finishing in-flight work");
            handle.trigger();
        }
    });

    let started = std::time::Instant::now();
    coordinator.run(shutdown).await.context("listener stopped on fatal error")?;
    tracing::info!(
        uptime_secs = started.elapsed().as_secs(),
        cursor = coordinator.cursor().last_scanned_block,
        "listener shut down cleanly"
    );
    Ok(())
}
