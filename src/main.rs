/// dotlake ingest
///
/// Ingests Substrate blocks from an API sidecar into pluggable storage,
/// either following the chain head or backfilling a fixed range.
mod cli;
mod config;
mod cursor;
mod error;
mod etl;
mod models;
mod pipeline;
mod rpc;
mod storage;
#[cfg(test)]
mod test_utils;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use config::{BackendConfig, ChainId, IngestMode};
use models::Block;
use rpc::{BlockSource, SidecarClient};
use storage::Connector;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    cli.validate()?;

    let chain = cli.chain_id()?;
    let backend = cli.backend_config()?;

    match (cli.mode(), &cli.command) {
        (Some(mode), _) => run_ingest(&cli, backend, mode).await,
        (None, Command::Latest { count }) => show_latest(&backend, &chain, *count).await,
        (None, Command::Block { number }) => show_block(&backend, &chain, *number).await,
        (None, command) => anyhow::bail!("{:?} is not a query command", command),
    }
}

async fn run_ingest(cli: &Cli, backend: BackendConfig, mode: IngestMode) -> Result<()> {
    println!("🚀 Starting dotlake ingest...");

    let sidecar_url = cli.sidecar_url();
    let sidecar = SidecarClient::new(&sidecar_url, cli.request_timeout()).context("Failed to create sidecar client")?;

    match sidecar.fetch_head().await {
        Ok(head) => {
            println!("✅ Connected to: {}", sidecar.base_url());
            println!("🎯 Current head: {}", format_number(head));
        }
        Err(e) => tracing::warn!("Sidecar at {} is not answering yet: {}", sidecar.base_url(), e),
    }
    println!("💾 Storage backend: {}", backend.backend());

    let stop = CancellationToken::new();
    let signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Stop requested, finishing the current step...");
            signal.cancel();
        }
    });

    let config = cli.pipeline_config()?;
    tracing::info!("Ingesting {} into {}", config.chain, backend.backend());

    let pipeline = pipeline::Pipeline::new(sidecar, backend, config, stop);
    let _pipeline_stats = pipeline.run(mode).await.context("Pipeline execution failed")?;

    println!("\n✨ Done!");
    Ok(())
}

/// Stored block as printed by the query commands
fn render(block: &Block) -> serde_json::Value {
    serde_json::json!({
        "blockTime": block.block_time().map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        "extrinsicCount": block.extrinsics.len(),
        "eventCount": block.event_count(),
        "block": block,
    })
}

async fn show_latest(backend: &BackendConfig, chain: &ChainId, count: usize) -> Result<()> {
    let store = backend.connect().await.context("Failed to open storage")?;
    let result = store.query_latest(chain, count).await;
    if let Err(e) = store.close().await {
        tracing::warn!("Failed to close storage: {}", e);
    }

    let blocks = result.with_context(|| format!("Failed to query latest blocks for {}", chain))?;
    let rendered: Vec<_> = blocks.iter().map(render).collect();
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

async fn show_block(backend: &BackendConfig, chain: &ChainId, number: u64) -> Result<()> {
    let store = backend.connect().await.context("Failed to open storage")?;
    let result = store.query_by_number(chain, number).await;
    if let Err(e) = store.close().await {
        tracing::warn!("Failed to close storage: {}", e);
    }

    match result.with_context(|| format!("Failed to query block {} of {}", number, chain))? {
        Some(block) => println!("{}", serde_json::to_string_pretty(&render(&block))?),
        None => anyhow::bail!("Block {} of {} is not stored", number, chain),
    }
    Ok(())
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}
