/// CLI Module
///
/// Command-line interface configuration using clap. Flags override the
/// matching environment variables (`SIDECAR_URL`, `DATABASE_URL`,
/// `CLICKHOUSE_URL`, `CLICKHOUSE_PASSWORD`), which may come from a `.env` file.
use std::{env, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::{
    config::{sanitize_identifier, Backend, BackendConfig, ChainId, ClickhouseConfig, IngestMode, RetryPolicy},
    pipeline::PipelineConfig,
};

const DEFAULT_SIDECAR_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_CLICKHOUSE_URL: &str = "http://127.0.0.1:8123";

/// Substrate block ingestion - live tailing and backfill into pluggable storage
///
/// Fetches blocks from a Substrate API sidecar, normalizes them and upserts
/// them into PostgreSQL, SQLite, a JSON document directory or ClickHouse.
#[derive(Parser, Debug)]
#[command(name = "dotlake-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Parachain (or relay chain) name, e.g. `assethub`
    #[arg(long, global = true, value_name = "NAME", default_value = "assethub")]
    pub chain: String,

    /// Relay chain the chain belongs to, e.g. `polkadot`
    #[arg(long, global = true, value_name = "NAME", default_value = "polkadot")]
    pub relay_chain: String,

    /// Sidecar base URL (overrides SIDECAR_URL env var)
    #[arg(long, global = true, value_name = "URL")]
    pub sidecar_url: Option<String>,

    /// Storage backend
    #[arg(short = 'b', long, global = true, value_enum, default_value_t = Backend::Sqlite)]
    pub backend: Backend,

    /// PostgreSQL connection URL (overrides DATABASE_URL env var)
    #[arg(short = 'd', long, global = true, value_name = "URL")]
    pub database_url: Option<String>,

    /// PostgreSQL pool size
    #[arg(long, global = true, value_name = "COUNT", default_value = "5")]
    pub max_connections: u32,

    /// SQLite file or document directory
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// ClickHouse HTTP interface (overrides CLICKHOUSE_URL env var)
    #[arg(long, global = true, value_name = "URL")]
    pub clickhouse_url: Option<String>,

    #[arg(long, global = true, value_name = "NAME", default_value = "dotlake")]
    pub clickhouse_database: String,

    #[arg(long, global = true, value_name = "NAME", default_value = "blocks")]
    pub clickhouse_table: String,

    #[arg(long, global = true, value_name = "USER")]
    pub clickhouse_user: Option<String>,

    /// ClickHouse password (overrides CLICKHOUSE_PASSWORD env var)
    #[arg(long, global = true, value_name = "PASSWORD")]
    pub clickhouse_password: Option<String>,

    /// Interval between head polls in live mode, in seconds
    #[arg(long, global = true, value_name = "SECONDS", default_value = "6")]
    pub poll_interval: u64,

    /// HTTP request timeout in seconds
    #[arg(long, global = true, value_name = "SECONDS", default_value = "30")]
    pub request_timeout: u64,

    /// Delay before the first retry of a failed block, in milliseconds
    #[arg(long, global = true, value_name = "MS", default_value = "500")]
    pub retry_delay_ms: u64,

    /// Upper bound for the retry delay, in seconds
    #[arg(long, global = true, value_name = "SECONDS", default_value = "30")]
    pub max_retry_delay: u64,

    /// Failed attempts before a block is reported as stuck
    #[arg(long, global = true, value_name = "COUNT", default_value = "10")]
    pub stuck_after: u32,

    /// Give up on a block after this many attempts (backfill only)
    #[arg(long, global = true, value_name = "COUNT")]
    pub max_attempts: Option<u32>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Follow the chain head continuously
    Live,
    /// Ingest a fixed block range once
    Backfill {
        /// First block number
        #[arg(short = 's', long, value_name = "NUMBER")]
        start: u64,
        /// Last block number (inclusive)
        #[arg(short = 'e', long, value_name = "NUMBER")]
        end: u64,
    },
    /// Print the most recent stored blocks
    Latest {
        #[arg(short = 'n', long, value_name = "COUNT", default_value = "50")]
        count: usize,
    },
    /// Print one stored block
    Block { number: u64 },
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Command::Backfill { start, end } = self.command {
            if start > end {
                anyhow::bail!("Start block ({}) must be less than or equal to end block ({})", start, end);
            }
        }

        if self.stuck_after == 0 {
            anyhow::bail!("Stuck threshold must be greater than 0");
        }

        if self.max_attempts == Some(0) {
            anyhow::bail!("Max attempts must be greater than 0");
        }

        if self.retry_delay_ms == 0 {
            anyhow::bail!("Retry delay must be greater than 0");
        }

        if Duration::from_millis(self.retry_delay_ms) > Duration::from_secs(self.max_retry_delay) {
            anyhow::bail!("Retry delay must not exceed the max retry delay");
        }

        if self.max_connections == 0 {
            anyhow::bail!("Max connections must be greater than 0");
        }

        if let Command::Latest { count: 0 } = self.command {
            anyhow::bail!("Count must be greater than 0");
        }

        Ok(())
    }

    pub fn chain_id(&self) -> anyhow::Result<ChainId> {
        ChainId::new(&self.relay_chain, &self.chain).context("Invalid chain name")
    }

    /// Ingestion mode for `live` / `backfill`, `None` for query commands
    pub fn mode(&self) -> Option<IngestMode> {
        match self.command {
            Command::Live => Some(IngestMode::Live),
            Command::Backfill { start, end } => Some(IngestMode::Historical { start, end }),
            Command::Latest { .. } | Command::Block { .. } => None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn sidecar_url(&self) -> String {
        self.sidecar_url
            .clone()
            .or_else(|| env::var("SIDECAR_URL").ok())
            .unwrap_or_else(|| DEFAULT_SIDECAR_URL.to_string())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_secs(self.max_retry_delay),
            stuck_after: self.stuck_after,
            max_attempts: self.max_attempts,
        }
    }

    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        Ok(PipelineConfig {
            chain: self.chain_id()?,
            poll_interval: Duration::from_secs(self.poll_interval),
            retry: self.retry_policy(),
        })
    }

    /// Resolve the selected backend's connection parameters
    pub fn backend_config(&self) -> anyhow::Result<BackendConfig> {
        Ok(match self.backend {
            Backend::Postgres => {
                let url = match &self.database_url {
                    Some(url) => url.clone(),
                    None => env::var("DATABASE_URL")
                        .context("DATABASE_URL not found in environment. Pass --database-url or check your .env file")?,
                };
                BackendConfig::Postgres { url, max_connections: self.max_connections }
            }
            Backend::Sqlite => {
                BackendConfig::Sqlite { path: self.db_path.clone().unwrap_or_else(|| PathBuf::from("data/dotlake.sqlite")) }
            }
            Backend::Document => {
                BackendConfig::Document { root: self.db_path.clone().unwrap_or_else(|| PathBuf::from("data/documents")) }
            }
            Backend::Clickhouse => BackendConfig::Clickhouse(ClickhouseConfig {
                url: self
                    .clickhouse_url
                    .clone()
                    .or_else(|| env::var("CLICKHOUSE_URL").ok())
                    .unwrap_or_else(|| DEFAULT_CLICKHOUSE_URL.to_string()),
                database: sanitize_identifier(&self.clickhouse_database).context("Invalid ClickHouse database")?,
                table: sanitize_identifier(&self.clickhouse_table).context("Invalid ClickHouse table")?,
                user: self.clickhouse_user.clone(),
                password: self.clickhouse_password.clone().or_else(|| env::var("CLICKHOUSE_PASSWORD").ok()),
                request_timeout: self.request_timeout(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dotlake-ingest").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_backfill_mode() {
        let cli = parse(&["backfill", "--start", "10", "--end", "12", "--chain", "asset-hub"]);

        assert!(cli.validate().is_ok());
        assert_eq!(cli.mode(), Some(IngestMode::Historical { start: 10, end: 12 }));
        assert_eq!(cli.chain_id().unwrap().table_name(), "blocks_polkadot_asset_hub");
    }

    #[test]
    fn test_validation() {
        let cli = parse(&["backfill", "-s", "1000", "-e", "900"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["live", "--stuck-after", "0"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["live", "--retry-delay-ms", "60000", "--max-retry-delay", "30"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["latest", "-n", "0"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["live"]);

        assert_eq!(cli.mode(), Some(IngestMode::Live));
        assert_eq!(cli.backend, Backend::Sqlite);

        let retry = cli.retry_policy();
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert_eq!(retry.stuck_after, 10);
        assert_eq!(retry.max_attempts, None);

        let config = cli.pipeline_config().unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(6));
    }

    #[test]
    fn test_query_commands() {
        let cli = parse(&["latest"]);
        assert_eq!(cli.command, Command::Latest { count: 50 });
        assert_eq!(cli.mode(), None);

        let cli = parse(&["block", "9170311", "--backend", "document", "--db-path", "/tmp/blocks"]);
        assert_eq!(cli.command, Command::Block { number: 9_170_311 });
        match cli.backend_config().unwrap() {
            BackendConfig::Document { root } => assert_eq!(root, PathBuf::from("/tmp/blocks")),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_clickhouse_config() {
        let cli = parse(&[
            "live",
            "--backend",
            "clickhouse",
            "--clickhouse-url",
            "http://warehouse:8123",
            "--clickhouse-table",
            "substrate-blocks",
            "--clickhouse-password",
            "secret",
        ]);

        match cli.backend_config().unwrap() {
            BackendConfig::Clickhouse(config) => {
                assert_eq!(config.url, "http://warehouse:8123");
                assert_eq!(config.database, "dotlake");
                assert_eq!(config.table, "substrate_blocks");
                assert_eq!(config.password.as_deref(), Some("secret"));
            }
            other => panic!("unexpected backend {:?}", other),
        }

        let cli = parse(&["live", "--backend", "clickhouse", "--clickhouse-table", "x`y"]);
        assert!(cli.backend_config().is_err());
    }
}
