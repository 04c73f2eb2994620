/// Configuration Module
///
/// Explicit configuration values built once from the CLI and handed to each
/// component: which chain to ingest, where to store it, and how to retry.
use std::{fmt, path::PathBuf, time::Duration};

use clap::ValueEnum;

/// A `(relay_chain, chain)` pair, e.g. `polkadot` / `assethub`.
///
/// Both parts end up in table and directory names, so they are restricted to
/// lowercase ASCII letters, digits and underscores. Hyphens are folded to
/// underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    pub relay_chain: String,
    pub chain: String,
}

impl ChainId {
    pub fn new(relay_chain: &str, chain: &str) -> anyhow::Result<Self> {
        Ok(Self { relay_chain: sanitize_identifier(relay_chain)?, chain: sanitize_identifier(chain)? })
    }

    /// Per-chain table name used by the relational and embedded backends
    pub fn table_name(&self) -> String {
        format!("blocks_{}_{}", self.relay_chain, self.chain)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.relay_chain, self.chain)
    }
}

/// Validate a user supplied name that will be interpolated into DDL
pub fn sanitize_identifier(raw: &str) -> anyhow::Result<String> {
    let name = raw.trim().to_ascii_lowercase().replace('-', "_");

    if name.is_empty() {
        anyhow::bail!("identifier must not be empty");
    }
    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        anyhow::bail!("identifier `{}` may only contain letters, digits, `-` and `_`", raw);
    }

    Ok(name)
}

/// Storage backend selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// PostgreSQL (relational, JSONB nested columns)
    Postgres,
    /// SQLite file (embedded, JSON text nested columns)
    Sqlite,
    /// Directory of JSON documents
    Document,
    /// ClickHouse over HTTP (columnar warehouse)
    Clickhouse,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::Document => "document",
            Self::Clickhouse => "clickhouse",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters for the selected backend
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Postgres { url: String, max_connections: u32 },
    Sqlite { path: PathBuf },
    Document { root: PathBuf },
    Clickhouse(ClickhouseConfig),
}

impl BackendConfig {
    pub fn backend(&self) -> Backend {
        match self {
            Self::Postgres { .. } => Backend::Postgres,
            Self::Sqlite { .. } => Backend::Sqlite,
            Self::Document { .. } => Backend::Document,
            Self::Clickhouse(_) => Backend::Clickhouse,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    /// HTTP interface, e.g. `http://localhost:8123`
    pub url: String,
    pub database: String,
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

/// Per-block retry behaviour.
///
/// Delays grow as `initial_delay * 2^(attempt - 1)` up to `max_delay`. A block
/// that has failed `stuck_after` times is reported as stuck; it is still
/// retried unless `max_attempts` is set and exhausted (historical mode only).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub stuck_after: u32,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            stuck_after: 10,
            max_attempts: None,
        }
    }
}

/// How the pipeline walks the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Follow the chain head until stopped
    Live,
    /// Ingest `start..=end` once
    Historical { start: u64, end: u64 },
}
