/// Storage Module
///
/// One capability-set interface, [`StorageAdapter`], with a concrete
/// implementation per backend:
/// - [`postgres::PostgresStore`] - relational, true upsert, JSONB nested columns
/// - [`sqlite::SqliteStore`] - embedded file, true upsert, JSON text columns
/// - [`document::DocumentStore`] - one JSON document per block, atomic replace
/// - [`clickhouse::ClickhouseStore`] - columnar warehouse, replacing merge tree
///
/// The backend is picked once at startup from [`BackendConfig`], which acts as
/// the [`Connector`] the pipeline uses to open a handle per iteration.
pub mod clickhouse;
pub mod document;
#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::{BackendConfig, ChainId},
    models::Block,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to {backend}: {message}")]
    Connection { backend: &'static str, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode a stored block: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("warehouse request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("warehouse returned HTTP {status}: {body}")]
    Warehouse { status: u16, body: String },

    #[error("block number {0} does not fit the backend's key column")]
    NumberOutOfRange(u64),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("storage handle is closed")]
    Closed,
}

impl StorageError {
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Database(e) => matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed),
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NumberOutOfRange(_))
    }
}

/// What a backend can do natively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Re-upserting a key replaces the stored row in place. When false the
    /// backend may briefly hold several physical rows per key.
    pub native_upsert: bool,
    /// Nested fields are stored as structured values rather than JSON text
    pub nested_types: bool,
}

/// A connected storage handle
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Create the table/collection for `chain` if it does not exist
    async fn ensure_schema(&self, chain: &ChainId) -> Result<(), StorageError>;

    /// Store `block`, fully replacing any record with the same key
    async fn upsert_block(&self, block: &Block) -> Result<(), StorageError>;

    /// Up to `limit` blocks, highest number first
    async fn query_latest(&self, chain: &ChainId, limit: usize) -> Result<Vec<Block>, StorageError>;

    async fn query_by_number(&self, chain: &ChainId, number: u64) -> Result<Option<Block>, StorageError>;

    /// Highest stored block number, the ingestion cursor
    async fn max_number(&self, chain: &ChainId) -> Result<Option<u64>, StorageError> {
        Ok(self.query_latest(chain, 1).await?.first().map(|b| b.number))
    }

    /// Release the handle. Calling it more than once is a no-op.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Opens storage handles on demand
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StorageAdapter>, StorageError>;
}

#[async_trait]
impl Connector for BackendConfig {
    async fn connect(&self) -> Result<Box<dyn StorageAdapter>, StorageError> {
        let store: Box<dyn StorageAdapter> = match self {
            Self::Postgres { url, max_connections } => {
                Box::new(postgres::PostgresStore::connect(url, *max_connections).await?)
            }
            Self::Sqlite { path } => Box::new(sqlite::SqliteStore::open(path).await?),
            Self::Document { root } => Box::new(document::DocumentStore::open(root).await?),
            Self::Clickhouse(config) => Box::new(clickhouse::ClickhouseStore::connect(config.clone()).await?),
        };

        tracing::debug!("Opened {} storage handle", store.name());
        Ok(store)
    }
}

/// Convert a block number to a signed 64-bit key column value
pub(crate) fn number_to_i64(number: u64) -> Result<i64, StorageError> {
    i64::try_from(number).map_err(|_| StorageError::NumberOutOfRange(number))
}

pub(crate) fn number_from_i64(number: i64) -> Result<u64, StorageError> {
    u64::try_from(number).map_err(|_| StorageError::Corrupt(format!("negative block number {}", number)))
}
