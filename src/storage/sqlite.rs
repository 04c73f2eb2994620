/// SQLite Storage
///
/// Embedded single-file backend. Same table layout as PostgreSQL, with nested
/// fields stored as JSON text. The pool is limited to one connection so an
/// in-memory database is shared by every query.
use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};

use super::{number_from_i64, number_to_i64, Capabilities, StorageAdapter, StorageError};
use crate::{config::ChainId, models::Block};

const COLUMNS: &str = r#"relay_chain, chain, "timestamp", number, hash, parent_hash, state_root,
    extrinsics_root, author_id, finalized, extrinsics, on_initialize, on_finalize, logs"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        Self::with_options(options).await
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StorageError> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection { backend: "sqlite", message: e.to_string() })?;

        Ok(Self { pool })
    }
}

fn quoted_table(chain: &ChainId) -> String {
    format!("\"{}\"", chain.table_name())
}

fn decode_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T, StorageError> {
    let text: String = row.try_get(column)?;
    Ok(serde_json::from_str(&text)?)
}

fn block_from_row(row: &SqliteRow) -> Result<Block, StorageError> {
    Ok(Block {
        relay_chain: row.try_get("relay_chain")?,
        chain: row.try_get("chain")?,
        number: number_from_i64(row.try_get("number")?)?,
        hash: row.try_get("hash")?,
        parent_hash: row.try_get("parent_hash")?,
        state_root: row.try_get("state_root")?,
        extrinsics_root: row.try_get("extrinsics_root")?,
        author_id: row.try_get("author_id")?,
        timestamp: row.try_get("timestamp")?,
        finalized: row.try_get("finalized")?,
        extrinsics: decode_json(row, "extrinsics")?,
        on_initialize: decode_json(row, "on_initialize")?,
        on_finalize: decode_json(row, "on_finalize")?,
        logs: decode_json(row, "logs")?,
    })
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { native_upsert: true, nested_types: false }
    }

    async fn ensure_schema(&self, chain: &ChainId) -> Result<(), StorageError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                number INTEGER PRIMARY KEY,
                relay_chain TEXT NOT NULL,
                chain TEXT NOT NULL,
                "timestamp" INTEGER NOT NULL,
                hash TEXT NOT NULL,
                parent_hash TEXT NOT NULL,
                state_root TEXT NOT NULL,
                extrinsics_root TEXT NOT NULL,
                author_id TEXT NOT NULL,
                finalized BOOLEAN NOT NULL,
                extrinsics TEXT NOT NULL,
                on_initialize TEXT NOT NULL,
                on_finalize TEXT NOT NULL,
                logs TEXT NOT NULL,
                processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            quoted_table(chain)
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        tracing::info!("Table {} is ready", chain.table_name());
        Ok(())
    }

    async fn upsert_block(&self, block: &Block) -> Result<(), StorageError> {
        let chain = block.chain_id();
        let sql = format!(
            r#"
            INSERT INTO {} ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (number)
            DO UPDATE SET
                relay_chain = excluded.relay_chain,
                chain = excluded.chain,
                "timestamp" = excluded."timestamp",
                hash = excluded.hash,
                parent_hash = excluded.parent_hash,
                state_root = excluded.state_root,
                extrinsics_root = excluded.extrinsics_root,
                author_id = excluded.author_id,
                finalized = excluded.finalized,
                extrinsics = excluded.extrinsics,
                on_initialize = excluded.on_initialize,
                on_finalize = excluded.on_finalize,
                logs = excluded.logs,
                processed_at = CURRENT_TIMESTAMP
            "#,
            quoted_table(&chain),
            COLUMNS
        );

        let extrinsics = serde_json::to_string(&block.extrinsics)?;
        let on_initialize = serde_json::to_string(&block.on_initialize)?;
        let on_finalize = serde_json::to_string(&block.on_finalize)?;
        let logs = serde_json::to_string(&block.logs)?;

        sqlx::query(&sql)
            .bind(&block.relay_chain)
            .bind(&block.chain)
            .bind(block.timestamp)
            .bind(number_to_i64(block.number)?)
            .bind(&block.hash)
            .bind(&block.parent_hash)
            .bind(&block.state_root)
            .bind(&block.extrinsics_root)
            .bind(&block.author_id)
            .bind(block.finalized)
            .bind(extrinsics)
            .bind(on_initialize)
            .bind(on_finalize)
            .bind(logs)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Upserted block {} into {}", block.number, chain.table_name());
        Ok(())
    }

    async fn query_latest(&self, chain: &ChainId, limit: usize) -> Result<Vec<Block>, StorageError> {
        let sql = format!("SELECT {} FROM {} ORDER BY number DESC LIMIT ?", COLUMNS, quoted_table(chain));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(block_from_row).collect()
    }

    async fn query_by_number(&self, chain: &ChainId, number: u64) -> Result<Option<Block>, StorageError> {
        let sql = format!("SELECT {} FROM {} WHERE number = ?", COLUMNS, quoted_table(chain));

        let row = sqlx::query(&sql).bind(number_to_i64(number)?).fetch_optional(&self.pool).await?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn max_number(&self, chain: &ChainId) -> Result<Option<u64>, StorageError> {
        let sql = format!("SELECT MAX(number) FROM {}", quoted_table(chain));

        let max = sqlx::query_scalar::<_, Option<i64>>(&sql).fetch_one(&self.pool).await?;
        max.map(number_from_i64).transpose()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}
