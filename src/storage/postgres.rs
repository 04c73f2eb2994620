/// PostgreSQL Storage
///
/// Relational backend: one table per `(relay_chain, chain)`, `number` as the
/// primary key, nested fields as JSONB. Re-ingestion uses UPSERT logic
/// (`ON CONFLICT DO UPDATE`) so a block can be re-processed without errors.
use async_trait::async_trait;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Row,
};

use super::{number_from_i64, number_to_i64, Capabilities, StorageAdapter, StorageError};
use crate::{
    config::ChainId,
    models::{Block, Event, Extrinsic, Log},
};

const COLUMNS: &str = r#"relay_chain, chain, "timestamp", number, hash, parent_hash, state_root,
    extrinsics_root, author_id, finalized, extrinsics, on_initialize, on_finalize, logs"#;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Connection { backend: "postgres", message: e.to_string() })?;

        Ok(Self { pool })
    }
}

fn quoted_table(chain: &ChainId) -> String {
    format!("\"{}\"", chain.table_name())
}

pub(crate) fn create_table_sql(chain: &ChainId) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            number BIGINT PRIMARY KEY,
            relay_chain TEXT NOT NULL,
            chain TEXT NOT NULL,
            "timestamp" BIGINT NOT NULL,
            hash TEXT NOT NULL,
            parent_hash TEXT NOT NULL,
            state_root TEXT NOT NULL,
            extrinsics_root TEXT NOT NULL,
            author_id TEXT NOT NULL,
            finalized BOOLEAN NOT NULL,
            extrinsics JSONB NOT NULL,
            on_initialize JSONB NOT NULL,
            on_finalize JSONB NOT NULL,
            logs JSONB NOT NULL,
            processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        quoted_table(chain)
    )
}

pub(crate) fn upsert_sql(chain: &ChainId) -> String {
    format!(
        r#"
        INSERT INTO {} ({})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (number)
        DO UPDATE SET
            relay_chain = EXCLUDED.relay_chain,
            chain = EXCLUDED.chain,
            "timestamp" = EXCLUDED."timestamp",
            hash = EXCLUDED.hash,
            parent_hash = EXCLUDED.parent_hash,
            state_root = EXCLUDED.state_root,
            extrinsics_root = EXCLUDED.extrinsics_root,
            author_id = EXCLUDED.author_id,
            finalized = EXCLUDED.finalized,
            extrinsics = EXCLUDED.extrinsics,
            on_initialize = EXCLUDED.on_initialize,
            on_finalize = EXCLUDED.on_finalize,
            logs = EXCLUDED.logs,
            processed_at = NOW()
        "#,
        quoted_table(chain),
        COLUMNS
    )
}

fn block_from_row(row: &PgRow) -> Result<Block, StorageError> {
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
        extrinsics: row.try_get::<Json<Vec<Extrinsic>>, _>("extrinsics")?.0,
        on_initialize: row.try_get::<Json<Vec<Event>>, _>("on_initialize")?.0,
        on_finalize: row.try_get::<Json<Vec<Event>>, _>("on_finalize")?.0,
        logs: row.try_get::<Json<Vec<Log>>, _>("logs")?.0,
    })
}

#[async_trait]
impl StorageAdapter for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { native_upsert: true, nested_types: true }
    }

    async fn ensure_schema(&self, chain: &ChainId) -> Result<(), StorageError> {
        sqlx::query(&create_table_sql(chain)).execute(&self.pool).await?;

        tracing::info!("Table {} is ready", chain.table_name());
        Ok(())
    }

    async fn upsert_block(&self, block: &Block) -> Result<(), StorageError> {
        let chain = block.chain_id();

        sqlx::query(&upsert_sql(&chain))
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
            .bind(Json(&block.extrinsics))
            .bind(Json(&block.on_initialize))
            .bind(Json(&block.on_finalize))
            .bind(Json(&block.logs))
            .execute(&self.pool)
            .await?;

        tracing::debug!("Upserted block {} into {}", block.number, chain.table_name());
        Ok(())
    }

    async fn query_latest(&self, chain: &ChainId, limit: usize) -> Result<Vec<Block>, StorageError> {
        let sql = format!("SELECT {} FROM {} ORDER BY number DESC LIMIT $1", COLUMNS, quoted_table(chain));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(block_from_row).collect()
    }

    async fn query_by_number(&self, chain: &ChainId, number: u64) -> Result<Option<Block>, StorageError> {
        let sql = format!("SELECT {} FROM {} WHERE number = $1", COLUMNS, quoted_table(chain));

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
