/// ClickHouse Storage
///
/// Columnar warehouse backend spoken to over the ClickHouse HTTP interface.
/// All chains share one table with `relay_chain`/`chain` columns; nested
/// fields use native `Array(Tuple(..))` columns with opaque values in their
/// canonical string form.
///
/// ClickHouse has no in-place update. The table is a `ReplacingMergeTree`
/// versioned by `ingested_at` and every read uses `FINAL`, so a re-ingested
/// block replaces the old one logically; the physical duplicate lingers until
/// the next background merge.
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Capabilities, StorageAdapter, StorageError};
use crate::{
    config::{ChainId, ClickhouseConfig},
    models::{string_number, Block, Era, Event, Extrinsic, Log, MethodId, Opaque, Signature, Signer},
};

const COLUMNS: &str = "relay_chain, chain, number, timestamp, hash, parent_hash, state_root, extrinsics_root, \
                       author_id, finalized, extrinsics, on_initialize, on_finalize, logs";

const SETTINGS: [(&str, &str); 3] = [
    ("input_format_json_named_tuples_as_objects", "1"),
    ("output_format_json_named_tuples_as_objects", "1"),
    ("output_format_json_quote_64bit_integers", "0"),
];

const EVENT_TUPLE: &str = "Tuple(method Tuple(pallet String, method String), data String)";

pub struct ClickhouseStore {
    client: reqwest::Client,
    config: ClickhouseConfig,
    closed: AtomicBool,
}

impl ClickhouseStore {
    /// Build the HTTP client and check the server answers
    pub async fn connect(config: ClickhouseConfig) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StorageError::Connection { backend: "clickhouse", message: e.to_string() })?;

        let store = Self { client, config, closed: AtomicBool::new(false) };
        store
            .execute("SELECT 1", None, &[])
            .await
            .map_err(|e| StorageError::Connection { backend: "clickhouse", message: e.to_string() })?;

        Ok(store)
    }

    fn table(&self) -> String {
        format!("`{}`.`{}`", self.config.database, self.config.table)
    }

    /// Run one statement. `statement` goes in the URL when `body` carries data
    /// (inserts), otherwise it is the request body. Values are passed as
    /// server-side query parameters.
    async fn execute(
        &self,
        statement: &str,
        body: Option<String>,
        params: &[(&str, String)],
    ) -> Result<String, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }

        let mut query: Vec<(String, String)> = vec![("database".to_string(), self.config.database.clone())];
        query.extend(SETTINGS.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        query.extend(params.iter().map(|(k, v)| (format!("param_{}", k), v.clone())));

        let payload = match body {
            Some(data) => {
                query.push(("query".to_string(), statement.to_string()));
                data
            }
            None => statement.to_string(),
        };

        let mut request = self.client.post(&self.config.url).query(&query).body(payload);
        if let Some(user) = &self.config.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(StorageError::Warehouse { status: status.as_u16(), body: text.trim().to_string() });
        }

        Ok(text)
    }

    async fn select_blocks(&self, filter: &str, params: &[(&str, String)]) -> Result<Vec<Block>, StorageError> {
        let sql = format!("SELECT {} FROM {} FINAL WHERE {} FORMAT JSONEachRow", COLUMNS, self.table(), filter);
        let text = self.execute(&sql, None, params).await?;

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| -> Result<Block, StorageError> {
                let row: WarehouseRow = serde_json::from_str(line)?;
                Block::try_from(row)
            })
            .collect()
    }
}

pub(crate) fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            relay_chain String,
            chain String,
            number UInt64,
            timestamp Int64,
            hash String,
            parent_hash String,
            state_root String,
            extrinsics_root String,
            author_id String,
            finalized Bool,
            extrinsics Array(Tuple(
                method Tuple(pallet String, method String),
                signature Tuple(signature String, signer String),
                nonce String,
                args String,
                tip String,
                hash String,
                info String,
                era Tuple(immortal_era String, mortal_era Array(String)),
                events Array({EVENT_TUPLE}),
                success Bool,
                pays_fee Bool
            )),
            on_initialize Array({EVENT_TUPLE}),
            on_finalize Array({EVENT_TUPLE}),
            logs Array(Tuple(log_type String, log_index String, log_value String)),
            ingested_at DateTime64(3) DEFAULT now64(3)
        )
        ENGINE = ReplacingMergeTree(ingested_at)
        ORDER BY (relay_chain, chain, number)"
    )
}

fn chain_params(chain: &ChainId) -> Vec<(&'static str, String)> {
    vec![("relay_chain", chain.relay_chain.clone()), ("chain", chain.chain.clone())]
}

#[async_trait]
impl StorageAdapter for ClickhouseStore {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { native_upsert: false, nested_types: true }
    }

    async fn ensure_schema(&self, chain: &ChainId) -> Result<(), StorageError> {
        let create_database = format!("CREATE DATABASE IF NOT EXISTS `{}`", self.config.database);
        self.execute(&create_database, None, &[]).await?;
        self.execute(&create_table_sql(&self.table()), None, &[]).await?;

        tracing::info!("Table {} is ready for {}", self.table(), chain);
        Ok(())
    }

    async fn upsert_block(&self, block: &Block) -> Result<(), StorageError> {
        let row = serde_json::to_string(&WarehouseRow::from(block))?;
        let insert = format!("INSERT INTO {} ({}) FORMAT JSONEachRow", self.table(), COLUMNS);

        self.execute(&insert, Some(row), &[]).await?;

        tracing::debug!("Inserted block {} into {}", block.number, self.table());
        Ok(())
    }

    async fn query_latest(&self, chain: &ChainId, limit: usize) -> Result<Vec<Block>, StorageError> {
        let mut params = chain_params(chain);
        params.push(("limit", limit.to_string()));

        self.select_blocks(
            "relay_chain = {relay_chain:String} AND chain = {chain:String} \
             ORDER BY number DESC LIMIT {limit:UInt64}",
            &params,
        )
        .await
    }

    async fn query_by_number(&self, chain: &ChainId, number: u64) -> Result<Option<Block>, StorageError> {
        let mut params = chain_params(chain);
        params.push(("number", number.to_string()));

        let blocks = self
            .select_blocks(
                "relay_chain = {relay_chain:String} AND chain = {chain:String} \
                 AND number = {number:UInt64} LIMIT 1",
                &params,
            )
            .await?;

        Ok(blocks.into_iter().next())
    }

    async fn max_number(&self, chain: &ChainId) -> Result<Option<u64>, StorageError> {
        #[derive(Deserialize)]
        struct MaxRow {
            number: Option<u64>,
        }

        let sql = format!(
            "SELECT maxOrNull(number) AS number FROM {} \
             WHERE relay_chain = {{relay_chain:String}} AND chain = {{chain:String}} FORMAT JSONEachRow",
            self.table()
        );
        let text = self.execute(&sql, None, &chain_params(chain)).await?;

        match text.lines().find(|line| !line.trim().is_empty()) {
            Some(line) => Ok(serde_json::from_str::<MaxRow>(line)?.number),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One `JSONEachRow` line of the blocks table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WarehouseRow {
    relay_chain: String,
    chain: String,
    #[serde(deserialize_with = "string_number::deserialize")]
    number: u64,
    timestamp: i64,
    hash: String,
    parent_hash: String,
    state_root: String,
    extrinsics_root: String,
    author_id: String,
    finalized: bool,
    extrinsics: Vec<ExtrinsicRow>,
    on_initialize: Vec<EventRow>,
    on_finalize: Vec<EventRow>,
    logs: Vec<LogRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ExtrinsicRow {
    method: MethodId,
    signature: SignatureRow,
    nonce: String,
    args: String,
    tip: String,
    hash: String,
    info: String,
    era: EraRow,
    events: Vec<EventRow>,
    success: bool,
    pays_fee: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SignatureRow {
    signature: String,
    signer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EraRow {
    immortal_era: String,
    mortal_era: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EventRow {
    method: MethodId,
    data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LogRow {
    log_type: String,
    log_index: String,
    log_value: String,
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        Self { method: event.method.clone(), data: event.data.encode() }
    }
}

impl TryFrom<EventRow> for Event {
    type Error = StorageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self { method: row.method, data: Opaque::decode(&row.data)? })
    }
}

impl From<&Extrinsic> for ExtrinsicRow {
    fn from(ex: &Extrinsic) -> Self {
        let signature = match &ex.signature {
            Some(sig) => SignatureRow { signature: sig.signature.clone(), signer: sig.signer.id.clone() },
            None => SignatureRow { signature: String::new(), signer: String::new() },
        };

        Self {
            method: ex.method.clone(),
            signature,
            nonce: ex.nonce.clone().unwrap_or_default(),
            args: ex.args.encode(),
            tip: ex.tip.clone().unwrap_or_default(),
            hash: ex.hash.clone(),
            info: ex.info.encode(),
            era: EraRow {
                immortal_era: ex.era.immortal_era.clone().unwrap_or_default(),
                mortal_era: ex.era.mortal_era.clone().unwrap_or_default(),
            },
            events: ex.events.iter().map(EventRow::from).collect(),
            success: ex.success,
            pays_fee: ex.pays_fee,
        }
    }
}

impl TryFrom<ExtrinsicRow> for Extrinsic {
    type Error = StorageError;

    fn try_from(row: ExtrinsicRow) -> Result<Self, Self::Error> {
        let signature = non_empty(row.signature.signature)
            .map(|signature| Signature { signature, signer: Signer { id: row.signature.signer } });

        Ok(Self {
            method: row.method,
            signature,
            nonce: non_empty(row.nonce),
            args: Opaque::decode(&row.args)?,
            tip: non_empty(row.tip),
            hash: row.hash,
            info: Opaque::decode(&row.info)?,
            era: Era {
                immortal_era: non_empty(row.era.immortal_era),
                mortal_era: (!row.era.mortal_era.is_empty()).then_some(row.era.mortal_era),
            },
            events: row.events.into_iter().map(Event::try_from).collect::<Result<_, _>>()?,
            success: row.success,
            pays_fee: row.pays_fee,
        })
    }
}

impl From<&Block> for WarehouseRow {
    fn from(block: &Block) -> Self {
        Self {
            relay_chain: block.relay_chain.clone(),
            chain: block.chain.clone(),
            number: block.number,
            timestamp: block.timestamp,
            hash: block.hash.clone(),
            parent_hash: block.parent_hash.clone(),
            state_root: block.state_root.clone(),
            extrinsics_root: block.extrinsics_root.clone(),
            author_id: block.author_id.clone(),
            finalized: block.finalized,
            extrinsics: block.extrinsics.iter().map(ExtrinsicRow::from).collect(),
            on_initialize: block.on_initialize.iter().map(EventRow::from).collect(),
            on_finalize: block.on_finalize.iter().map(EventRow::from).collect(),
            logs: block
                .logs
                .iter()
                .map(|log| LogRow {
                    log_type: log.log_type.clone(),
                    log_index: log.index.clone(),
                    log_value: log.value.encode(),
                })
                .collect(),
        }
    }
}

impl TryFrom<WarehouseRow> for Block {
    type Error = StorageError;

    fn try_from(row: WarehouseRow) -> Result<Self, Self::Error> {
        let events = |rows: Vec<EventRow>| rows.into_iter().map(Event::try_from).collect::<Result<Vec<_>, _>>();

        Ok(Self {
            relay_chain: row.relay_chain,
            chain: row.chain,
            number: row.number,
            hash: row.hash,
            parent_hash: row.parent_hash,
            state_root: row.state_root,
            extrinsics_root: row.extrinsics_root,
            author_id: row.author_id,
            timestamp: row.timestamp,
            finalized: row.finalized,
            extrinsics: row.extrinsics.into_iter().map(Extrinsic::try_from).collect::<Result<_, _>>()?,
            on_initialize: events(row.on_initialize)?,
            on_finalize: events(row.on_finalize)?,
            logs: row
                .logs
                .into_iter()
                .map(|log| -> Result<Log, StorageError> {
                    Ok(Log { log_type: log.log_type, index: log.log_index, value: Opaque::decode(&log.log_value)? })
                })
                .collect::<Result<_, _>>()?,
        })
    }
}
