/// Document Storage
///
/// Every block is one JSON document at `<root>/<table>/<number>.json`, where
/// `<table>` is the per-chain table name. Writes go to a temporary sibling
/// first and are renamed into place, so readers only ever see whole documents
/// and re-ingestion replaces the previous version.
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;

use super::{Capabilities, StorageAdapter, StorageError};
use crate::{config::ChainId, models::Block};

const EXTENSION: &str = "json";

pub struct DocumentStore {
    root: PathBuf,
    closed: AtomicBool,
}

impl DocumentStore {
    pub async fn open(root: &Path) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| StorageError::Connection { backend: "document", message: e.to_string() })?;

        Ok(Self { root: root.to_path_buf(), closed: AtomicBool::new(false) })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn collection(&self, chain: &ChainId) -> PathBuf {
        self.root.join(chain.table_name())
    }

    fn document_path(&self, chain: &ChainId, number: u64) -> PathBuf {
        self.collection(chain).join(format!("{:020}.{}", number, EXTENSION))
    }

    /// Block numbers present in a collection, unordered
    async fn stored_numbers(&self, chain: &ChainId) -> Result<Vec<u64>, StorageError> {
        let mut entries = match tokio::fs::read_dir(self.collection(chain)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut numbers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(number) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u64>().ok()) {
                numbers.push(number);
            }
        }

        Ok(numbers)
    }

    async fn read_document(&self, path: &Path) -> Result<Option<Block>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageAdapter for DocumentStore {
    fn name(&self) -> &'static str {
        "document"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { native_upsert: true, nested_types: true }
    }

    async fn ensure_schema(&self, chain: &ChainId) -> Result<(), StorageError> {
        self.ensure_open()?;
        tokio::fs::create_dir_all(self.collection(chain)).await?;

        tracing::info!("Collection {} is ready", self.collection(chain).display());
        Ok(())
    }

    async fn upsert_block(&self, block: &Block) -> Result<(), StorageError> {
        self.ensure_open()?;

        let chain = block.chain_id();
        let path = self.document_path(&chain, block.number);
        let staging = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(block)?;
        tokio::fs::write(&staging, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        tracing::debug!("Wrote block {} to {}", block.number, path.display());
        Ok(())
    }

    async fn query_latest(&self, chain: &ChainId, limit: usize) -> Result<Vec<Block>, StorageError> {
        self.ensure_open()?;

        let mut numbers = self.stored_numbers(chain).await?;
        numbers.sort_unstable_by(|a, b| b.cmp(a));

        let mut blocks = Vec::with_capacity(limit.min(numbers.len()));
        for number in numbers.into_iter().take(limit) {
            if let Some(block) = self.read_document(&self.document_path(chain, number)).await? {
                blocks.push(block);
            }
        }

        Ok(blocks)
    }

    async fn query_by_number(&self, chain: &ChainId, number: u64) -> Result<Option<Block>, StorageError> {
        self.ensure_open()?;
        self.read_document(&self.document_path(chain, number)).await
    }

    async fn max_number(&self, chain: &ChainId) -> Result<Option<u64>, StorageError> {
        self.ensure_open()?;
        Ok(self.stored_numbers(chain).await?.into_iter().max())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
