/// Cursor Module
///
/// Tracks where live ingestion resumes. The position is re-derived from the
/// highest block number in storage at the start of every poll cycle; the
/// in-memory value only says which block to try next within that cycle.
use std::ops::RangeInclusive;

use crate::{config::ChainId, error::IngestError, storage::StorageAdapter};

#[derive(Debug, Clone)]
pub struct Cursor {
    chain: ChainId,
    next: Option<u64>,
}

impl Cursor {
    pub fn new(chain: ChainId) -> Self {
        Self { chain, next: None }
    }

    /// Next block number to ingest, `None` until the first poll
    pub fn next_block(&self) -> Option<u64> {
        self.next
    }

    /// Last block known to be stored
    pub fn last_known(&self) -> Option<u64> {
        self.next.and_then(|n| n.checked_sub(1))
    }

    /// Re-read the stored maximum at the start of a poll cycle. Resumes after
    /// it; with an empty store on the first poll, parks the cursor just below
    /// `head` so history before it is not backfilled. Returns `false` for that
    /// cold start, which ingests nothing until the next poll.
    pub async fn refresh(&mut self, store: &dyn StorageAdapter, head: u64) -> Result<bool, IngestError> {
        match (store.max_number(&self.chain).await?, self.next) {
            (Some(max), previous) => {
                if previous.is_none() {
                    tracing::info!("Resuming {} after stored block {}", self.chain, max);
                }
                self.next = Some(max.saturating_add(1));
                Ok(true)
            }
            (None, Some(_)) => Ok(true),
            (None, None) => {
                tracing::info!("No stored blocks for {}, starting after head {}", self.chain, head);
                self.next = Some(head);
                Ok(false)
            }
        }
    }

    /// Re-read the stored maximum after a cycle
    pub async fn sync(&mut self, store: &dyn StorageAdapter) -> Result<Option<u64>, IngestError> {
        let max = store.max_number(&self.chain).await?;
        if let Some(max) = max {
            self.next = Some(max.saturating_add(1));
        }
        Ok(max)
    }

    /// Blocks to ingest to catch up with `head`, ascending
    pub fn pending(&self, head: u64) -> Option<RangeInclusive<u64>> {
        let next = self.next?;
        (next <= head).then_some(next..=head)
    }
}
