/// In-memory store used by the pipeline tests. Handles opened by
/// [`MemoryStore`] share one map, so data survives across iterations the way
/// a real database does. Failures can be scripted per block number.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;

use super::{Capabilities, Connector, StorageAdapter, StorageError};
use crate::{config::ChainId, models::Block};

#[derive(Default)]
struct MemoryState {
    blocks: BTreeMap<(ChainKey, u64), Block>,
    upserts: Vec<u64>,
    failing_upserts: HashMap<u64, u32>,
    failing_connects: u32,
    opened: usize,
    closed: usize,
}

type ChainKey = (String, String);

fn key(chain: &ChainId) -> ChainKey {
    (chain.relay_chain.clone(), chain.chain.clone())
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block directly, bypassing the pipeline
    pub fn seed(&self, block: Block) {
        let mut state = self.state.lock().unwrap();
        state.blocks.insert((key(&block.chain_id()), block.number), block);
    }

    /// Fail the next `times` upserts of `number`
    pub fn fail_upserts(&self, number: u64, times: u32) {
        self.state.lock().unwrap().failing_upserts.insert(number, times);
    }

    /// Fail the next `times` connection attempts
    pub fn fail_connects(&self, times: u32) {
        self.state.lock().unwrap().failing_connects = times;
    }

    /// Stored block numbers for `chain`, ascending
    pub fn numbers(&self, chain: &ChainId) -> Vec<u64> {
        let chain = key(chain);
        let state = self.state.lock().unwrap();
        state.blocks.keys().filter(|(c, _)| *c == chain).map(|(_, n)| *n).collect()
    }

    pub fn get(&self, chain: &ChainId, number: u64) -> Option<Block> {
        self.state.lock().unwrap().blocks.get(&(key(chain), number)).cloned()
    }

    /// Every successful upsert, in order
    pub fn upserts(&self) -> Vec<u64> {
        self.state.lock().unwrap().upserts.clone()
    }

    /// Handles opened but not yet closed
    pub fn open_handles(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.opened - state.closed
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn StorageAdapter>, StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(StorageError::Connection { backend: "memory", message: "scripted failure".to_string() });
        }
        state.opened += 1;

        Ok(Box::new(MemoryHandle { store: self.clone(), closed: AtomicBool::new(false) }))
    }
}

struct MemoryHandle {
    store: MemoryStore,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(self.store.state.lock().unwrap())
    }
}

#[async_trait]
impl StorageAdapter for MemoryHandle {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { native_upsert: true, nested_types: true }
    }

    async fn ensure_schema(&self, _chain: &ChainId) -> Result<(), StorageError> {
        self.state().map(|_| ())
    }

    async fn upsert_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut state = self.state()?;

        if let Some(remaining) = state.failing_upserts.get_mut(&block.number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Corrupt(format!("scripted failure for block {}", block.number)));
            }
        }

        state.blocks.insert((key(&block.chain_id()), block.number), block.clone());
        state.upserts.push(block.number);
        Ok(())
    }

    async fn query_latest(&self, chain: &ChainId, limit: usize) -> Result<Vec<Block>, StorageError> {
        let chain = key(chain);
        let state = self.state()?;
        Ok(state.blocks.iter().rev().filter(|((c, _), _)| *c == chain).take(limit).map(|(_, b)| b.clone()).collect())
    }

    async fn query_by_number(&self, chain: &ChainId, number: u64) -> Result<Option<Block>, StorageError> {
        Ok(self.state()?.blocks.get(&(key(chain), number)).cloned())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.store.state.lock().unwrap().closed += 1;
        }
        Ok(())
    }
}
