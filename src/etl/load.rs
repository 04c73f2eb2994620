/// Load Module
///
/// Hands normalized blocks to the storage backend.
use crate::{error::IngestError, models::Block, storage::StorageAdapter};

/// Store a block, replacing any earlier copy with the same key.
///
/// Uses the backend's upsert so a block can be re-processed without errors.
pub async fn load_block(store: &dyn StorageAdapter, block: &Block) -> Result<(), IngestError> {
    store.upsert_block(block).await?;

    tracing::debug!(
        "Stored block {} ({} extrinsics, {} events) in {}",
        block.number,
        block.extrinsics.len(),
        block.event_count(),
        store.name()
    );
    Ok(())
}
