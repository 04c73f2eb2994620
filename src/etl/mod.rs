/// ETL Module
///
/// One block's trip through the pipeline:
/// - Extract: fetch and decode the sidecar payload
/// - Transform: normalize and validate it into a [`Block`]
/// - Load: upsert it into the configured backend
pub mod extract;
pub mod load;
pub mod transform;

use crate::{config::ChainId, error::IngestError, models::Block, rpc::BlockSource, storage::StorageAdapter};

/// Fetch, normalize and store block `id`. Nothing is written unless every
/// step before the store succeeds.
pub async fn ingest_block<S>(
    source: &S,
    store: &dyn StorageAdapter,
    chain: &ChainId,
    id: u64,
) -> Result<Block, IngestError>
where
    S: BlockSource + ?Sized,
{
    let raw = source.fetch_block(id).await?;
    let block = transform::transform(raw, chain)?;
    load::load_block(store, &block).await?;

    Ok(block)
}
