/// Transform Module
///
/// Normalizes a raw sidecar block into the canonical [`Block`]: tags it with
/// its chain, derives the timestamp, canonicalizes opaque fields and rejects
/// the whole block if any strictly boolean field is not a boolean.
use serde_json::Value;

use super::extract::{RawBlock, RawEvent, RawExtrinsic, RawLog};
use crate::{
    config::ChainId,
    error::IngestError,
    models::{Block, Event, Extrinsic, Log, Opaque, Signature, Signer},
};

const TIMESTAMP_PALLET: &str = "timestamp";

pub fn transform(raw: RawBlock, chain: &ChainId) -> Result<Block, IngestError> {
    let number = raw.number;
    let invalid = |reason: String| IngestError::Validation { block: number, reason };

    let finalized = raw.finalized.as_bool().ok_or_else(|| invalid("`finalized` is not a boolean".to_string()))?;

    let timestamp = match extract_timestamp(&raw.extrinsics) {
        Some(ms) => ms,
        None => {
            tracing::warn!("Block {} has no usable timestamp extrinsic, storing timestamp 0", number);
            0
        }
    };

    let extrinsics = raw
        .extrinsics
        .into_iter()
        .enumerate()
        .map(|(index, ex)| normalize_extrinsic(index, ex).map_err(invalid))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Block {
        relay_chain: chain.relay_chain.clone(),
        chain: chain.chain.clone(),
        number,
        hash: raw.hash,
        parent_hash: raw.parent_hash,
        state_root: raw.state_root,
        extrinsics_root: raw.extrinsics_root,
        author_id: raw.author_id,
        timestamp,
        finalized,
        extrinsics,
        on_initialize: normalize_events(raw.on_initialize.events),
        on_finalize: normalize_events(raw.on_finalize.events),
        logs: raw.logs.into_iter().map(normalize_log).collect(),
    })
}

/// Milliseconds from the first `timestamp` pallet extrinsic's `now` argument
fn extract_timestamp(extrinsics: &[RawExtrinsic]) -> Option<i64> {
    let inherent = extrinsics.iter().find(|ex| ex.method.pallet == TIMESTAMP_PALLET)?;

    match inherent.args.get("now")? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn normalize_extrinsic(index: usize, raw: RawExtrinsic) -> Result<Extrinsic, String> {
    let success = raw.success.as_bool().ok_or_else(|| format!("extrinsic {}: `success` is not a boolean", index))?;
    let pays_fee = raw.pays_fee.as_bool().ok_or_else(|| format!("extrinsic {}: `paysFee` is not a boolean", index))?;

    Ok(Extrinsic {
        method: raw.method,
        signature: raw
            .signature
            .map(|sig| Signature { signature: sig.signature, signer: Signer { id: sig.signer.into_id() } }),
        nonce: raw.nonce,
        args: Opaque::new(raw.args),
        tip: raw.tip,
        hash: raw.hash,
        info: Opaque::new(raw.info),
        era: raw.era,
        events: normalize_events(raw.events),
        success,
        pays_fee,
    })
}

fn normalize_events(events: Vec<RawEvent>) -> Vec<Event> {
    events.into_iter().map(|event| Event { method: event.method, data: Opaque::new(event.data) }).collect()
}

fn normalize_log(log: RawLog) -> Log {
    Log { log_type: log.log_type, index: log.index, value: Opaque::new(log.value) }
}
