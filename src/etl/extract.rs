/// Extract Module
///
/// Decodes sidecar payloads into raw blocks. Fields the normalizer has to
/// validate (`success`, `paysFee`, `finalized`) are kept as raw JSON here so a
/// wrong type is reported with its location instead of as a decode error.
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::IngestError,
    models::{lenient_string, string_number, Era, MethodId},
};

/// A block as the sidecar serves it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    #[serde(deserialize_with = "string_number::deserialize")]
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub state_root: String,
    pub extrinsics_root: String,
    /// Absent on genesis and on chains without block authorship
    #[serde(default, deserialize_with = "lenient_string::deserialize")]
    pub author_id: String,
    #[serde(default)]
    pub logs: Vec<RawLog>,
    #[serde(default)]
    pub on_initialize: RawHook,
    #[serde(default)]
    pub extrinsics: Vec<RawExtrinsic>,
    #[serde(default)]
    pub on_finalize: RawHook,
    #[serde(default)]
    pub finalized: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExtrinsic {
    pub method: MethodId,
    #[serde(default)]
    pub signature: Option<RawSignature>,
    #[serde(default, deserialize_with = "lenient_string::deserialize_option")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub args: Value,
    #[serde(default, deserialize_with = "lenient_string::deserialize_option")]
    pub tip: Option<String>,
    #[serde(default, deserialize_with = "lenient_string::deserialize")]
    pub hash: String,
    #[serde(default)]
    pub info: Value,
    #[serde(default)]
    pub era: Era,
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub success: Value,
    #[serde(default)]
    pub pays_fee: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSignature {
    pub signature: String,
    pub signer: RawSigner,
}

/// Older sidecar releases send the signer as a bare address
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawSigner {
    Account { id: String },
    Address(String),
}

impl RawSigner {
    pub fn into_id(self) -> String {
        match self {
            Self::Account { id } => id,
            Self::Address(address) => address,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub method: MethodId,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    #[serde(rename = "type")]
    pub log_type: String,
    #[serde(deserialize_with = "lenient_string::deserialize")]
    pub index: String,
    #[serde(default)]
    pub value: Value,
}

/// `onInitialize` / `onFinalize`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHook {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

/// Decode the payload fetched for block `requested`.
///
/// The payload's own number is checked first: a sidecar behind a load
/// balancer can answer with a different block, and that must never be stored
/// under the requested number.
pub fn decode_block(requested: u64, payload: Value) -> Result<RawBlock, IngestError> {
    let number = payload
        .get("number")
        .ok_or_else(|| IngestError::Validation { block: requested, reason: "payload has no `number`".to_string() })?;

    let returned = match string_number::deserialize(number) {
        Ok(returned) => returned,
        Err(_) => return Err(IngestError::BlockMismatch { requested, returned: number.to_string() }),
    };
    if returned != requested {
        return Err(IngestError::BlockMismatch { requested, returned: returned.to_string() });
    }

    serde_json::from_value(payload)
        .map_err(|e| IngestError::Validation { block: requested, reason: format!("malformed payload: {}", e) })
}

/// Read the number out of a `/blocks/head` response
pub fn parse_head(payload: &Value) -> Result<u64, IngestError> {
    let number = payload
        .get("number")
        .ok_or_else(|| IngestError::InvalidHead { reason: "response has no `number`".to_string() })?;

    string_number::deserialize(number).map_err(|e| IngestError::InvalidHead { reason: e.to_string() })
}
