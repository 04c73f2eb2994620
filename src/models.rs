/// Data Models Module
///
/// This module defines the canonical block record persisted by every storage
/// backend: blocks, extrinsics, events and logs as produced by the normalizer.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ChainId;

/// A normalized block, keyed by `(relay_chain, chain, number)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(rename = "relay_chain")]
    pub relay_chain: String,
    pub chain: String,
    #[serde(with = "string_number")]
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub state_root: String,
    pub extrinsics_root: String,
    pub author_id: String,
    /// Milliseconds since the unix epoch, `0` when the block carries no timestamp extrinsic
    pub timestamp: i64,
    pub finalized: bool,
    pub extrinsics: Vec<Extrinsic>,
    pub on_initialize: Vec<Event>,
    pub on_finalize: Vec<Event>,
    pub logs: Vec<Log>,
}

impl Block {
    /// The `(relay_chain, chain)` pair this block belongs to
    pub fn chain_id(&self) -> ChainId {
        ChainId { relay_chain: self.relay_chain.clone(), chain: self.chain.clone() }
    }

    /// Block time as a UTC datetime, if the block carried a timestamp
    pub fn block_time(&self) -> Option<DateTime<Utc>> {
        if self.timestamp == 0 {
            return None;
        }
        DateTime::<Utc>::from_timestamp_millis(self.timestamp)
    }

    /// Every event in the block in execution order
    pub fn event_count(&self) -> usize {
        self.on_initialize.len()
            + self.extrinsics.iter().map(|ex| ex.events.len()).sum::<usize>()
            + self.on_finalize.len()
    }
}

/// Pallet and call/event name
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodId {
    pub pallet: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signature: String,
    pub signer: Signer,
}

/// Transaction mortality. Exactly one side is set for signed extrinsics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Era {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immortal_era: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mortal_era: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extrinsic {
    pub method: MethodId,
    pub signature: Option<Signature>,
    pub nonce: Option<String>,
    pub args: Opaque,
    pub tip: Option<String>,
    pub hash: String,
    pub info: Opaque,
    pub era: Era,
    pub events: Vec<Event>,
    pub success: bool,
    pub pays_fee: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub method: MethodId,
    pub data: Opaque,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(rename = "type")]
    pub log_type: String,
    pub index: String,
    pub value: Opaque,
}

/// An arbitrary structured value carried through the pipeline untouched.
///
/// Serializes as the structured JSON value, so backends with native nested
/// types store it directly. [`Opaque::encode`] yields the canonical string form
/// (compact JSON with object keys sorted) for backends that store text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Opaque(Value);

impl Serialize for Opaque {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Opaque {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::new)
    }
}

impl Opaque {
    pub fn new(value: Value) -> Self {
        Self(canonicalize(value))
    }

    /// Canonical string form
    pub fn encode(&self) -> String {
        self.0.to_string()
    }

    /// Inverse of [`Opaque::encode`]
    pub fn decode(encoded: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Value>(encoded).map(Self::new)
    }
}

impl From<Value> for Opaque {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Rebuild every object with its keys in sorted order.
///
/// `serde_json::Map` is ordered by key unless `preserve_order` is enabled
/// somewhere in the build, in which case insertion order wins.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Block numbers travel as decimal strings and are accepted as either strings
/// or JSON integers.
pub mod string_number {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Int(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Int(n) => Ok(n),
            Repr::Text(s) => s.trim().parse().map_err(|_| de::Error::custom(format!("invalid block number `{s}`"))),
        }
    }
}

/// Strings that some sidecar versions emit as bare integers (log indices, nonces)
pub mod lenient_string {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }
}
