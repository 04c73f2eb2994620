/// Test fixtures shared across modules: canonical blocks, sidecar payloads and
/// a scripted block source.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    error::IngestError,
    models::{Block, Era, Event, Extrinsic, Log, MethodId, Opaque, Signature, Signer},
    rpc::BlockSource,
};

pub const TIMESTAMP_MS: i64 = 1_700_000_000_000;

fn method(pallet: &str, name: &str) -> MethodId {
    MethodId { pallet: pallet.to_string(), method: name.to_string() }
}

/// A normalized `polkadot/assethub` block with one inherent and one signed transfer
pub fn sample_block(number: u64) -> Block {
    let deposit = Event {
        method: method("balances", "Deposit"),
        data: Opaque::from(json!(["15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5", "1000"])),
    };
    let success = Event {
        method: method("system", "ExtrinsicSuccess"),
        data: Opaque::from(json!([{"weight": {"refTime": "1000", "proofSize": "0"}, "class": "Mandatory"}])),
    };

    Block {
        relay_chain: "polkadot".to_string(),
        chain: "assethub".to_string(),
        number,
        hash: format!("0x{:064x}", number),
        parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
        state_root: "0x5e".to_string(),
        extrinsics_root: "0x3a".to_string(),
        author_id: "14ShUZUYUR35RBZW6uVVt1zXDxmSQddkeDdXf1JkMA6P721N".to_string(),
        timestamp: TIMESTAMP_MS,
        finalized: false,
        extrinsics: vec![
            Extrinsic {
                method: method("timestamp", "set"),
                signature: None,
                nonce: None,
                args: Opaque::from(json!({"now": TIMESTAMP_MS.to_string()})),
                tip: None,
                hash: "0xaa".to_string(),
                info: Opaque::from(json!({})),
                era: Era { immortal_era: Some("0x00".to_string()), mortal_era: None },
                events: vec![success.clone()],
                success: true,
                pays_fee: false,
            },
            Extrinsic {
                method: method("balances", "transferKeepAlive"),
                signature: Some(Signature {
                    signature: "0x01ab".to_string(),
                    signer: Signer { id: "12xLgPQunSsPkwMJ3vAgfac7mtU3Xw6R4fbHQcCp2QqXzdtu".to_string() },
                }),
                nonce: Some("7".to_string()),
                args: Opaque::from(json!({"dest": {"id": "15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5"}, "value": "1000"})),
                tip: Some("0".to_string()),
                hash: "0xbb".to_string(),
                info: Opaque::from(json!({"partialFee": "15000000", "class": "Normal"})),
                era: Era { immortal_era: None, mortal_era: Some(vec!["64".to_string(), "12".to_string()]) },
                events: vec![deposit, success],
                success: true,
                pays_fee: true,
            },
        ],
        on_initialize: vec![],
        on_finalize: vec![Event {
            method: method("parachainSystem", "UpwardMessageSent"),
            data: Opaque::from(json!({"messageHash": "0x99"})),
        }],
        logs: vec![Log {
            log_type: "PreRuntime".to_string(),
            index: "6".to_string(),
            value: Opaque::from(json!(["0x61757261", "0x12"])),
        }],
    }
}

/// The sidecar `/blocks/{number}` response that normalizes to [`sample_block`]
pub fn sample_payload(number: u64) -> Value {
    json!({
        "number": number.to_string(),
        "hash": format!("0x{:064x}", number),
        "parentHash": format!("0x{:064x}", number.saturating_sub(1)),
        "stateRoot": "0x5e",
        "extrinsicsRoot": "0x3a",
        "authorId": "14ShUZUYUR35RBZW6uVVt1zXDxmSQddkeDdXf1JkMA6P721N",
        "logs": [
            {"type": "PreRuntime", "index": "6", "value": ["0x61757261", "0x12"]}
        ],
        "onInitialize": {"events": []},
        "extrinsics": [
            {
                "method": {"pallet": "timestamp", "method": "set"},
                "signature": null,
                "nonce": null,
                "args": {"now": TIMESTAMP_MS.to_string()},
                "tip": null,
                "hash": "0xaa",
                "info": {},
                "era": {"immortalEra": "0x00"},
                "events": [
                    {
                        "method": {"pallet": "system", "method": "ExtrinsicSuccess"},
                        "data": [{"weight": {"refTime": "1000", "proofSize": "0"}, "class": "Mandatory"}]
                    }
                ],
                "success": true,
                "paysFee": false
            },
            {
                "method": {"pallet": "balances", "method": "transferKeepAlive"},
                "signature": {
                    "signature": "0x01ab",
                    "signer": {"id": "12xLgPQunSsPkwMJ3vAgfac7mtU3Xw6R4fbHQcCp2QqXzdtu"}
                },
                "nonce": "7",
                "args": {"value": "1000", "dest": {"id": "15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5"}},
                "tip": "0",
                "hash": "0xbb",
                "info": {"class": "Normal", "partialFee": "15000000"},
                "era": {"mortalEra": ["64", "12"]},
                "events": [
                    {
                        "method": {"pallet": "balances", "method": "Deposit"},
                        "data": ["15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5", "1000"]
                    },
                    {
                        "method": {"pallet": "system", "method": "ExtrinsicSuccess"},
                        "data": [{"weight": {"refTime": "1000", "proofSize": "0"}, "class": "Mandatory"}]
                    }
                ],
                "success": true,
                "paysFee": true
            }
        ],
        "onFinalize": {
            "events": [
                {"method": {"pallet": "parachainSystem", "method": "UpwardMessageSent"}, "data": {"messageHash": "0x99"}}
            ]
        },
        "finalized": false
    })
}

/// What a scripted fetch should produce
#[derive(Debug, Clone)]
pub enum Reply {
    /// A well-formed payload for the requested number
    Payload,
    /// A well-formed payload claiming to be another block
    Other(u64),
    /// The sidecar answers with this HTTP status
    Status(u16),
    /// Literal payload
    Raw(Value),
}

#[derive(Default)]
struct ScriptState {
    heads: VecDeque<u64>,
    last_head: u64,
    replies: HashMap<u64, VecDeque<Reply>>,
    requests: Vec<u64>,
}

/// In-process sidecar. Each `fetch_head` pops the next scripted head (the
/// last one repeats); each `fetch_payload` pops the next scripted reply for
/// that number, falling back to [`Reply::Payload`].
#[derive(Clone, Default)]
pub struct ScriptedSource {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedSource {
    pub fn with_heads(heads: &[u64]) -> Self {
        let source = Self::default();
        {
            let mut state = source.state.lock().unwrap();
            state.heads = heads.iter().copied().collect();
            state.last_head = heads.last().copied().unwrap_or(0);
        }
        source
    }

    pub fn script(&self, number: u64, replies: Vec<Reply>) {
        self.state.lock().unwrap().replies.entry(number).or_default().extend(replies);
    }

    /// Every block number fetched, in request order
    pub fn requests(&self) -> Vec<u64> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn attempts(&self, number: u64) -> usize {
        self.requests().iter().filter(|n| **n == number).count()
    }
}

#[async_trait]
impl BlockSource for ScriptedSource {
    async fn fetch_head(&self) -> Result<u64, IngestError> {
        let mut state = self.state.lock().unwrap();
        if let Some(head) = state.heads.pop_front() {
            state.last_head = head;
        }
        Ok(state.last_head)
    }

    async fn fetch_payload(&self, id: u64) -> Result<Value, IngestError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(id);
            state.replies.get_mut(&id).and_then(|queue| queue.pop_front()).unwrap_or(Reply::Payload)
        };

        match reply {
            Reply::Payload => Ok(sample_payload(id)),
            Reply::Other(number) => Ok(sample_payload(number)),
            Reply::Status(status) => {
                Err(IngestError::UnexpectedStatus { url: format!("http://sidecar.test/blocks/{}", id), status })
            }
            Reply::Raw(value) => Ok(value),
        }
    }
}
