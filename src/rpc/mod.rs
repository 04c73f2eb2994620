/// RPC Client Module
///
/// This module handles all interactions with the Substrate API sidecar.
/// [`BlockSource`] is the seam the pipeline fetches through; [`SidecarClient`]
/// implements it over HTTP with `reqwest`.
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::IngestError,
    etl::extract::{decode_block, parse_head, RawBlock},
};

/// Where blocks come from. Stateless apart from network I/O.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Current chain head number
    async fn fetch_head(&self) -> Result<u64, IngestError>;

    /// Undecoded `/blocks/{id}` payload
    async fn fetch_payload(&self, id: u64) -> Result<Value, IngestError>;

    /// Fetch and decode block `id`, rejecting a payload for any other block
    async fn fetch_block(&self, id: u64) -> Result<RawBlock, IngestError> {
        let payload = self.fetch_payload(id).await?;
        decode_block(id, payload)
    }
}

pub struct SidecarClient {
    client: reqwest::Client,
    base_url: String,
}

impl SidecarClient {
    /// Create a new client for the sidecar at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    /// Get the endpoint URL this client is connected to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, path: &str) -> Result<Value, IngestError> {
        let url = format!("{}/{}", self.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::UnexpectedStatus { url, status: status.as_u16() });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl BlockSource for SidecarClient {
    async fn fetch_head(&self) -> Result<u64, IngestError> {
        let payload = self.get_json("blocks/head").await?;
        parse_head(&payload)
    }

    async fn fetch_payload(&self, id: u64) -> Result<Value, IngestError> {
        let payload = self.get_json(&format!("blocks/{}", id)).await?;

        tracing::debug!("Fetched block {}", id);
        Ok(payload)
    }
}
