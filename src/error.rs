/// Error Module
///
/// Failure taxonomy for one block's trip through the pipeline. Every variant is
/// caught at the per-block retry boundary; only `Stuck` ever escapes it.
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sidecar request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("sidecar returned HTTP {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("sidecar returned an unreadable chain head: {reason}")]
    InvalidHead { reason: String },

    #[error("requested block {requested} but sidecar returned block {returned}")]
    BlockMismatch { requested: u64, returned: String },

    #[error("invalid block {block}: {reason}")]
    Validation { block: u64, reason: String },

    #[error("storage connection failed: {0}")]
    Connection(#[source] StorageError),

    #[error("storage operation failed: {0}")]
    Storage(#[source] StorageError),

    #[error("block {block} is stuck after {attempts} attempts: {source}")]
    Stuck {
        block: u64,
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// Short label used in retry logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) | Self::UnexpectedStatus { .. } | Self::InvalidHead { .. } => "network",
            Self::BlockMismatch { .. } => "block_mismatch",
            Self::Validation { .. } => "validation",
            Self::Connection(_) => "connection",
            Self::Storage(_) => "storage",
            Self::Stuck { .. } => "stuck",
        }
    }

    /// Errors that will not go away by asking again.
    ///
    /// Malformed payloads count as transient: the sidecar occasionally serves a
    /// half-built block that is fine on the next request.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::UnexpectedStatus { status, .. } => (400..500).contains(status) && *status != 408 && *status != 429,
            Self::Storage(e) => e.is_permanent(),
            Self::Stuck { .. } => true,
            _ => false,
        }
    }
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        if err.is_connection() {
            Self::Connection(err)
        } else {
            Self::Storage(err)
        }
    }
}
