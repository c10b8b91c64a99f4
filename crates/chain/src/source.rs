//! Chain source contract

use crate::types::{BlockHeader, ChainStatus, RawTransaction};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid RPC URL: {0}")]
    InvalidUrl(String),
    #[error("RPC transport error: {0}")]
    Transport(String),
    #[error("RPC call {method} failed: {message}")]
    Rpc { method: String, message: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Request/response access to a full node's block data
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn chain_status(&self) -> Result<ChainStatus, ChainError>;

    async fn block_hash(&self, height: u64) -> Result<String, ChainError>;

    async fn block(&self, hash: &str) -> Result<BlockHeader, ChainError>;

    /// Fetch verbose transactions in request order
    ///
    /// Callers keep `txids` within [`orbit_protocol::MAX_TX_BATCH`]. The
    /// block hash hint is required by pruned sources.
    async fn raw_transactions(
        &self,
        txids: &[String],
        block_hint: Option<&str>,
    ) -> Result<Vec<RawTransaction>, ChainError>;
}
