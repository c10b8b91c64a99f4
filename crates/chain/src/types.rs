//! Chain data as the ledger consumes it

use serde::{Deserialize, Serialize};

/// Snapshot of the source node's sync state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    /// Last fully validated block on the source
    pub best_height: u64,
    /// Last known header on the source
    pub header_height: u64,
    pub pruned: bool,
    pub prune_height: Option<u64>,
}

/// Block hash plus the hashes of its transactions, in block order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    pub transactions: Vec<String>,
}

/// Transaction input; coinbase inputs carry neither field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInput {
    /// Hash of the transaction being spent
    pub txid: Option<String>,
    /// Unlocking script, hex
    pub unlock_script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutput {
    /// Value in satoshis
    pub value: u64,
    pub script_type: String,
    pub addresses: Option<Vec<String>>,
    /// Locking script, hex
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    pub confirmations: u64,
    pub inputs: Vec<RawInput>,
    pub outputs: Vec<RawOutput>,
}
