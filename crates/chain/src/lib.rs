//! Chain Source - block and transaction data for the ledger
//!
//! The ledger pulls everything it validates through [`ChainSource`]:
//! - chain status (best height, pruning)
//! - block hashes and headers by height
//! - verbose raw transactions, requested in bounded batches

pub mod rpc;
pub mod source;
pub mod types;

pub use rpc::RpcChainSource;
pub use source::{ChainError, ChainSource};
pub use types::{BlockHeader, ChainStatus, RawInput, RawOutput, RawTransaction};
