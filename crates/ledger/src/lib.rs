//! ORBIT Ledger - token ledger validation engine
//!
//! This crate materializes the token ledger carried in data-carrier outputs:
//! - Staged, per-block unit of work over sled-backed tables
//! - Token, balance, advertisement and registration state transitions
//! - Signer resolution from unlocking scripts
//! - Chained per-block digests over every row a block touched
//! - Block processor and the continuous sync worker

pub mod chain_hash;
pub mod distribution;
pub mod error;
pub mod processor;
pub mod rows;
pub mod signer;
pub mod store;
pub mod sync;
pub mod table;
pub mod tokens;

#[cfg(test)]
mod tests;

pub use distribution::{AdvertisementTerms, Settlement};
pub use error::{LedgerError, LedgerResult, RuleViolation, StructuralError};
pub use processor::{BlockProcessor, BlockStage, BlockSummary, NodeInfo, ProcessorConfig, SyncError};
pub use rows::{
    AdvertisementRow, BalanceRow, BlockRef, BlockRow, RegistrationRow, RowId, TokenRow,
    TransferRow, TxInRow, TxOutRow, TxRow,
};
pub use store::{Changes, LedgerState, LedgerStore, UnitOfWork, UserToken};
pub use sync::{stop_signal, StopHandle, StopSignal, SyncHandle, SyncWorker};
pub use tokens::TokenTerms;

/// Default wait between chain polls once the ledger has caught up
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
