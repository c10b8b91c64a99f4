//! Ledger Errors
//!
//! A [`RuleViolation`] voids one directive and processing continues. A
//! [`StructuralError`] aborts the block without advancing the checkpoint.

use crate::rows::RowId;
use thiserror::Error;

/// Business-rule failures; the offending directive is voided
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    #[error("Token already exists at {0}")]
    DuplicateToken(String),

    #[error("No token at {0}")]
    NoToken(String),

    #[error("Sender and recipient are the same address")]
    SameAddress,

    #[error("{address} holds no balance of this token")]
    NoBalance { address: String },

    #[error("Insufficient available units: requested {requested}, available {available}")]
    InsufficientAvailable { requested: u64, available: u64 },

    #[error("Invalid block range: {0}")]
    InvalidBlockRange(String),

    #[error("Overlaps advertisement {0}")]
    OverlappingAdvertisement(RowId),

    #[error("Preregistration advertisement {0} is already pending")]
    ConflictingPreregistration(RowId),

    #[error("Per-user minimum {minimum} exceeds maximum {maximum}")]
    InvalidLimits { minimum: u64, maximum: u64 },

    #[error("Requested maximum {requested} is below the advertisement minimum {minimum}")]
    BelowAdvertisementMinimum { requested: u64, minimum: u64 },

    #[error("No eligible advertisement")]
    NoEligibleAdvertisement,

    #[error("No active registration")]
    NoActiveRegistration,

    #[error("Operation requires admin but no proof of ownership for token address in transaction")]
    AdminRequired,

    #[error("Operation may not be used by admin but transaction indicates proof of ownership for token address")]
    AdminForbidden,

    #[error("Unable to determine signer's address from transaction inputs")]
    NoSigner,

    #[error("Arithmetic overflow")]
    Overflow,
}

/// Integrity failures; the block is aborted and safe to retry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("Transaction inputs are signed by more than one address: {0:?}")]
    AmbiguousSigner(Vec<String>),

    #[error("Token {token} has {open} open and {future} future preregistering advertisements")]
    MultipleActiveAdvertisements {
        token: RowId,
        open: usize,
        future: usize,
    },

    #[error("{address} has {count} active registrations on advertisement {advertisement}")]
    MultipleActiveRegistrations {
        advertisement: RowId,
        address: String,
        count: usize,
    },

    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("Predecessor of block {height} is missing")]
    MissingPredecessor { height: u64 },

    #[error("Expected exactly one unsealed block, found {0}")]
    MultipleUnsealedBlocks(usize),

    #[error("Payment output in {txid} pays multiple addresses")]
    MultiAddressPayment { txid: String },

    #[error("Missing {table} row {id}")]
    MissingRow { table: &'static str, id: RowId },

    #[error("Balance {id} would go negative or exceed its units")]
    BalanceUnderflow { id: RowId },
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Violation(#[from] RuleViolation),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl LedgerError {
    /// Whether the error must abort the block
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LedgerError::Violation(_))
    }

    pub fn violation(&self) -> Option<&RuleViolation> {
        match self {
            LedgerError::Violation(v) => Some(v),
            _ => None,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

pub(crate) fn checked_add(a: u64, b: u64) -> LedgerResult<u64> {
    a.checked_add(b).ok_or_else(|| RuleViolation::Overflow.into())
}
