//! ORBIT protocol model
//!
//! Shared vocabulary between the chain reader, the ledger and the node:
//! - [`Operation`]: the closed set of token directives
//! - [`DirectiveCodec`]: decoding data-carrier payloads into directives
//! - script push parsing and P2PKH address derivation

pub mod address;
pub mod codec;
pub mod error;
pub mod operation;
pub mod script;

pub use address::{hash160, p2pkh_address, Network};
pub use codec::{Directive, DirectiveCodec, EnvelopeCodec};
pub use error::DecodeError;
pub use operation::{AdminRequirement, Operation};

/// First mainnet block scanned for directives
pub const MAINNET_LAUNCH_HEIGHT: u64 = 556_767;

/// First testnet block scanned for directives
pub const TESTNET_LAUNCH_HEIGHT: u64 = 1_282_000;

/// Satoshis per whole coin, used to normalize output values
pub const SATS_PER_COIN: u64 = 100_000_000;

/// Maximum transactions requested from the chain source in one batch
pub const MAX_TX_BATCH: usize = 1000;
