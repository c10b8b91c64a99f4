//! Protocol Errors

use thiserror::Error;

/// Errors raised while decoding scripts and directive payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Script ends inside a push (need {needed} bytes, have {remaining})")]
    TruncatedPush { needed: usize, remaining: usize },

    #[error("Unexpected opcode 0x{0:02x} where a push was expected")]
    NotAPush(u8),

    #[error("Unsupported directive version {0}")]
    UnsupportedVersion(u8),

    #[error("Directive payload is missing its version byte")]
    MissingVersion,

    #[error("Malformed directive body: {0}")]
    MalformedBody(String),

    #[error("Invalid hex script: {0}")]
    InvalidHex(String),
}
