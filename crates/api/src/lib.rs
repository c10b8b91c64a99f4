//! ORBIT API - read-only HTTP queries over committed ledger state
//!
//! - `GET /user_tokens?address=` lists every token an address holds
//! - `GET /status` reports the last committed block height

pub mod server;

pub use server::{ApiError, ApiServer};

/// Default bind interface for the query surface
pub const DEFAULT_INTERFACE: &str = "127.0.0.1";

/// Default port for the query surface
pub const DEFAULT_PORT: u16 = 8040;
