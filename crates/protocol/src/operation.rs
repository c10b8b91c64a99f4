//! Token Directives

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

/// Who may sign a directive relative to the token's issuing address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminRequirement {
    /// Signer must be the token address
    Issuer,
    /// Signer must not be the token address
    NonIssuer,
    /// Anyone may sign
    Unrestricted,
}

impl AdminRequirement {
    /// Check the requirement against whether the signer is the issuer
    pub fn permits(self, signer_is_issuer: bool) -> bool {
        match self {
            AdminRequirement::Issuer => signer_is_issuer,
            AdminRequirement::NonIssuer => !signer_is_issuer,
            AdminRequirement::Unrestricted => true,
        }
    }
}

/// Directive bound to a token address
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Create a token at the signing address with a fixed supply
    Create {
        supply: u64,
        decimals: u32,
        symbol: String,
        name: Option<String>,
        main_uri: Option<String>,
        image_uri: Option<String>,
    },

    /// Move units from the signer to another address
    Transfer { to: String, units: u64 },

    /// Open a time-boxed distribution of issuer units
    Advertise {
        /// Positive: units per satoshi; negative: satoshis per unit; none: free
        exchange_rate: Option<i64>,
        units_avail: Option<u64>,
        units_min: Option<u64>,
        units_max: Option<u64>,
        block_begin: Option<u64>,
        block_end: Option<u64>,
        block_deliver: Option<u64>,
        preregister: bool,
    },

    /// Cancel the issuer's advertisement
    Cancel,

    /// Claim against the eligible advertisement
    Register { units_max: u64 },

    /// Withdraw the signer's active registration
    Unregister,
}

impl Operation {
    pub fn admin(&self) -> AdminRequirement {
        match self {
            Operation::Create { .. } | Operation::Advertise { .. } | Operation::Cancel => {
                AdminRequirement::Issuer
            }
            Operation::Transfer { .. } | Operation::Register { .. } | Operation::Unregister => {
                AdminRequirement::NonIssuer
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Transfer { .. } => "transfer",
            Operation::Advertise { .. } => "advertise",
            Operation::Cancel => "cancel",
            Operation::Register { .. } => "register",
            Operation::Unregister => "unregister",
        }
    }
}

fn opt<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create {
                supply,
                decimals,
                symbol,
                name,
                ..
            } => write!(
                f,
                "create {} (supply={} decimals={} name={})",
                symbol,
                supply,
                decimals,
                opt(name)
            ),
            Operation::Transfer { to, units } => write!(f, "transfer {} to {}", units, to),
            Operation::Advertise {
                exchange_rate,
                units_avail,
                units_min,
                units_max,
                block_begin,
                block_end,
                block_deliver,
                preregister,
            } => write!(
                f,
                "advertise rate={} avail={} min={} max={} begin={} end={} deliver={} preregister={}",
                opt(exchange_rate),
                opt(units_avail),
                opt(units_min),
                opt(units_max),
                opt(block_begin),
                opt(block_end),
                opt(block_deliver),
                preregister
            ),
            Operation::Cancel => write!(f, "cancel"),
            Operation::Register { units_max } => write!(f, "register max={}", units_max),
            Operation::Unregister => write!(f, "unregister"),
        }
    }
}
