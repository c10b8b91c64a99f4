//! Ledger rows
//!
//! Every table row carries an explicit surrogate id assigned on insert.
//! Rows that take part in block hashing also name the block that last
//! wrote them.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{Debug, Display};

pub type RowId = u64;

/// The block currently being processed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    /// Surrogate id of the block row
    pub id: RowId,
    pub height: u64,
}

/// A table row with a stable surrogate id
pub trait Row: Clone + Serialize + DeserializeOwned + Send + Sync {
    /// Key prefix of the table in storage
    const TAG: u8;
    const TABLE: &'static str;

    /// Secondary lookup key; never changes after insert
    type Key: Ord + Clone + Debug + Send + Sync;

    fn id(&self) -> RowId;

    fn key(&self) -> Self::Key;

    /// Block whose processing last wrote this row, for hashed tables
    fn touched_in(&self) -> Option<RowId> {
        None
    }

    /// Textual column values in declaration order, `None` for null
    fn columns(&self) -> Vec<Option<String>>;
}

fn col<T: Display>(value: T) -> Option<String> {
    Some(value.to_string())
}

fn opt<T: Display>(value: &Option<T>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: RowId,
    pub hash: String,
    pub height: u64,
    /// Sealed digest, set exactly once
    pub digest: Option<String>,
}

impl Row for BlockRow {
    const TAG: u8 = 1;
    const TABLE: &'static str = "block";
    type Key = u64;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> u64 {
        self.height
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![col(self.id), col(&self.hash), col(self.height), opt(&self.digest)]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRow {
    pub id: RowId,
    pub hash: String,
    pub block: RowId,
    pub confirmations: u64,
}

impl Row for TxRow {
    const TAG: u8 = 2;
    const TABLE: &'static str = "tx";
    type Key = String;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> String {
        self.hash.clone()
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![
            col(self.id),
            col(&self.hash),
            col(self.block),
            col(self.confirmations),
        ]
    }
}

/// Unlocking script of a stored transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInRow {
    pub id: RowId,
    pub tx: RowId,
    /// Spent transaction hash, absent for coinbase inputs
    pub hash: Option<String>,
    pub script: Option<String>,
}

impl Row for TxInRow {
    const TAG: u8 = 3;
    const TABLE: &'static str = "txin";
    type Key = RowId;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> RowId {
        self.tx
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![col(self.id), col(self.tx), opt(&self.hash), opt(&self.script)]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutRow {
    pub id: RowId,
    pub tx: RowId,
    /// Satoshis
    pub value: u64,
    pub script_type: String,
    /// Comma-separated
    pub addresses: Option<String>,
    pub script: String,
}

impl Row for TxOutRow {
    const TAG: u8 = 4;
    const TABLE: &'static str = "txout";
    type Key = RowId;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> RowId {
        self.tx
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![
            col(self.id),
            col(self.tx),
            col(self.value),
            col(&self.script_type),
            opt(&self.addresses),
            col(&self.script),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRow {
    pub id: RowId,
    /// Issuing address, unique
    pub address: String,
    pub tx: RowId,
    pub created: RowId,
    pub updated: Option<RowId>,
    pub supply: u64,
    pub decimals: u32,
    pub symbol: String,
    pub name: Option<String>,
    pub main_uri: Option<String>,
    pub image_uri: Option<String>,
}

impl Row for TokenRow {
    const TAG: u8 = 5;
    const TABLE: &'static str = "token";
    type Key = String;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> String {
        self.address.clone()
    }

    fn touched_in(&self) -> Option<RowId> {
        Some(self.updated.unwrap_or(self.created))
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![
            col(self.id),
            col(&self.address),
            col(self.tx),
            col(self.created),
            opt(&self.updated),
            col(self.supply),
            col(self.decimals),
            col(&self.symbol),
            opt(&self.name),
            opt(&self.main_uri),
            opt(&self.image_uri),
        ]
    }
}

/// Holdings of one address in one token; `available <= units`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub id: RowId,
    pub token: RowId,
    pub address: String,
    pub updated: RowId,
    pub units: u64,
    pub available: u64,
}

impl Row for BalanceRow {
    const TAG: u8 = 6;
    const TABLE: &'static str = "balance";
    type Key = (RowId, String);

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> (RowId, String) {
        (self.token, self.address.clone())
    }

    fn touched_in(&self) -> Option<RowId> {
        Some(self.updated)
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![
            col(self.id),
            col(self.token),
            col(&self.address),
            col(self.updated),
            col(self.units),
            col(self.available),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRow {
    pub id: RowId,
    pub token: RowId,
    pub tx: RowId,
    pub block: RowId,
    pub from: String,
    pub to: String,
    pub units: u64,
}

impl Row for TransferRow {
    const TAG: u8 = 7;
    const TABLE: &'static str = "transfer";
    type Key = RowId;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> RowId {
        self.token
    }

    fn touched_in(&self) -> Option<RowId> {
        Some(self.block)
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![
            col(self.id),
            col(self.token),
            col(self.tx),
            col(self.block),
            col(&self.from),
            col(&self.to),
            col(self.units),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementRow {
    pub id: RowId,
    pub token: RowId,
    pub tx: RowId,
    pub created: RowId,
    pub updated: RowId,
    pub finished: Option<RowId>,
    /// Heights, inclusive
    pub begins: u64,
    pub ends: Option<u64>,
    pub delivers: u64,
    /// Units reserved from the issuer
    pub available: u64,
    pub claimed: u64,
    pub rate: Option<i64>,
    pub minimum: u64,
    pub maximum: u64,
    pub preregister: bool,
}

impl AdvertisementRow {
    /// Open at `height`: started, not past its end, not finished
    pub fn is_open_at(&self, height: u64) -> bool {
        self.finished.is_none()
            && self.begins <= height
            && self.ends.map_or(true, |end| height <= end)
    }

    /// Not yet started, accepting preregistrations
    pub fn is_preregistering_at(&self, height: u64) -> bool {
        self.finished.is_none() && self.preregister && self.begins > height
    }

    /// Unclaimed part of the reserved pool
    pub fn unclaimed(&self) -> u64 {
        self.available.saturating_sub(self.claimed)
    }
}

impl Row for AdvertisementRow {
    const TAG: u8 = 8;
    const TABLE: &'static str = "advertisement";
    type Key = RowId;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> RowId {
        self.token
    }

    fn touched_in(&self) -> Option<RowId> {
        Some(self.updated)
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![
            col(self.id),
            col(self.token),
            col(self.tx),
            col(self.created),
            col(self.updated),
            opt(&self.finished),
            col(self.begins),
            opt(&self.ends),
            col(self.delivers),
            col(self.available),
            col(self.claimed),
            opt(&self.rate),
            col(self.minimum),
            col(self.maximum),
            col(self.preregister),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRow {
    pub id: RowId,
    pub advertisement: RowId,
    pub tx: RowId,
    pub address: String,
    pub created: RowId,
    pub updated: RowId,
    pub finished: Option<RowId>,
    pub maximum: u64,
    /// Satoshis paid to the issuer so far
    pub payments: u64,
    pub claimed: u64,
}

impl Row for RegistrationRow {
    const TAG: u8 = 9;
    const TABLE: &'static str = "registration";
    type Key = RowId;

    fn id(&self) -> RowId {
        self.id
    }

    fn key(&self) -> RowId {
        self.advertisement
    }

    fn touched_in(&self) -> Option<RowId> {
        Some(self.updated)
    }

    fn columns(&self) -> Vec<Option<String>> {
        vec![
            col(self.id),
            col(self.advertisement),
            col(self.tx),
            col(&self.address),
            col(self.created),
            col(self.updated),
            opt(&self.finished),
            col(self.maximum),
            col(self.payments),
            col(self.claimed),
        ]
    }
}
