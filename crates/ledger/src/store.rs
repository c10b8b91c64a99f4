//! Ledger Store
//!
//! Committed state lives in memory behind a shared lock and in a sled tree.
//! Each block is processed in a [`UnitOfWork`] staged over the committed
//! tables; its [`Changes`] are written as one sled batch together with the
//! checkpoint, then merged into memory. Readers never see staged rows.

use crate::{
    error::LedgerResult,
    rows::{
        AdvertisementRow, BalanceRow, BlockRef, BlockRow, RegistrationRow, Row, RowId, TokenRow,
        TransferRow, TxInRow, TxOutRow, TxRow,
    },
    table::{Staged, Table, TableChanges},
};
use orbit_chain::RawTransaction;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::{ops::Bound, path::Path};

const TREE: &str = "ledger";
const KEY_HEIGHT: &[u8] = b"\xffheight";
const KEY_COMMITTED_AT: &[u8] = b"\xffcommitted_at";

fn row_key(tag: u8, id: RowId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = tag;
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

/// A holder's position in one token, as served to the query surface
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserToken {
    pub token_address: String,
    pub symbol: String,
    pub decimals: u32,
    pub name: Option<String>,
    pub units: u64,
    pub available: u64,
}

/// Committed ledger tables plus the checkpoint
#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    pub(crate) blocks: Table<BlockRow>,
    pub(crate) txs: Table<TxRow>,
    pub(crate) txins: Table<TxInRow>,
    pub(crate) txouts: Table<TxOutRow>,
    pub(crate) tokens: Table<TokenRow>,
    pub(crate) balances: Table<BalanceRow>,
    pub(crate) transfers: Table<TransferRow>,
    pub(crate) advertisements: Table<AdvertisementRow>,
    pub(crate) registrations: Table<RegistrationRow>,
    last_height: Option<u64>,
    committed_at: Option<i64>,
}

impl LedgerState {
    /// Last block height durably processed
    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Unix timestamp of the last commit
    pub fn committed_at(&self) -> Option<i64> {
        self.committed_at
    }

    /// Open a unit of work over this state
    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            blocks: self.blocks.stage(),
            txs: self.txs.stage(),
            txins: self.txins.stage(),
            txouts: self.txouts.stage(),
            tokens: self.tokens.stage(),
            balances: self.balances.stage(),
            transfers: self.transfers.stage(),
            advertisements: self.advertisements.stage(),
            registrations: self.registrations.stage(),
            last_height: self.last_height,
        }
    }

    fn apply(&mut self, changes: Changes, committed_at: i64) {
        self.blocks.apply(changes.blocks);
        self.txs.apply(changes.txs);
        self.txins.apply(changes.txins);
        self.txouts.apply(changes.txouts);
        self.tokens.apply(changes.tokens);
        self.balances.apply(changes.balances);
        self.transfers.apply(changes.transfers);
        self.advertisements.apply(changes.advertisements);
        self.registrations.apply(changes.registrations);
        self.last_height = changes.last_height;
        self.committed_at = Some(committed_at);
    }
}

/// Everything one unit of work wrote
#[derive(Clone, Debug)]
pub struct Changes {
    pub blocks: TableChanges<BlockRow>,
    pub txs: TableChanges<TxRow>,
    pub txins: TableChanges<TxInRow>,
    pub txouts: TableChanges<TxOutRow>,
    pub tokens: TableChanges<TokenRow>,
    pub balances: TableChanges<BalanceRow>,
    pub transfers: TableChanges<TransferRow>,
    pub advertisements: TableChanges<AdvertisementRow>,
    pub registrations: TableChanges<RegistrationRow>,
    pub last_height: Option<u64>,
}

/// Staged mutations for one block over the committed state
pub struct UnitOfWork<'a> {
    pub(crate) blocks: Staged<'a, BlockRow>,
    pub(crate) txs: Staged<'a, TxRow>,
    pub(crate) txins: Staged<'a, TxInRow>,
    pub(crate) txouts: Staged<'a, TxOutRow>,
    pub(crate) tokens: Staged<'a, TokenRow>,
    pub(crate) balances: Staged<'a, BalanceRow>,
    pub(crate) transfers: Staged<'a, TransferRow>,
    pub(crate) advertisements: Staged<'a, AdvertisementRow>,
    pub(crate) registrations: Staged<'a, RegistrationRow>,
    last_height: Option<u64>,
}

impl<'a> UnitOfWork<'a> {
    // ============ Audit Trail ============

    pub fn save_block(&mut self, hash: &str, height: u64) -> BlockRef {
        let id = self.blocks.insert(|id| BlockRow {
            id,
            hash: hash.to_string(),
            height,
            digest: None,
        });
        BlockRef { id, height }
    }

    /// Store a transaction with its inputs and outputs
    pub fn save_tx(&mut self, tx: &RawTransaction, block: BlockRef) -> RowId {
        let tx_id = self.txs.insert(|id| TxRow {
            id,
            hash: tx.txid.clone(),
            block: block.id,
            confirmations: tx.confirmations,
        });

        for input in &tx.inputs {
            self.txins.insert(|id| TxInRow {
                id,
                tx: tx_id,
                hash: input.txid.clone(),
                script: input.unlock_script.clone(),
            });
        }

        for output in &tx.outputs {
            self.txouts.insert(|id| TxOutRow {
                id,
                tx: tx_id,
                value: output.value,
                script_type: output.script_type.clone(),
                addresses: output.addresses.as_ref().map(|a| a.join(",")),
                script: output.script.clone(),
            });
        }

        tx_id
    }

    pub fn tx_outputs(&self, tx: RowId) -> Vec<&TxOutRow> {
        self.txouts.find(&tx).collect()
    }

    // ============ Checkpoint ============

    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    pub fn set_last_height(&mut self, height: u64) {
        self.last_height = Some(height);
    }

    // ============ Reads ============

    pub fn block(&self, id: RowId) -> Option<&BlockRow> {
        self.blocks.get(id)
    }

    pub fn block_at(&self, height: u64) -> Option<&BlockRow> {
        self.blocks.find(&height).next()
    }

    pub fn token(&self, address: &str) -> Option<&TokenRow> {
        self.tokens.find(&address.to_string()).next()
    }

    pub fn balance(&self, token: RowId, address: &str) -> Option<&BalanceRow> {
        self.balances.find(&(token, address.to_string())).next()
    }

    /// Balance of `holder` in the token issued at `token_address`
    pub fn balance_of(&self, token_address: &str, holder: &str) -> Option<&BalanceRow> {
        let token = self.token(token_address)?;
        self.balance(token.id, holder)
    }

    pub fn balances_of_token(&self, token: RowId) -> impl Iterator<Item = &BalanceRow> + '_ {
        let end = match token.checked_add(1) {
            Some(next) => Bound::Excluded((next, String::new())),
            None => Bound::Unbounded,
        };
        self.balances
            .find_range((Bound::Included((token, String::new())), end))
    }

    pub fn advertisement(&self, id: RowId) -> Option<&AdvertisementRow> {
        self.advertisements.get(id)
    }

    pub fn advertisements_of_token(
        &self,
        token: RowId,
    ) -> impl Iterator<Item = &AdvertisementRow> + '_ {
        self.advertisements.find(&token)
    }

    pub fn registration(&self, id: RowId) -> Option<&RegistrationRow> {
        self.registrations.get(id)
    }

    pub fn registrations_of(
        &self,
        advertisement: RowId,
    ) -> impl Iterator<Item = &RegistrationRow> + '_ {
        self.registrations.find(&advertisement)
    }

    pub fn transfers_of_token(&self, token: RowId) -> impl Iterator<Item = &TransferRow> + '_ {
        self.transfers.find(&token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &TokenRow> + '_ {
        self.tokens.iter()
    }

    /// Every (token, balance) pair held by `address`
    pub fn user_tokens(&self, address: &str) -> Vec<UserToken> {
        self.balances
            .iter()
            .filter(|b| b.address == address)
            .filter_map(|b| {
                let token = self.tokens.get(b.token)?;
                Some(UserToken {
                    token_address: token.address.clone(),
                    symbol: token.symbol.clone(),
                    decimals: token.decimals,
                    name: token.name.clone(),
                    units: b.units,
                    available: b.available,
                })
            })
            .collect()
    }

    /// Close the unit of work, yielding what it wrote
    pub fn finish(self) -> Changes {
        Changes {
            blocks: self.blocks.into_changes(),
            txs: self.txs.into_changes(),
            txins: self.txins.into_changes(),
            txouts: self.txouts.into_changes(),
            tokens: self.tokens.into_changes(),
            balances: self.balances.into_changes(),
            transfers: self.transfers.into_changes(),
            advertisements: self.advertisements.into_changes(),
            registrations: self.registrations.into_changes(),
            last_height: self.last_height,
        }
    }
}

fn load_table<R: Row>(tree: &sled::Tree) -> LedgerResult<Table<R>> {
    let mut rows = Vec::new();
    for entry in tree.scan_prefix([R::TAG]) {
        let (_, value) = entry?;
        rows.push(bincode::deserialize::<R>(&value)?);
    }
    Ok(Table::from_rows(rows))
}

fn stage_table<R: Row>(batch: &mut sled::Batch, changes: &TableChanges<R>) -> LedgerResult<()> {
    for row in changes.rows() {
        batch.insert(&row_key(R::TAG, row.id())[..], bincode::serialize(row)?);
    }
    Ok(())
}

fn read_status<T: serde::de::DeserializeOwned>(
    tree: &sled::Tree,
    key: &[u8],
) -> LedgerResult<Option<T>> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Persistent ledger with a single writer and shared readers
pub struct LedgerStore {
    db: sled::Db,
    tree: sled::Tree,
    state: RwLock<LedgerState>,
}

impl LedgerStore {
    /// Open or create the ledger database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let db = sled::open(&path)?;
        let tree = db.open_tree(TREE)?;

        let state = LedgerState {
            blocks: load_table(&tree)?,
            txs: load_table(&tree)?,
            txins: load_table(&tree)?,
            txouts: load_table(&tree)?,
            tokens: load_table(&tree)?,
            balances: load_table(&tree)?,
            transfers: load_table(&tree)?,
            advertisements: load_table(&tree)?,
            registrations: load_table(&tree)?,
            last_height: read_status(&tree, KEY_HEIGHT)?,
            committed_at: read_status(&tree, KEY_COMMITTED_AT)?,
        };

        tracing::info!(
            "Opened ledger at {:?}: last height {:?}, {} tokens, {} blocks",
            path.as_ref(),
            state.last_height,
            state.tokens.len(),
            state.blocks.len()
        );

        Ok(Self {
            db,
            tree,
            state: RwLock::new(state),
        })
    }

    /// Shared read access to the committed state
    pub fn committed(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read()
    }

    /// Run a read-only query against the committed state
    pub fn read<T>(&self, f: impl FnOnce(&UnitOfWork<'_>) -> T) -> T {
        let state = self.state.read();
        let view = state.begin();
        f(&view)
    }

    pub fn last_height(&self) -> Option<u64> {
        self.state.read().last_height()
    }

    pub fn user_tokens(&self, address: &str) -> Vec<UserToken> {
        self.read(|view| view.user_tokens(address))
    }

    /// Durably write a unit of work's changes and the checkpoint, atomically
    pub fn commit(&self, changes: Changes) -> LedgerResult<()> {
        let committed_at = chrono::Utc::now().timestamp();

        let mut batch = sled::Batch::default();
        stage_table(&mut batch, &changes.blocks)?;
        stage_table(&mut batch, &changes.txs)?;
        stage_table(&mut batch, &changes.txins)?;
        stage_table(&mut batch, &changes.txouts)?;
        stage_table(&mut batch, &changes.tokens)?;
        stage_table(&mut batch, &changes.balances)?;
        stage_table(&mut batch, &changes.transfers)?;
        stage_table(&mut batch, &changes.advertisements)?;
        stage_table(&mut batch, &changes.registrations)?;
        match changes.last_height {
            Some(height) => batch.insert(KEY_HEIGHT, bincode::serialize(&height)?),
            None => batch.remove(KEY_HEIGHT),
        }
        batch.insert(KEY_COMMITTED_AT, bincode::serialize(&committed_at)?);

        self.tree.apply_batch(batch)?;
        self.db.flush()?;

        self.state.write().apply(changes, committed_at);
        Ok(())
    }
}
