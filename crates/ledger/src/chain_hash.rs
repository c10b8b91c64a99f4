//! Chain Hash Accumulator
//!
//! Each block is sealed with a digest over its own row, the rows of every
//! hashed table it touched, and its predecessor's digest. Rows are taken in
//! surrogate id order.

use crate::{
    error::{LedgerResult, StructuralError},
    rows::{BlockRef, Row, RowId},
    store::UnitOfWork,
    table::Staged,
};

/// Stands in for the predecessor digest of the first block ever sealed
pub const GENESIS_SENTINEL: [u8; 32] = [0u8; 32];

const ROW_OPEN: u8 = b'[';
const ROW_CLOSE: u8 = b']';
const COLUMN_DELIMITER: u8 = b'|';
const LIST_PRESENT: u8 = 1;
const LIST_EMPTY: u8 = 0;
const LIST_END: u8 = 0xff;

/// blake3 applied twice
pub fn double_hash(data: &[u8]) -> [u8; 32] {
    let first = blake3::hash(data);
    *blake3::hash(first.as_bytes()).as_bytes()
}

/// `[col|col|...]` with nulls as empty columns
pub fn row_bytes<R: Row>(row: &R) -> Vec<u8> {
    let mut out = vec![ROW_OPEN];
    for (i, column) in row.columns().into_iter().enumerate() {
        if i > 0 {
            out.push(COLUMN_DELIMITER);
        }
        if let Some(text) = column {
            out.extend_from_slice(text.as_bytes());
        }
    }
    out.push(ROW_CLOSE);
    out
}

pub fn list_digest<'r, R: Row + 'r>(rows: impl IntoIterator<Item = &'r R>) -> [u8; 32] {
    let mut body = Vec::new();
    for row in rows {
        body.extend(row_bytes(row));
    }

    let mut bytes = Vec::with_capacity(body.len() + 2);
    bytes.push(if body.is_empty() { LIST_EMPTY } else { LIST_PRESENT });
    bytes.extend(body);
    bytes.push(LIST_END);
    double_hash(&bytes)
}

fn touched<'s, R: Row>(staged: &'s Staged<'_, R>, block: RowId) -> impl Iterator<Item = &'s R> {
    staged.staged().filter(move |row| row.touched_in() == Some(block))
}

impl<'a> UnitOfWork<'a> {
    /// Compute and store the digest of the block being processed
    pub fn seal(&mut self, block: BlockRef) -> LedgerResult<String> {
        // Blocks are only ever committed sealed, so the committed tail stands
        // in for the whole committed table
        let unsealed: Vec<RowId> = self
            .blocks
            .committed_tail()
            .into_iter()
            .chain(self.blocks.inserted())
            .filter(|b| b.digest.is_none())
            .map(|b| b.id)
            .collect();
        if unsealed != [block.id] {
            return Err(StructuralError::MultipleUnsealedBlocks(unsealed.len()).into());
        }

        let has_history = self.blocks.len() > 1;
        let mut bytes = match block.height.checked_sub(1).and_then(|h| self.block_at(h)) {
            Some(prev) => match &prev.digest {
                Some(digest) => digest.as_bytes().to_vec(),
                None => return Err(StructuralError::MissingPredecessor { height: block.height }.into()),
            },
            None if has_history => {
                return Err(StructuralError::MissingPredecessor { height: block.height }.into())
            }
            None => GENESIS_SENTINEL.to_vec(),
        };

        bytes.extend(row_bytes(self.blocks.require(block.id)?));
        bytes.extend(list_digest(touched(&self.tokens, block.id)));
        bytes.extend(list_digest(touched(&self.balances, block.id)));
        bytes.extend(list_digest(touched(&self.transfers, block.id)));
        bytes.extend(list_digest(touched(&self.advertisements, block.id)));
        bytes.extend(list_digest(touched(&self.registrations, block.id)));

        let digest = hex::encode(double_hash(&bytes));
        let sealed = digest.clone();
        self.blocks.update(block.id, |b| b.digest = Some(sealed))?;

        tracing::debug!("Sealed block {} with {}", block.height, digest);
        Ok(digest)
    }
}
