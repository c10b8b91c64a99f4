//! Committed tables and their per-block staged overlays

use crate::{
    error::{LedgerResult, StructuralError},
    rows::{Row, RowId},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::RangeBounds,
};

/// Row ids grouped by secondary key, ascending within each key
type Index<K> = BTreeMap<K, Vec<RowId>>;

fn index_row<R: Row>(index: &mut Index<R::Key>, row: &R) {
    index.entry(row.key()).or_default().push(row.id());
}

/// Committed rows of one table, ordered by id and indexed by [`Row::key`]
#[derive(Clone, Debug)]
pub struct Table<R: Row> {
    rows: BTreeMap<RowId, R>,
    index: Index<R::Key>,
    next_id: RowId,
}

impl<R: Row> Table<R> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            index: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Rebuild from stored rows
    pub fn from_rows(rows: impl IntoIterator<Item = R>) -> Self {
        let rows: BTreeMap<RowId, R> = rows.into_iter().map(|r| (r.id(), r)).collect();
        let next_id = rows.keys().next_back().map_or(1, |id| id + 1);
        let mut index = BTreeMap::new();
        for row in rows.values() {
            index_row(&mut index, row);
        }
        Self {
            rows,
            index,
            next_id,
        }
    }

    pub fn get(&self, id: RowId) -> Option<&R> {
        self.rows.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> + '_ {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn next_id(&self) -> RowId {
        self.next_id
    }

    /// Start a staged overlay on top of the committed rows
    pub fn stage(&self) -> Staged<'_, R> {
        Staged {
            base: self,
            dirty: BTreeMap::new(),
            inserted: BTreeMap::new(),
            next_id: self.next_id,
        }
    }

    pub(crate) fn apply(&mut self, changes: TableChanges<R>) {
        for row in changes.rows.range(self.next_id..).map(|(_, row)| row) {
            index_row(&mut self.index, row);
        }
        self.rows.extend(changes.rows);
        self.next_id = self.next_id.max(changes.next_id);
    }
}

impl<R: Row> Default for Table<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Rows written by one unit of work
#[derive(Clone, Debug)]
pub struct TableChanges<R> {
    pub(crate) rows: BTreeMap<RowId, R>,
    pub(crate) next_id: RowId,
}

impl<R> TableChanges<R> {
    pub fn rows(&self) -> impl Iterator<Item = &R> + '_ {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Copy-on-write view of a table for the block being processed
pub struct Staged<'a, R: Row> {
    base: &'a Table<R>,
    dirty: BTreeMap<RowId, R>,
    /// Index of rows inserted in this unit of work only
    inserted: Index<R::Key>,
    next_id: RowId,
}

impl<'a, R: Row> Staged<'a, R> {
    pub fn get(&self, id: RowId) -> Option<&R> {
        self.dirty.get(&id).or_else(|| self.base.get(id))
    }

    /// Like [`Staged::get`], but a missing row is an integrity failure
    pub fn require(&self, id: RowId) -> LedgerResult<&R> {
        self.get(id).ok_or_else(|| {
            StructuralError::MissingRow {
                table: R::TABLE,
                id,
            }
            .into()
        })
    }

    /// Insert a new row built around its freshly assigned id
    pub fn insert(&mut self, build: impl FnOnce(RowId) -> R) -> RowId {
        let id = self.next_id;
        self.next_id += 1;
        let row = build(id);
        index_row(&mut self.inserted, &row);
        self.dirty.insert(id, row);
        id
    }

    /// Mutate a row, copying it out of the committed table first
    pub fn update<T>(&mut self, id: RowId, f: impl FnOnce(&mut R) -> T) -> LedgerResult<T> {
        if !self.dirty.contains_key(&id) {
            let row = self.require(id)?.clone();
            self.dirty.insert(id, row);
        }
        let row = self.dirty.get_mut(&id).ok_or(StructuralError::MissingRow {
            table: R::TABLE,
            id,
        })?;
        Ok(f(row))
    }

    /// All rows, staged versions shadowing committed ones, in id order
    pub fn iter(&self) -> impl Iterator<Item = &R> + '_ {
        let committed = self
            .base
            .rows
            .iter()
            .map(move |(id, row)| self.dirty.get(id).unwrap_or(row));
        let inserted = self.dirty.range(self.base.next_id..).map(|(_, row)| row);
        committed.chain(inserted)
    }

    /// Rows written in this unit of work, in id order
    pub fn staged(&self) -> impl Iterator<Item = &R> + '_ {
        self.dirty.values()
    }

    /// Rows first inserted in this unit of work, in id order
    pub fn inserted(&self) -> impl Iterator<Item = &R> + '_ {
        self.dirty.range(self.base.next_id..).map(|(_, row)| row)
    }

    /// Highest-id committed row, as staged
    pub fn committed_tail(&self) -> Option<&R> {
        let (id, row) = self.base.rows.last_key_value()?;
        Some(self.dirty.get(id).unwrap_or(row))
    }

    pub fn len(&self) -> usize {
        self.base.len() + self.inserted().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows with the given key, in id order
    pub fn find<'s>(&'s self, key: &R::Key) -> impl Iterator<Item = &'s R> + 's {
        let committed = self.base.index.get(key).into_iter().flatten();
        let inserted = self.inserted.get(key).into_iter().flatten();
        committed
            .chain(inserted)
            .filter_map(move |id| self.get(*id))
    }

    /// Rows whose key falls in `range`, in id order
    pub fn find_range<'s>(
        &'s self,
        range: impl RangeBounds<R::Key> + Clone,
    ) -> impl Iterator<Item = &'s R> + 's {
        let ids: BTreeSet<RowId> = self
            .base
            .index
            .range(range.clone())
            .chain(self.inserted.range(range))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.into_iter().filter_map(move |id| self.get(id))
    }

    pub fn into_changes(self) -> TableChanges<R> {
        TableChanges {
            rows: self.dirty,
            next_id: self.next_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::BlockRow;

    fn block(id: RowId, height: u64) -> BlockRow {
        BlockRow {
            id,
            hash: format!("h{}", height),
            height,
            digest: None,
        }
    }

    #[test]
    fn test_staged_shadows_committed() {
        let table = Table::from_rows(vec![block(1, 10), block(2, 11)]);
        let mut staged = table.stage();

        staged
            .update(1, |b| b.digest = Some("sealed".to_string()))
            .unwrap();
        let id = staged.insert(|id| block(id, 12));
        assert_eq!(id, 3);

        let heights: Vec<u64> = staged.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![10, 11, 12]);
        assert_eq!(staged.get(1).unwrap().digest.as_deref(), Some("sealed"));

        // Committed table untouched until applied
        assert_eq!(table.get(1).unwrap().digest, None);
        assert_eq!(staged.staged().count(), 2);
    }

    #[test]
    fn test_apply_changes() {
        let mut table = Table::from_rows(vec![block(1, 10)]);
        let changes = {
            let mut staged = table.stage();
            staged.insert(|id| block(id, 11));
            staged.into_changes()
        };
        table.apply(changes);

        assert_eq!(table.len(), 2);
        assert_eq!(table.next_id(), 3);
    }

    #[test]
    fn test_index_spans_committed_and_staged() {
        let mut table = Table::from_rows(vec![block(1, 10), block(2, 11)]);
        let changes = {
            let mut staged = table.stage();
            staged.insert(|id| block(id, 12));
            staged.into_changes()
        };
        table.apply(changes);

        let mut staged = table.stage();
        staged.insert(|id| block(id, 13));
        staged.insert(|id| block(id, 11));

        let at_11: Vec<RowId> = staged.find(&11).map(|b| b.id).collect();
        assert_eq!(at_11, vec![2, 5]);
        assert_eq!(staged.find(&12).next().unwrap().id, 3);
        assert!(staged.find(&99).next().is_none());

        let ids: Vec<RowId> = staged.find_range(11..13).map(|b| b.id).collect();
        assert_eq!(ids, vec![2, 3, 5]);

        assert_eq!(staged.committed_tail().unwrap().id, 3);
        assert_eq!(staged.inserted().count(), 2);
        assert_eq!(staged.len(), 5);
    }

    #[test]
    fn test_update_missing_row() {
        let table: Table<BlockRow> = Table::new();
        let mut staged = table.stage();
        let err = staged.update(7, |_| ()).unwrap_err();
        assert!(err.is_fatal());
    }
}
