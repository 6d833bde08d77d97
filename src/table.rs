//! Per-tick working sets of table rows.
//!
//! A [`GameTable`] holds the active rows of one table for the duration of a
//! simulation tick. Every mutation is written through a [`WritePath`] first
//! and only then applied to the working set, so the table never holds a row
//! the write path rejected. Rows that stop being active stay readable until
//! [`GameTable::sweep`] drops them at the end of the tick.

use crate::error::{Result, StoreError};
use std::collections::BTreeMap;
use std::fmt;

/// A row that can live in a [`GameTable`].
pub trait TableRow: Clone {
    /// Table name, used in errors.
    const TABLE: &'static str;

    type Id: Copy + Ord + fmt::Display;

    fn id(&self) -> Self::Id;
}

/// The transactional write path a table writes through.
pub trait WritePath<R: TableRow> {
    /// Insert a new row. The write path may assign the row's ID; the row as
    /// stored is returned.
    fn insert_row(&mut self, row: R) -> Result<R>;

    /// Replace an existing row.
    fn replace_row(&mut self, row: &R) -> Result<()>;

    /// Delete a row.
    fn delete_row(&mut self, id: R::Id) -> Result<()>;
}

/// In-memory working set of active rows keyed by primary ID.
pub struct GameTable<R: TableRow> {
    rows: BTreeMap<R::Id, R>,
    is_active: fn(&R) -> bool,
}

impl<R: TableRow> GameTable<R> {
    /// Build a working set from loaded rows, keeping only the active ones.
    pub fn new(rows: impl IntoIterator<Item = R>, is_active: fn(&R) -> bool) -> Self {
        let rows = rows
            .into_iter()
            .filter(|row| is_active(row))
            .map(|row| (row.id(), row))
            .collect();
        Self { rows, is_active }
    }

    /// The table's activity predicate.
    pub fn is_active(&self, row: &R) -> bool {
        (self.is_active)(row)
    }

    pub fn get(&self, id: R::Id) -> Option<&R> {
        self.rows.get(&id)
    }

    /// Like [`GameTable::get`], but a miss is an error.
    pub fn lookup(&self, id: R::Id) -> Result<&R> {
        self.rows.get(&id).ok_or_else(|| Self::not_loaded(id))
    }

    /// Rows in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert a row through `writer` and add it to the working set.
    pub fn insert<W: WritePath<R> + ?Sized>(&mut self, writer: &mut W, row: R) -> Result<&R> {
        let stored = writer.insert_row(row)?;
        let id = stored.id();
        self.rows.insert(id, stored);
        self.lookup(id)
    }

    /// Apply `f` to a copy of a loaded row, write it through `writer`, and
    /// keep the result if the write path accepts it.
    pub fn update<W, F>(&mut self, writer: &mut W, id: R::Id, f: F) -> Result<&R>
    where
        W: WritePath<R> + ?Sized,
        F: FnOnce(&mut R),
    {
        let mut row = self.lookup(id)?.clone();
        f(&mut row);
        writer.replace_row(&row)?;
        self.rows.insert(id, row);
        self.lookup(id)
    }

    /// Delete a loaded row through `writer`.
    pub fn delete<W: WritePath<R> + ?Sized>(&mut self, writer: &mut W, id: R::Id) -> Result<R> {
        self.lookup(id)?;
        writer.delete_row(id)?;
        self.rows.remove(&id).ok_or_else(|| Self::not_loaded(id))
    }

    /// Drop rows that are no longer active. Returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        let is_active = self.is_active;
        let before = self.rows.len();
        self.rows.retain(|_, row| is_active(row));
        before - self.rows.len()
    }

    fn not_loaded(id: R::Id) -> StoreError {
        StoreError::RowNotLoaded {
            table: R::TABLE,
            id: id.to_string(),
        }
    }
}
