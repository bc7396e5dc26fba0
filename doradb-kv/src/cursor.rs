use crate::cmp::Probe;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::txn::TxnId;
use std::cmp::Ordering;
use std::sync::Arc;

/// Positioning operation of a cursor.
#[derive(Clone, Copy)]
pub enum CursorOp<'a> {
    First,
    Last,
    /// Move to next row, or the first row if unpositioned.
    Next,
    /// Move to previous row, or the last row if unpositioned.
    Prev,
    Current,
    /// Exact match.
    Set(&'a [u8]),
    /// Smallest row not less than the probe.
    SetRange(Probe<'a>),
}

/// Cursor over one table.
///
/// The position is remembered by key, so concurrent changes to other
/// rows do not invalidate it. If the current row is deleted, Next and
/// Prev continue from where it was.
pub struct Cursor {
    db: Arc<Db>,
    txn: Option<TxnId>,
    pos: Option<Vec<u8>>,
}

impl Cursor {
    #[inline]
    pub(crate) fn new(db: Arc<Db>, txn: Option<TxnId>) -> Self {
        Cursor { db, txn, pos: None }
    }

    #[inline]
    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    #[inline]
    pub fn txn(&self) -> Option<TxnId> {
        self.txn
    }

    /// Key of current position.
    #[inline]
    pub fn key(&self) -> Option<&[u8]> {
        self.pos.as_deref()
    }

    /// Position the cursor and return the row under it.
    /// On failure the position is left unchanged.
    pub fn get(&mut self, op: CursorOp) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut inner = self.db.env().inner.lock();
        inner.check_txn(self.txn)?;
        inner.lock(self.txn, self.db.file(), LockMode::Shared)?;
        let table = inner.table(self.db.file())?;
        let idx = match (op, self.pos.as_deref()) {
            (CursorOp::First, _) | (CursorOp::Next, None) => 0,
            (CursorOp::Last, _) | (CursorOp::Prev, None) => {
                table.rows.len().checked_sub(1).ok_or(Error::NotFound)?
            }
            (CursorOp::Next, Some(key)) => table.upper_bound(key),
            (CursorOp::Prev, Some(key)) => table
                .lower_bound(&Probe::Raw(key))
                .checked_sub(1)
                .ok_or(Error::NotFound)?,
            (CursorOp::Current, Some(key)) => table.find(key).map_err(|_| Error::KeyEmpty)?,
            (CursorOp::Current, None) => return Err(Error::Invalid),
            (CursorOp::Set(key), _) => table.find(key).map_err(|_| Error::NotFound)?,
            (CursorOp::SetRange(probe), _) => table.lower_bound(&probe),
        };
        let (key, value) = table.rows.get(idx).cloned().ok_or(Error::NotFound)?;
        self.pos = Some(key.clone());
        Ok((key, value))
    }

    /// Put a row and position the cursor on it.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(self.txn, key, value)?;
        self.pos = Some(key.to_vec());
        Ok(())
    }

    /// Replace the value of current row.
    pub fn put_current(&mut self, value: &[u8]) -> Result<()> {
        let key = self.pos.clone().ok_or(Error::Invalid)?;
        self.db.put(self.txn, &key, value)
    }

    /// Delete current row. The position is kept so that Next and Prev
    /// still work.
    pub fn del(&mut self) -> Result<()> {
        let key = self.pos.as_deref().ok_or(Error::Invalid)?;
        match self.db.del(self.txn, key) {
            Err(Error::NotFound) => Err(Error::KeyEmpty),
            res => res,
        }
    }

    /// Compare positions of two cursors on the same table.
    pub fn compare(&self, other: &Cursor) -> Result<Ordering> {
        match (self.key(), other.key()) {
            (Some(a), Some(b)) => self.db.compare_keys(a, b),
            _ => Err(Error::Invalid),
        }
    }
}
