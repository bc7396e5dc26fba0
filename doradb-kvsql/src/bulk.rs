//! Bulk-load buffer of the transient results table.
//!
//! Inserts into the results table are collected in memory and written
//! in one sorted batch as soon as anything else touches the table.
//! The buffer is used once: after the first load, inserts go straight
//! to the table.

use crate::error::{Error, Result};
use crate::handle::RESULTS_TABLE;
use crate::shared::SharedTable;
use doradb_kv::cmp::{Bytewise, KeyComparator};
use doradb_kv::txn::TxnId;
use std::sync::Arc;

pub(crate) struct BulkBuffer {
    rows: Vec<(Vec<u8>, Vec<u8>)>,
    bytes: usize,
    capacity: usize,
}

impl BulkBuffer {
    #[inline]
    pub(crate) fn new(capacity: usize) -> Self {
        BulkBuffer {
            rows: vec![],
            bytes: 0,
            capacity,
        }
    }

    /// Append a row, false if it does not fit.
    #[inline]
    pub(crate) fn push(&mut self, key: &[u8], data: &[u8]) -> bool {
        let size = key.len() + data.len();
        if self.bytes + size > self.capacity {
            return false;
        }
        self.rows.push((key.to_vec(), data.to_vec()));
        self.bytes += size;
        true
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sort rows by key. Of equal keys the last inserted wins, as it
    /// would with one put per row.
    pub(crate) fn into_sorted(self, cmp: &dyn KeyComparator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows = self.rows;
        rows.sort_by(|a, b| cmp.compare(&a.0, &b.0));
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(rows.len());
        for row in rows {
            match out.last_mut() {
                Some(last) if cmp.compare(&last.0, &row.0).is_eq() => *last = row,
                _ => out.push(row),
            }
        }
        out
    }
}

impl SharedTable {
    /// Whether inserts into the table are still collected in memory.
    #[inline]
    pub(crate) fn is_buffered(&self, table: u32) -> bool {
        table == RESULTS_TABLE && self.state.lock().results_buffer
    }

    /// Try to buffer an insert, false if the table is not buffered or
    /// the row does not fit.
    pub(crate) fn buffer_insert(&self, table: u32, key: &[u8], data: &[u8]) -> bool {
        if table != RESULTS_TABLE {
            return false;
        }
        let mut g = self.state.lock();
        if !g.results_buffer {
            return false;
        }
        let capacity = self.config.bulk_buffer_size;
        g.bulk
            .get_or_insert_with(|| BulkBuffer::new(capacity))
            .push(key, data)
    }

    /// Stop buffering and write pending rows into the results table.
    pub(crate) fn load_bulk(&self, txn: Option<TxnId>) -> Result<()> {
        let bulk = {
            let mut g = self.state.lock();
            if !g.results_buffer && g.bulk.is_none() {
                return Ok(());
            }
            g.results_buffer = false;
            g.bulk.take()
        };
        let bulk = match bulk {
            Some(b) if !b.is_empty() => b,
            _ => return Ok(()),
        };
        let db = self.get_or_create(RESULTS_TABLE, true, txn)?;
        let cmp: Arc<dyn KeyComparator> = self
            .key_cmp
            .read()
            .clone()
            .unwrap_or_else(|| Arc::new(Bytewise));
        let rows = bulk.into_sorted(cmp.as_ref());
        log::debug!(
            "load {} buffered rows into results table of shared table {}",
            rows.len(),
            self.uid()
        );
        db.put_multiple(txn, rows.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))
            .map_err(Error::locked)?;
        Ok(())
    }

    /// Drop pending rows without writing them.
    #[inline]
    pub(crate) fn discard_bulk(&self) -> usize {
        self.state.lock().bulk.take().map_or(0, |b| b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_buffer_capacity() {
        let mut buf = BulkBuffer::new(8);
        assert!(buf.is_empty());
        assert!(buf.push(b"ab", b"cd"));
        assert!(buf.push(b"e", b"fgh"));
        assert!(!buf.push(b"i", b""));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_bulk_buffer_sort_last_wins() {
        let mut buf = BulkBuffer::new(1024);
        for (k, v) in [(b"c", b"1"), (b"a", b"2"), (b"c", b"3"), (b"b", b"4")] {
            assert!(buf.push(k, v));
        }
        let rows = buf.into_sorted(&Bytewise);
        let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(rows[2].1, b"3");
    }
}
