use crate::cmp::{Bytewise, KeyComparator, Probe};
use std::cmp::Ordering;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Rows of one table, kept sorted by the table comparator.
pub(crate) struct TableData {
    pub(crate) name: Option<String>,
    pub(crate) rows: Vec<(Vec<u8>, Vec<u8>)>,
    pub(crate) cmp: Arc<dyn KeyComparator>,
    pub(crate) page_size: u32,
    /// Maximum number of pages, zero means unlimited.
    pub(crate) max_pages: u32,
    /// Whether changes are written to the redo log.
    pub(crate) durable: bool,
    bytes: usize,
}

impl TableData {
    #[inline]
    pub(crate) fn new(name: Option<String>, page_size: u32, durable: bool) -> Self {
        TableData {
            name,
            rows: vec![],
            cmp: Arc::new(Bytewise),
            page_size: if page_size == 0 {
                DEFAULT_PAGE_SIZE
            } else {
                page_size
            },
            max_pages: 0,
            durable,
            bytes: 0,
        }
    }

    /// Replace all rows. Rows must already be sorted by the comparator.
    #[inline]
    pub(crate) fn set_rows(&mut self, rows: Vec<(Vec<u8>, Vec<u8>)>) {
        self.bytes = rows.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.rows = rows;
    }

    /// Install a new comparator and reorder existing rows with it.
    pub(crate) fn set_comparator(&mut self, cmp: Arc<dyn KeyComparator>) {
        self.rows.sort_by(|a, b| cmp.compare(&a.0, &b.0));
        self.cmp = cmp;
    }

    #[inline]
    pub(crate) fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.rows.binary_search_by(|(k, _)| self.cmp.compare(k, key))
    }

    /// Index of first row not less than the probe.
    #[inline]
    pub(crate) fn lower_bound(&self, probe: &Probe) -> usize {
        self.rows
            .partition_point(|(k, _)| probe.compare(self.cmp.as_ref(), k) == Ordering::Less)
    }

    /// Index of first row greater than the key.
    #[inline]
    pub(crate) fn upper_bound(&self, key: &[u8]) -> usize {
        self.rows
            .partition_point(|(k, _)| self.cmp.compare(k, key) != Ordering::Greater)
    }

    #[inline]
    pub(crate) fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.find(key).ok().map(|idx| self.rows[idx].1.as_slice())
    }

    /// Insert or replace, returning the previous value.
    pub(crate) fn upsert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.bytes += value.len();
        match self.find(&key) {
            Ok(idx) => {
                let old = std::mem::replace(&mut self.rows[idx].1, value);
                self.bytes -= old.len();
                Some(old)
            }
            Err(idx) => {
                self.bytes += key.len();
                self.rows.insert(idx, (key, value));
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let idx = self.find(key).ok()?;
        let (k, v) = self.rows.remove(idx);
        self.bytes -= k.len() + v.len();
        Some(v)
    }

    #[inline]
    pub(crate) fn take_rows(&mut self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.bytes = 0;
        std::mem::take(&mut self.rows)
    }

    /// Estimated page count: one root page plus data pages.
    #[inline]
    pub(crate) fn page_count(&self) -> u32 {
        1 + self.bytes.div_ceil(self.page_size as usize) as u32
    }

    /// Page count after adding the given bytes.
    #[inline]
    pub(crate) fn fits(&self, extra: usize) -> bool {
        if self.max_pages == 0 {
            return true;
        }
        let pages = 1 + (self.bytes + extra).div_ceil(self.page_size as usize);
        pages <= self.max_pages as usize
    }
}
