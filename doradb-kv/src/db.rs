use crate::cmp::KeyComparator;
use crate::cursor::Cursor;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::redo::FileID;
use crate::txn::TxnId;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbConfig {
    pub create: bool,
    /// Page size of a newly created table, zero takes the default.
    pub page_size: u32,
}

impl Default for DbConfig {
    #[inline]
    fn default() -> Self {
        DbConfig {
            create: true,
            page_size: 0,
        }
    }
}

/// Statistics of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStat {
    pub rows: u64,
    pub pages: u32,
    pub page_size: u32,
}

/// Handle of one table inside an environment.
///
/// Handles are cheap and may be shared between threads. Every operation
/// runs under the environment mutex.
pub struct Db {
    env: Arc<Env>,
    file: FileID,
    closed: AtomicBool,
}

impl Db {
    #[inline]
    pub(crate) fn new(env: Arc<Env>, file: FileID) -> Self {
        Db {
            env,
            file,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    #[inline]
    pub fn file(&self) -> FileID {
        self.file
    }

    #[inline]
    fn check(&self) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// Whether the table still exists. A table may vanish when the
    /// transaction that created it is aborted.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.closed.load(AtomicOrdering::Acquire)
            && self.env.inner.lock().tables.contains_key(&self.file)
    }

    pub fn get(&self, txn: Option<TxnId>, key: &[u8]) -> Result<Vec<u8>> {
        self.check()?;
        self.env.inner.lock().get(txn, self.file, key)
    }

    pub fn put(&self, txn: Option<TxnId>, key: &[u8], value: &[u8]) -> Result<()> {
        self.check()?;
        self.env.inner.lock().put(txn, self.file, key, value)
    }

    /// Delete a key, NotFound if it does not exist.
    pub fn del(&self, txn: Option<TxnId>, key: &[u8]) -> Result<()> {
        self.check()?;
        self.env.inner.lock().del(txn, self.file, key)
    }

    /// Put a batch of rows. Stops at the first failure, rows put before
    /// it stay in place.
    pub fn put_multiple<'a, I>(&self, txn: Option<TxnId>, rows: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        self.check()?;
        let mut inner = self.env.inner.lock();
        let mut count = 0;
        for (key, value) in rows {
            inner.put(txn, self.file, key, value)?;
            count += 1;
        }
        Ok(count)
    }

    /// Remove all rows, returning how many were removed.
    pub fn truncate(&self, txn: Option<TxnId>) -> Result<u64> {
        self.check()?;
        self.env.inner.lock().truncate(txn, self.file)
    }

    pub fn stat(&self, txn: Option<TxnId>) -> Result<DbStat> {
        self.check()?;
        let mut inner = self.env.inner.lock();
        inner.check_txn(txn)?;
        inner.lock(txn, self.file, LockMode::Shared)?;
        let table = inner.table(self.file)?;
        Ok(DbStat {
            rows: table.rows.len() as u64,
            pages: table.page_count(),
            page_size: table.page_size,
        })
    }

    #[inline]
    pub fn page_count(&self) -> Result<u32> {
        self.check()?;
        Ok(self.env.inner.lock().table(self.file)?.page_count())
    }

    /// Limit the table size in pages, zero means unlimited.
    pub fn set_max_pages(&self, pages: u32) -> Result<()> {
        self.check()?;
        self.env.inner.lock().table_mut(self.file)?.max_pages = pages;
        Ok(())
    }

    /// Install a key comparator. Existing rows are reordered.
    pub fn set_comparator(&self, cmp: Arc<dyn KeyComparator>) -> Result<()> {
        self.check()?;
        self.env.inner.lock().table_mut(self.file)?.set_comparator(cmp);
        Ok(())
    }

    /// Compare two keys with the table comparator.
    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.check()?;
        Ok(self.env.inner.lock().table(self.file)?.cmp.compare(a, b))
    }

    /// Open a cursor under the transaction.
    pub fn cursor(self: &Arc<Self>, txn: Option<TxnId>) -> Result<Cursor> {
        self.check()?;
        self.env.inner.lock().check_txn(txn)?;
        Ok(Cursor::new(Arc::clone(self), txn))
    }

    /// Close the handle. A table without name is dropped with it.
    pub fn close(&self) {
        if !self.closed.swap(true, AtomicOrdering::AcqRel) {
            self.env.inner.lock().discard(self.file);
        }
    }
}

impl Drop for Db {
    #[inline]
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvConfig;
    use crate::os::StdOs;
    use crate::txn::TxnFlags;

    struct Reverse;

    impl KeyComparator for Reverse {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
    }

    #[test]
    fn test_db_basic_ops() {
        let env = Env::open_in_memory(EnvConfig::default(), Arc::new(StdOs));
        let db = env.open_db(None, Some("t"), DbConfig::default()).unwrap();
        db.put(None, b"a", b"1").unwrap();
        db.put(None, b"b", b"2").unwrap();
        assert_eq!(db.get(None, b"a").unwrap(), b"1");
        assert_eq!(db.del(None, b"z"), Err(Error::NotFound));
        db.del(None, b"a").unwrap();
        assert_eq!(db.get(None, b"a"), Err(Error::NotFound));

        let rows = vec![(&b"c"[..], &b"3"[..]), (&b"d"[..], &b"4"[..])];
        assert_eq!(db.put_multiple(None, rows).unwrap(), 2);
        assert_eq!(db.stat(None).unwrap().rows, 3);

        let txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
        assert_eq!(db.truncate(Some(txn)).unwrap(), 3);
        assert_eq!(db.stat(Some(txn)).unwrap().rows, 0);
        env.txn_abort(txn).unwrap();
        assert_eq!(db.stat(None).unwrap().rows, 3);
    }

    #[test]
    fn test_db_page_limit_and_comparator() {
        let env = Env::open_in_memory(EnvConfig::default(), Arc::new(StdOs));
        let db = env
            .open_db(
                None,
                Some("t"),
                DbConfig {
                    create: true,
                    page_size: 512,
                },
            )
            .unwrap();
        db.set_max_pages(2).unwrap();
        db.put(None, b"k1", &[0u8; 400]).unwrap();
        assert_eq!(db.page_count().unwrap(), 2);
        assert_eq!(db.put(None, b"k2", &[0u8; 400]), Err(Error::NoSpace));

        db.put(None, b"a", b"").unwrap();
        db.set_comparator(Arc::new(Reverse)).unwrap();
        assert_eq!(db.compare_keys(b"a", b"b").unwrap(), Ordering::Greater);
        let mut cursor = db.cursor(None).unwrap();
        let (first, _) = cursor.get(crate::cursor::CursorOp::First).unwrap();
        assert_eq!(first, b"k1");
    }

    #[test]
    fn test_anonymous_table_dropped_on_close() {
        let env = Env::open_in_memory(EnvConfig::default(), Arc::new(StdOs));
        let db = env.open_db(None, None, DbConfig::default()).unwrap();
        db.put(None, b"k", b"v").unwrap();
        assert!(db.is_valid());
        let file = db.file();
        db.close();
        assert!(!db.is_valid());
        assert_eq!(db.get(None, b"k"), Err(Error::Invalid));
        assert!(!env.inner.lock().tables.contains_key(&file));
        assert!(env.list_tables().is_empty());
    }
}
