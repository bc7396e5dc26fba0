//! Connections of the query engine.
//!
//! A connection is one query-engine handle attached to a shared table.
//! It owns the transaction chain and a lazily established link to the
//! physical environment: nothing is touched on disk until the first
//! operation that needs it.

use crate::codec::{decode_i64, encode_i64};
use crate::config::{StorageMode, TruncateMode};
use crate::cursor::{fault_cursors, trip_all, Cursor};
use crate::error::{Error, Result};
use crate::handle::{
    old_name, parse_table_id, DeletedTable, TableFlags, MASTER_ROOT, RESULTS_TABLE,
};
use crate::registry::Registry;
use crate::shared::{SharedTable, N_META};
use crate::trx::{SavepointOp, SchemaLock, TransState, TxnChain};
use doradb_kv::cmp::KeyComparator;
use doradb_kv::env::Env;
use doradb_kv::error::Error as KvError;
use doradb_kv::txn::TxnFlags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Database context of the query engine.
///
/// A context may hold connections to several files, but at most one per
/// file. It tells connections how deep the current statement nests
/// savepoints and how many statements are running.
#[derive(Debug)]
pub struct DbContext {
    id: u64,
    n_savepoint: AtomicUsize,
    active_stmts: AtomicUsize,
}

impl DbContext {
    #[inline]
    pub fn new() -> Arc<Self> {
        Arc::new(DbContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            n_savepoint: AtomicUsize::new(0),
            active_stmts: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Savepoint level the next statement runs at.
    #[inline]
    pub fn savepoint_depth(&self) -> usize {
        self.n_savepoint.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_savepoint_depth(&self, depth: usize) {
        self.n_savepoint.store(depth, Ordering::Release);
    }

    #[inline]
    pub fn active_stmts(&self) -> usize {
        self.active_stmts.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_active_stmts(&self, n: usize) {
        self.active_stmts.store(n, Ordering::Release);
    }
}

#[derive(Default)]
pub(crate) struct ConnState {
    pub(crate) connected: bool,
    pub(crate) closed: bool,
    pub(crate) trans: TransState,
    pub(crate) chain: TxnChain,
    pub(crate) schema_lock: SchemaLock,
}

pub(crate) struct ConnInner {
    pub(crate) id: u64,
    pub(crate) registry: Registry,
    pub(crate) shared: Arc<SharedTable>,
    pub(crate) ctx: Arc<DbContext>,
    pub(crate) read_only: bool,
    pub(crate) state: Mutex<ConnState>,
}

impl ConnInner {
    #[inline]
    pub(crate) fn env(&self) -> Result<Arc<Env>> {
        self.shared.env().ok_or(Error::CantOpen)
    }

    /// Link the connection to the physical environment, opening it if
    /// this is the first access. Transaction and schema lock state
    /// recorded while unconnected is applied.
    pub(crate) fn connect(&self, st: &mut ConnState) -> Result<()> {
        if st.connected {
            return Ok(());
        }
        if st.closed {
            return Err(Error::Abort);
        }
        if self.shared.env().is_none() {
            self.registry.open_environment(&self.shared)?;
        }
        let env = self.env()?;
        if self.shared.transactional && st.chain.family.is_none() {
            st.chain.family = Some(env.txn_begin(None, TxnFlags::FAMILY)?);
        }
        st.connected = true;
        log::debug!(
            "connection {} linked to shared table {}",
            self.id,
            self.shared.uid()
        );
        match st.trans {
            TransState::None => (),
            TransState::Read => self.begin_trans_locked(st, false)?,
            TransState::Write => self.begin_trans_locked(st, true)?,
        }
        let pending = std::mem::take(&mut st.schema_lock);
        if pending != SchemaLock::None {
            self.apply_schema_lock(st, pending)?;
        }
        Ok(())
    }

    fn apply_schema_lock(&self, st: &mut ConnState, want: SchemaLock) -> Result<()> {
        if let Some(read) = st.chain.read {
            let env = self.env()?;
            let db = self.shared.get_or_create(MASTER_ROOT, false, None)?;
            env.lock_table(read, &db, want == SchemaLock::Write)
                .map_err(Error::locked)?;
        }
        st.schema_lock = want;
        self.shared.state.lock().schema_locks.insert(self.id, want);
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(());
        }
        crate::cursor::detach_cursors(&self.shared, self.id, |_| true);
        self.shared
            .state
            .lock()
            .cursors
            .retain(|_, e| e.conn != self.id);
        let mut res = Ok(());
        if st.connected {
            res = self.end_read_txn(&mut st, false);
            if let Some(family) = st.chain.family.take() {
                if let Some(env) = self.shared.env() {
                    if let Err(e) = env.txn_commit(family) {
                        log::warn!("commit family transaction of connection {} failed: {}", self.id, e);
                        if res.is_ok() {
                            res = Err(e.into());
                        }
                    }
                }
            }
        }
        st.trans = TransState::None;
        self.release_schema_lock(&mut st);
        st.connected = false;
        st.closed = true;
        self.registry.release(&self.shared, self.ctx.id());
        log::debug!("close connection {}", self.id);
        res
    }
}

/// Connection to a database.
///
/// Dropping the connection closes it, rolling back any open transaction.
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    #[inline]
    pub(crate) fn new(inner: Arc<ConnInner>) -> Self {
        Connection { inner }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn shared(&self) -> &Arc<SharedTable> {
        &self.inner.shared
    }

    /// The physical environment, if it is open.
    #[inline]
    pub fn env(&self) -> Option<Arc<Env>> {
        self.inner.shared.env()
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    #[inline]
    pub fn trans_state(&self) -> TransState {
        self.inner.state.lock().trans
    }

    #[inline]
    pub fn is_in_trans(&self) -> bool {
        self.trans_state() == TransState::Write
    }

    #[inline]
    pub fn is_in_read_trans(&self) -> bool {
        self.trans_state() != TransState::None
    }

    /// Number of open savepoint levels, including the statement level.
    #[inline]
    pub fn savepoint_levels(&self) -> usize {
        self.inner.state.lock().chain.savepoints.len()
    }

    fn lock_open(&self) -> Result<parking_lot::MutexGuard<'_, ConnState>> {
        let st = self.inner.state.lock();
        if st.closed {
            return Err(Error::Abort);
        }
        Ok(st)
    }

    /// Begin a read or write transaction. Promotes a read transaction
    /// to write, never the other way.
    pub fn begin_trans(&self, write: bool) -> Result<()> {
        let mut st = self.lock_open()?;
        self.inner.begin_trans_locked(&mut st, write)
    }

    /// Make sure savepoint level `depth` exists.
    pub fn begin_stmt(&self, depth: usize) -> Result<()> {
        let mut st = self.lock_open()?;
        self.inner.begin_stmt_locked(&mut st, depth)
    }

    pub fn savepoint(&self, op: SavepointOp, level: i32) -> Result<()> {
        let mut st = self.lock_open()?;
        self.inner.savepoint_locked(&mut st, op, level)
    }

    /// First phase of a two-phase commit, nothing to prepare.
    #[inline]
    pub fn commit_phase_one(&self) -> Result<()> {
        Ok(())
    }

    /// Commit the read transaction, or only the statement level while
    /// other statements are still running.
    pub fn commit(&self) -> Result<()> {
        let mut st = self.lock_open()?;
        self.inner.commit_locked(&mut st)
    }

    pub fn rollback(&self) -> Result<()> {
        let mut st = self.lock_open()?;
        self.inner.rollback_locked(&mut st)
    }

    /// Create a table and return its id. Integer-keyed tables get odd
    /// ids, others even ids.
    pub fn create_table(&self, flags: TableFlags) -> Result<u32> {
        let mut st = self.lock_open()?;
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        let shared = &self.inner.shared;
        if flags.contains(TableFlags::ZERODATA) && shared.is_buffered(RESULTS_TABLE) {
            self.inner.connect(&mut st)?;
            shared.load_bulk(st.chain.cursor_txn(true))?;
        }
        if shared.is_buffered(RESULTS_TABLE) {
            shared
                .last_table
                .fetch_max(RESULTS_TABLE, Ordering::AcqRel);
            return Ok(RESULTS_TABLE);
        }
        self.inner.connect(&mut st)?;
        let env = self.inner.env()?;
        let listed = if shared.storage() == StorageMode::Named {
            env.list_tables()
                .iter()
                .filter_map(|name| parse_table_id(name))
                .max()
                .unwrap_or(0)
        } else {
            0
        };
        let table = shared.allocate_table_id(listed, flags);
        if let Err(e) = shared.get_or_create(table, true, st.chain.cursor_txn(true)) {
            shared.evict_handle(table);
            return Err(e);
        }
        log::debug!("create table {} in shared table {}", table, shared.uid());
        Ok(table)
    }

    /// Drop a table. Dropping a table that does not exist succeeds.
    pub fn drop_table(&self, table: u32) -> Result<()> {
        let st = self.lock_open()?;
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        let shared = &self.inner.shared;
        trip_all(shared, self.inner.id, table)?;
        if table == RESULTS_TABLE {
            shared.discard_bulk();
        }
        if !st.connected {
            return Ok(());
        }
        shared.evict_handle(table);
        if let Some(name) = shared.table_name(table) {
            let env = self.inner.env()?;
            match env.remove(st.chain.cursor_txn(true), &name) {
                Ok(()) | Err(KvError::NoEnt) | Err(KvError::NotFound) => (),
                Err(e) => return Err(Error::locked(e)),
            }
        }
        log::debug!("drop table {} in shared table {}", table, shared.uid());
        Ok(())
    }

    /// Remove all rows of a table, returning how many there were.
    pub fn clear_table(&self, table: u32) -> Result<u64> {
        let mut st = self.lock_open()?;
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        let shared = &self.inner.shared;
        trip_all(shared, self.inner.id, table)?;
        if shared.is_buffered(table) {
            return Ok(shared.discard_bulk() as u64);
        }
        self.inner.connect(&mut st)?;
        let txn = st.chain.cursor_txn(true);
        let db = shared.get_or_create(table, true, txn)?;
        let name = shared.table_name(table);
        let write_txn = st.chain.read.and(txn);
        let rename = match (shared.config.truncate_mode, name, write_txn) {
            (TruncateMode::RenameRecreate, Some(name), Some(write_txn)) if shared.transactional => {
                Some((name, write_txn))
            }
            _ => None,
        };
        let (name, write_txn) = match rename {
            Some(r) => r,
            None => return db.truncate(txn).map_err(Error::locked),
        };
        let rows = db.stat(txn).map_err(Error::locked)?.rows;
        drop(db);
        shared.evict_handle(table);
        let env = self.inner.env()?;
        let old = old_name(&name);
        if env.table_exists(&old) {
            env.remove(txn, &old).map_err(Error::locked)?;
        }
        env.rename(txn, &name, &old).map_err(Error::locked)?;
        shared.get_or_create(table, true, txn)?;
        shared.state.lock().deleted.push(DeletedTable {
            conn: self.inner.id,
            table,
            txn: write_txn,
        });
        log::debug!("clear table {} by renaming it to {}", table, old);
        Ok(rows)
    }

    /// Open a cursor on a table.
    #[inline]
    pub fn cursor(&self, table: u32, write: bool) -> Result<Cursor> {
        Cursor::open(&self.inner, table, write)
    }

    /// Read a metadata slot. Slot zero is always zero.
    pub fn get_meta(&self, idx: usize) -> Result<u32> {
        if idx >= N_META {
            return Err(Error::Internal);
        }
        if idx == 0 {
            return Ok(0);
        }
        let st = self.lock_open()?;
        let shared = &self.inner.shared;
        let meta_db = if st.connected && shared.storage() == StorageMode::Named {
            shared.state.lock().meta_db.clone()
        } else {
            None
        };
        let db = match meta_db {
            Some(db) => db,
            None => return Ok(shared.cached_meta(idx).unwrap_or(0)),
        };
        match db.get(st.chain.cursor_txn(false), &encode_i64(idx as i64)) {
            Ok(v) => {
                let v = u32::try_from(decode_i64(&v)?).map_err(|_| Error::Corrupt)?;
                shared.cache_meta(idx, v);
                Ok(v)
            }
            Err(KvError::NotFound) => Ok(0),
            Err(e) => Err(Error::locked(e)),
        }
    }

    /// Write a metadata slot. Named storage persists it in the current
    /// write transaction.
    pub fn update_meta(&self, idx: usize, value: u32) -> Result<()> {
        if idx == 0 || idx >= N_META {
            return Err(Error::Internal);
        }
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        let st = self.lock_open()?;
        let shared = &self.inner.shared;
        shared.cache_meta(idx, value);
        if st.connected && shared.storage() == StorageMode::Named {
            let meta_db = shared.state.lock().meta_db.clone();
            if let Some(db) = meta_db {
                db.put(
                    st.chain.cursor_txn(true),
                    &encode_i64(idx as i64),
                    &encode_i64(value as i64),
                )
                .map_err(Error::locked)?;
            }
        }
        Ok(())
    }

    /// Number of rows in a table.
    pub fn count(&self, table: u32) -> Result<u64> {
        let mut st = self.lock_open()?;
        let shared = &self.inner.shared;
        if !st.connected {
            if shared.storage() != StorageMode::Transient && shared.env().is_none() {
                return Ok(0);
            }
            self.inner.connect(&mut st)?;
        }
        let txn = st.chain.cursor_txn(false);
        if shared.is_buffered(table) {
            shared.load_bulk(txn)?;
        }
        let create = shared.storage() != StorageMode::Named;
        let db = shared.get_or_create(table, create, txn)?;
        let stat = db.stat(txn).map_err(Error::locked)?;
        Ok(stat.rows)
    }

    /// Change the page size of tables created later. Fails with
    /// ReadOnly once the size was fixed.
    #[inline]
    pub fn set_page_size(&self, page_size: u32, fix: bool) -> Result<()> {
        self.inner.shared.set_page_size(page_size, fix)
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.inner.shared.page_size()
    }

    #[inline]
    pub fn set_cache_size(&self, pages: u32) {
        self.inner.shared.set_cache_size(pages)
    }

    #[inline]
    pub fn cache_size(&self) -> u32 {
        self.inner.shared.cache_size()
    }

    /// Set the page limit, zero only reads it. Returns the limit in
    /// effect.
    #[inline]
    pub fn set_max_page_count(&self, pages: u32) -> Result<u32> {
        self.inner.shared.set_max_page_count(pages)
    }

    #[inline]
    pub fn page_count(&self) -> Result<u32> {
        self.inner.shared.page_count()
    }

    /// Take a schema lock. Only the schema table of transactional
    /// storage is locked, other tables succeed immediately.
    pub fn lock_table(&self, table: u32, write: bool) -> Result<()> {
        if table != MASTER_ROOT || !self.inner.shared.transactional {
            return Ok(());
        }
        let mut st = self.lock_open()?;
        let want = if write {
            SchemaLock::Write
        } else {
            SchemaLock::Read
        };
        if st.schema_lock >= want {
            return Ok(());
        }
        if !st.connected {
            st.schema_lock = want;
            return Ok(());
        }
        self.inner.apply_schema_lock(&mut st, want)
    }

    /// Fails with Locked if another connection holds the write schema
    /// lock.
    pub fn schema_locked(&self) -> Result<()> {
        let g = self.inner.shared.state.lock();
        let locked = g
            .schema_locks
            .iter()
            .any(|(conn, lock)| *conn != self.inner.id && *lock == SchemaLock::Write);
        if locked {
            return Err(Error::Locked);
        }
        Ok(())
    }

    /// Put every cursor of this connection into the fault state.
    #[inline]
    pub fn trip_all_cursors(&self, err: Error) {
        fault_cursors(&self.inner.shared, self.inner.id, err)
    }

    /// Install the comparator of general keys. Applies to open tables
    /// and every table opened later.
    pub fn set_key_comparator(&self, cmp: Arc<dyn KeyComparator>) -> Result<()> {
        let shared = &self.inner.shared;
        *shared.key_cmp.write() = Some(Arc::clone(&cmp));
        let dbs: Vec<_> = shared
            .state
            .lock()
            .handles
            .values()
            .filter(|h| !h.intkey)
            .map(|h| Arc::clone(&h.db))
            .collect();
        for db in dbs {
            db.set_comparator(Arc::clone(&cmp))?;
        }
        Ok(())
    }

    /// Close the connection. Open transactions are rolled back.
    #[inline]
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            log::warn!("close connection {} failed: {}", self.inner.id, e);
        }
    }
}
