//! Cursors of the query engine.
//!
//! A cursor wraps an engine cursor together with a copy of the row it
//! stands on. When a write lands on the same key, cursors positioned
//! there are tripped: the engine cursor is closed and the cursor is
//! marked for reseek. The next operation restores it by seeking the
//! saved key again.
//!
//! Every cursor is registered in its shared table, so writers and
//! schema changes can find cursors of all connections. A cursor core is
//! only locked after its connection state, and never while another core
//! is held.

use crate::codec::{decode_i64, encode_i64};
use crate::config::StorageMode;
use crate::conn::ConnInner;
use crate::error::{Error, Result};
use crate::handle::is_intkey;
use crate::shared::SharedTable;
use doradb_kv::cmp::{Probe, UnpackedKey};
use doradb_kv::cursor::{Cursor as KvCursor, CursorOp};
use doradb_kv::error::Error as KvError;
use doradb_kv::txn::TxnId;
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::sync::Arc;

pub type CursorId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Not positioned on any row.
    Invalid,
    Valid,
    /// Engine cursor closed, reposition from the saved key before use.
    RequireSeek,
    /// A physical error occurred. Every later operation returns it.
    Fault,
}

/// Registration of a cursor in its shared table.
pub(crate) struct CursorEntry {
    pub(crate) conn: u64,
    pub(crate) table: u32,
    pub(crate) core: Arc<Mutex<CursorCore>>,
}

pub(crate) struct CursorCore {
    state: CursorState,
    intkey: bool,
    /// Comparison of the row under the cursor with the key last sought.
    last_res: i32,
    key: Vec<u8>,
    data: Vec<u8>,
    saved_int_key: i64,
    cached_rowid: i64,
    dbc: Option<KvCursor>,
    txn: Option<TxnId>,
    fault: Option<Error>,
    incrblob: bool,
    detached: bool,
}

impl CursorCore {
    #[inline]
    fn new(intkey: bool, txn: Option<TxnId>) -> Self {
        CursorCore {
            state: CursorState::Invalid,
            intkey,
            last_res: 0,
            key: vec![],
            data: vec![],
            saved_int_key: 0,
            cached_rowid: 0,
            dbc: None,
            txn,
            fault: None,
            incrblob: false,
            detached: false,
        }
    }

    #[inline]
    fn check_fault(&self) -> Result<()> {
        if self.state == CursorState::Fault {
            return Err(self.fault.unwrap_or(Error::Internal));
        }
        Ok(())
    }

    #[inline]
    fn set_fault(&mut self, err: Error) -> Error {
        self.state = CursorState::Fault;
        self.fault = Some(err);
        self.dbc = None;
        err
    }

    fn set_position(&mut self, key: Vec<u8>, data: Vec<u8>) -> Result<()> {
        if self.intkey {
            match decode_i64(&key) {
                Ok(n) => self.saved_int_key = n,
                Err(e) => return Err(self.set_fault(e)),
            }
        }
        self.key = key;
        self.data = data;
        self.state = CursorState::Valid;
        Ok(())
    }

    #[inline]
    fn clear_position(&mut self) {
        self.key.clear();
        self.data.clear();
        self.state = CursorState::Invalid;
    }

    /// Give up the engine cursor because a write landed on its row.
    #[inline]
    fn trip(&mut self, incrblob_update: bool) {
        self.dbc = None;
        self.state = if self.incrblob && !incrblob_update {
            CursorState::Invalid
        } else {
            CursorState::RequireSeek
        };
    }

    /// Engine cursor over a table handle that was closed since.
    #[inline]
    fn stale_dbc(&self) -> bool {
        self.dbc.as_ref().map_or(false, |dbc| !dbc.db().is_valid())
    }

    /// Unbind from a transaction about to end.
    #[inline]
    fn detach(&mut self) {
        self.dbc = None;
        self.state = CursorState::Invalid;
        self.detached = true;
    }

    /// Run a cursor get and record the row it lands on. False means the
    /// table has no such row.
    fn step(&mut self, op: CursorOp) -> Result<bool> {
        self.last_res = 0;
        let dbc = self.dbc.as_mut().ok_or(Error::Internal)?;
        match dbc.get(op) {
            Ok((key, data)) => {
                self.set_position(key, data)?;
                Ok(true)
            }
            Err(KvError::NotFound) => {
                self.clear_position();
                Ok(false)
            }
            Err(e) => Err(self.set_fault(Error::locked(e))),
        }
    }

    /// Position on the smallest row not less than the target, or the
    /// last row if there is none. Returns the row compared to the
    /// target, -1 on an empty table.
    fn seek(&mut self, target: Seek) -> Result<i32> {
        let encoded;
        let probe = match target {
            Seek::Int(n) => {
                encoded = encode_i64(n);
                Probe::Raw(&encoded)
            }
            Seek::Key(key) => Probe::Raw(key),
            Seek::Unpacked(key) => Probe::Unpacked(key),
        };
        let dbc = self.dbc.as_mut().ok_or(Error::Internal)?;
        let found = match dbc.get(CursorOp::SetRange(probe)) {
            Err(KvError::NotFound) => dbc.get(CursorOp::Last),
            res => res,
        };
        let db = Arc::clone(dbc.db());
        match found {
            Ok((key, data)) => {
                let ord = match target {
                    Seek::Int(n) => decode_i64(&key).map(|k| k.cmp(&n)),
                    Seek::Key(k) => db.compare_keys(&key, k).map_err(Error::from),
                    Seek::Unpacked(k) => Ok(k.compare_stored(&key)),
                };
                let ord = match ord {
                    Ok(ord) => ord,
                    Err(e) => return Err(self.set_fault(e)),
                };
                self.set_position(key, data)?;
                Ok(match ord {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                })
            }
            Err(KvError::NotFound) => {
                self.clear_position();
                Ok(-1)
            }
            Err(e) => Err(self.set_fault(Error::locked(e))),
        }
    }
}

#[derive(Clone, Copy)]
enum Seek<'a> {
    Int(i64),
    Key(&'a [u8]),
    Unpacked(&'a dyn UnpackedKey),
}

/// Cursor over one logical table.
pub struct Cursor {
    id: CursorId,
    table: u32,
    write: bool,
    conn: Arc<ConnInner>,
    core: Arc<Mutex<CursorCore>>,
}

impl Cursor {
    pub(crate) fn open(conn: &Arc<ConnInner>, table: u32, write: bool) -> Result<Cursor> {
        let shared = &conn.shared;
        let txn = {
            let mut st = conn.state.lock();
            if st.closed {
                return Err(Error::Abort);
            }
            if write && conn.read_only {
                return Err(Error::ReadOnly);
            }
            if !st.connected {
                if shared.storage() != StorageMode::Transient
                    && !write
                    && shared.env().is_none()
                {
                    return Err(Error::Empty);
                }
                conn.connect(&mut st)?;
            }
            st.chain.cursor_txn(write)
        };
        let mut core = CursorCore::new(is_intkey(table), txn);
        if !shared.is_buffered(table) {
            let create = write || shared.storage() != StorageMode::Named;
            let dbc = shared
                .get_or_create(table, create, txn)
                .and_then(|db| db.cursor(txn).map_err(Error::from));
            match dbc {
                Ok(dbc) => core.dbc = Some(dbc),
                Err(Error::CantOpen) => {
                    core.set_fault(Error::Empty);
                }
                Err(e) => {
                    core.set_fault(e);
                }
            }
        }
        let core = Arc::new(Mutex::new(core));
        let id = shared.next_cursor_id();
        shared.state.lock().cursors.insert(
            id,
            CursorEntry {
                conn: conn.id,
                table,
                core: Arc::clone(&core),
            },
        );
        log::trace!("open cursor {} on table {}, write={}", id, table, write);
        Ok(Cursor {
            id,
            table,
            write,
            conn: Arc::clone(conn),
            core,
        })
    }

    #[inline]
    pub fn table(&self) -> u32 {
        self.table
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.write
    }

    #[inline]
    fn shared(&self) -> &SharedTable {
        &self.conn.shared
    }

    /// Transaction the cursor works in, connecting first if needed.
    fn prepare(&self) -> Result<Option<TxnId>> {
        let mut st = self.conn.state.lock();
        if st.closed {
            return Err(Error::Abort);
        }
        if !st.connected {
            self.conn.connect(&mut st)?;
        }
        Ok(st.chain.cursor_txn(self.write))
    }

    /// Bring back a cursor whose engine cursor was closed. With `skip`
    /// the cursor is left unpositioned, otherwise it seeks its saved key.
    fn restore(&self, core: &mut CursorCore, txn: Option<TxnId>, skip: bool) -> Result<()> {
        core.check_fault()?;
        if core.detached || (core.state == CursorState::Invalid && !skip) {
            return Err(Error::Abort);
        }
        let shared = self.shared();
        if shared.is_buffered(self.table) {
            if let Err(e) = shared.load_bulk(txn) {
                return Err(core.set_fault(e));
            }
        }
        if core.dbc.is_none() {
            let create = self.write || shared.storage() != StorageMode::Named;
            let dbc = shared
                .get_or_create(self.table, create, txn)
                .and_then(|db| db.cursor(txn).map_err(Error::from));
            match dbc {
                Ok(dbc) => {
                    core.dbc = Some(dbc);
                    core.txn = txn;
                }
                Err(e) => return Err(core.set_fault(e)),
            }
        }
        if skip {
            core.clear_position();
            return Ok(());
        }
        let key = std::mem::take(&mut core.key);
        let res = if core.intkey {
            let n = core.saved_int_key;
            core.seek(Seek::Int(n))?
        } else {
            core.seek(Seek::Key(&key))?
        };
        core.last_res = res;
        Ok(())
    }

    /// Lock the core of a positioned cursor, reseeking if needed. An
    /// unpositioned or detached cursor fails with Abort.
    fn settle(&self) -> Result<MutexGuard<'_, CursorCore>> {
        let txn = self.prepare()?;
        let mut core = self.core.lock();
        core.check_fault()?;
        if core.detached {
            return Err(Error::Abort);
        }
        if core.state != CursorState::Valid {
            self.restore(&mut core, txn, false)?;
        }
        Ok(core)
    }

    fn seek_to(&mut self, target: Seek) -> Result<i32> {
        let txn = self.prepare()?;
        let mut core = self.core.lock();
        core.check_fault()?;
        if core.dbc.is_none() || core.stale_dbc() {
            core.dbc = None;
            self.restore(&mut core, txn, true)?;
        }
        if let Seek::Int(n) = target {
            if core.state == CursorState::Valid && core.saved_int_key == n {
                core.last_res = 0;
                return Ok(0);
            }
        }
        let res = core.seek(target)?;
        core.last_res = 0;
        Ok(res)
    }

    /// Move to the row of an integer key, or a neighbour if absent.
    /// Returns the row compared to the key: negative if smaller, zero if
    /// equal, positive if larger. An empty table leaves the cursor
    /// unpositioned with a negative result.
    #[inline]
    pub fn moveto_int(&mut self, key: i64) -> Result<i32> {
        self.seek_to(Seek::Int(key))
    }

    /// Move to the row of a general key. Same result as `moveto_int`.
    #[inline]
    pub fn moveto(&mut self, key: &[u8]) -> Result<i32> {
        self.seek_to(Seek::Key(key))
    }

    #[inline]
    pub fn moveto_unpacked(&mut self, key: &dyn UnpackedKey) -> Result<i32> {
        self.seek_to(Seek::Unpacked(key))
    }

    fn edge(&mut self, op: CursorOp) -> Result<bool> {
        let txn = self.prepare()?;
        let mut core = self.core.lock();
        core.check_fault()?;
        if core.dbc.is_none() || core.stale_dbc() {
            core.dbc = None;
            self.restore(&mut core, txn, true)?;
        }
        core.step(op)
    }

    /// Move to the first row, false if the table is empty.
    #[inline]
    pub fn first(&mut self) -> Result<bool> {
        self.edge(CursorOp::First)
    }

    #[inline]
    pub fn last(&mut self) -> Result<bool> {
        self.edge(CursorOp::Last)
    }

    fn advance(&mut self, op: CursorOp, dir: i32) -> Result<bool> {
        let txn = self.prepare()?;
        let mut core = self.core.lock();
        core.check_fault()?;
        if core.dbc.is_some() && core.state == CursorState::Invalid {
            return Ok(false);
        }
        if core.dbc.is_none() {
            self.restore(&mut core, txn, false)?;
        }
        // the reseek already landed past the saved key
        if core.last_res * dir > 0 {
            core.last_res = 0;
            return Ok(core.state == CursorState::Valid);
        }
        core.step(op)
    }

    /// Move to the next row, false at the end of table.
    #[inline]
    pub fn next(&mut self) -> Result<bool> {
        self.advance(CursorOp::Next, 1)
    }

    #[inline]
    pub fn prev(&mut self) -> Result<bool> {
        self.advance(CursorOp::Prev, -1)
    }

    /// Insert a row with `n_zero` zero bytes appended to the data. The
    /// cursor is left on the new row.
    ///
    /// `_append_bias` is a placement hint and has no effect.
    pub fn insert(
        &mut self,
        key: &[u8],
        data: &[u8],
        n_zero: usize,
        _append_bias: bool,
    ) -> Result<()> {
        self.insert_row(key, data, n_zero)
    }

    /// Insert a row of an integer-keyed table.
    #[inline]
    pub fn insert_int(
        &mut self,
        key: i64,
        data: &[u8],
        n_zero: usize,
        append_bias: bool,
    ) -> Result<()> {
        self.insert(&encode_i64(key), data, n_zero, append_bias)
    }

    fn insert_row(&mut self, key: &[u8], data: &[u8], n_zero: usize) -> Result<()> {
        if !self.write {
            return Err(Error::ReadOnly);
        }
        self.core.lock().check_fault()?;
        if n_zero == 0 && self.shared().buffer_insert(self.table, key, data) {
            return Ok(());
        }
        let txn = self.prepare()?;
        {
            let mut core = self.core.lock();
            core.check_fault()?;
            if core.dbc.is_none() || core.stale_dbc() {
                core.dbc = None;
                self.restore(&mut core, txn, true)?;
            }
        }
        trip_watchers(self.shared(), self.id, self.table, key, false);
        let mut core = self.core.lock();
        if core.dbc.is_none() || core.stale_dbc() {
            core.dbc = None;
            self.restore(&mut core, txn, true)?;
        }
        let mut value = Vec::with_capacity(data.len() + n_zero);
        value.extend_from_slice(data);
        value.resize(data.len() + n_zero, 0);
        let dbc = core.dbc.as_mut().ok_or(Error::Internal)?;
        match dbc.put(key, &value) {
            Ok(()) => {
                core.last_res = 0;
                core.set_position(key.to_vec(), value)
            }
            Err(e) => {
                core.clear_position();
                Err(Error::locked(e))
            }
        }
    }

    /// Delete the row under the cursor, the one `key()` reports. After a
    /// reseek that landed on a neighbour, that is the neighbour. The
    /// cursor is left unpositioned.
    pub fn delete(&mut self) -> Result<()> {
        if !self.write {
            return Err(Error::ReadOnly);
        }
        let txn = self.prepare()?;
        let key = {
            let mut core = self.core.lock();
            core.check_fault()?;
            if core.dbc.is_none() || core.stale_dbc() {
                core.dbc = None;
                self.restore(&mut core, txn, false)?;
            }
            if core.state != CursorState::Valid {
                return Err(Error::NotFound);
            }
            core.key.clone()
        };
        trip_watchers(self.shared(), self.id, self.table, &key, false);
        let mut core = self.core.lock();
        if core.dbc.is_none() || core.stale_dbc() {
            core.dbc = None;
            self.restore(&mut core, txn, false)?;
            if core.state != CursorState::Valid {
                return Err(Error::NotFound);
            }
        }
        let res = core.dbc.as_mut().ok_or(Error::Internal)?.del();
        core.clear_position();
        res.map_err(|e| match e {
            KvError::KeyEmpty => Error::NotFound,
            e => Error::locked(e),
        })
    }

    /// Overwrite part of the current row's data in place, growing it if
    /// the range runs past its end.
    pub fn put_data(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if !self.write {
            return Err(Error::ReadOnly);
        }
        let txn = self.prepare()?;
        let key = {
            let mut core = self.core.lock();
            core.check_fault()?;
            if core.dbc.is_none() || core.stale_dbc() {
                core.dbc = None;
                self.restore(&mut core, txn, false)?;
            }
            if core.state != CursorState::Valid {
                return Err(Error::Abort);
            }
            core.key.clone()
        };
        trip_watchers(self.shared(), self.id, self.table, &key, true);
        let mut core = self.core.lock();
        if core.dbc.is_none() || core.stale_dbc() {
            core.dbc = None;
            self.restore(&mut core, txn, false)?;
        }
        if core.state != CursorState::Valid || core.last_res != 0 {
            return Err(Error::Abort);
        }
        let mut value = core.data.clone();
        let end = offset + bytes.len();
        if end > value.len() {
            value.resize(end, 0);
        }
        value[offset..end].copy_from_slice(bytes);
        let dbc = core.dbc.as_mut().ok_or(Error::Internal)?;
        dbc.put_current(&value).map_err(Error::locked)?;
        core.data = value;
        Ok(())
    }

    /// Mark the cursor as an incremental blob handle. A tripped blob
    /// cursor is invalidated instead of reseeking, unless the write came
    /// from another blob handle.
    #[inline]
    pub fn set_incrblob(&mut self) {
        self.core.lock().incrblob = true;
    }

    /// Key of the current row. Fails with Abort on a cursor that is not
    /// positioned.
    pub fn key(&self) -> Result<Vec<u8>> {
        let core = self.settle()?;
        Ok(if core.state == CursorState::Valid {
            core.key.clone()
        } else {
            vec![]
        })
    }

    /// Integer key of the current row of an integer-keyed table.
    pub fn int_key(&self) -> Result<i64> {
        let core = self.settle()?;
        Ok(if core.state == CursorState::Valid {
            core.saved_int_key
        } else {
            0
        })
    }

    pub fn data(&self) -> Result<Vec<u8>> {
        let core = self.settle()?;
        Ok(if core.state == CursorState::Valid {
            core.data.clone()
        } else {
            vec![]
        })
    }

    pub fn key_size(&self) -> Result<usize> {
        let core = self.settle()?;
        Ok(if core.state == CursorState::Valid {
            core.key.len()
        } else {
            0
        })
    }

    pub fn data_size(&self) -> Result<usize> {
        let core = self.settle()?;
        Ok(if core.state == CursorState::Valid {
            core.data.len()
        } else {
            0
        })
    }

    /// True unless the cursor stands on a row.
    #[inline]
    pub fn eof(&self) -> bool {
        self.core.lock().state != CursorState::Valid
    }

    #[inline]
    pub fn state(&self) -> CursorState {
        self.core.lock().state
    }

    #[inline]
    pub fn cached_rowid(&self) -> i64 {
        self.core.lock().cached_rowid
    }

    /// Set the cached rowid of every cursor on the same table.
    pub fn set_cached_rowid(&self, rowid: i64) {
        for (_, core) in table_cursors(self.shared(), self.table) {
            core.lock().cached_rowid = rowid;
        }
    }

    /// Close the cursor. Same as dropping it.
    #[inline]
    pub fn close(self) {}
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.shared().state.lock().cursors.remove(&self.id);
        self.core.lock().dbc = None;
        log::trace!("close cursor {}", self.id);
    }
}

/// Snapshot of cursors on a table with their owning connections.
fn table_cursors(shared: &SharedTable, table: u32) -> Vec<(u64, Arc<Mutex<CursorCore>>)> {
    shared
        .state
        .lock()
        .cursors
        .values()
        .filter(|e| e.table == table)
        .map(|e| (e.conn, Arc::clone(&e.core)))
        .collect()
}

fn conn_cursors(shared: &SharedTable, conn: u64) -> Vec<Arc<Mutex<CursorCore>>> {
    shared
        .state
        .lock()
        .cursors
        .values()
        .filter(|e| e.conn == conn)
        .map(|e| Arc::clone(&e.core))
        .collect()
}

/// Trip every other positioned cursor standing on the key.
pub(crate) fn trip_watchers(
    shared: &SharedTable,
    writer: CursorId,
    table: u32,
    key: &[u8],
    incrblob_update: bool,
) {
    let watchers: Vec<Arc<Mutex<CursorCore>>> = shared
        .state
        .lock()
        .cursors
        .iter()
        .filter(|(id, e)| **id != writer && e.table == table)
        .map(|(_, e)| Arc::clone(&e.core))
        .collect();
    for core in watchers {
        let mut c = core.lock();
        if c.state != CursorState::Valid {
            continue;
        }
        let same = match c.dbc.as_ref() {
            Some(dbc) => dbc
                .db()
                .compare_keys(&c.key, key)
                .map_or(false, |ord| ord == Ordering::Equal),
            None => false,
        };
        if same {
            c.trip(incrblob_update);
        }
    }
}

/// Trip all positioned cursors on a table before it is dropped or
/// cleared. Fails with Locked if another connection has one.
pub(crate) fn trip_all(shared: &SharedTable, conn: u64, table: u32) -> Result<()> {
    for (owner, core) in table_cursors(shared, table) {
        let mut c = core.lock();
        if c.state != CursorState::Valid {
            continue;
        }
        if owner != conn {
            return Err(Error::Locked);
        }
        c.trip(false);
    }
    Ok(())
}

/// Detach cursors of a connection whose transaction matches.
pub(crate) fn detach_cursors<F>(shared: &SharedTable, conn: u64, pred: F)
where
    F: Fn(Option<TxnId>) -> bool,
{
    for core in conn_cursors(shared, conn) {
        let mut c = core.lock();
        if pred(c.txn) {
            c.detach();
        }
    }
}

/// Put every cursor of a connection into the fault state.
pub(crate) fn fault_cursors(shared: &SharedTable, conn: u64, err: Error) {
    for core in conn_cursors(shared, conn) {
        core.lock().set_fault(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_trip_and_fault() {
        let mut core = CursorCore::new(true, None);
        core.set_position(encode_i64(42), b"v".to_vec()).unwrap();
        assert_eq!(core.state, CursorState::Valid);
        assert_eq!(core.saved_int_key, 42);
        core.trip(false);
        assert_eq!(core.state, CursorState::RequireSeek);

        core.incrblob = true;
        core.state = CursorState::Valid;
        core.trip(false);
        assert_eq!(core.state, CursorState::Invalid);
        core.state = CursorState::Valid;
        core.trip(true);
        assert_eq!(core.state, CursorState::RequireSeek);

        assert!(core.check_fault().is_ok());
        core.set_fault(Error::IoErr);
        assert_eq!(core.check_fault(), Err(Error::IoErr));
        assert_eq!(core.check_fault(), Err(Error::IoErr));
    }

    #[test]
    fn test_core_corrupt_int_key() {
        let mut core = CursorCore::new(true, None);
        assert_eq!(
            core.set_position(vec![0xff], vec![]),
            Err(Error::Corrupt)
        );
        assert_eq!(core.state, CursorState::Fault);
    }
}
