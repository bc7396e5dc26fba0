//! Table handle cache.
//!
//! A logical table id maps to one physical table. Odd ids are
//! integer-keyed tables, even ids are tables with general keys ordered
//! by the installed comparator.

use crate::config::StorageMode;
use crate::error::Result;
use crate::shared::SharedTable;
use bitflags::bitflags;
use doradb_kv::db::{Db, DbConfig};
use doradb_kv::error::Result as KvResult;
use doradb_kv::txn::TxnId;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Schema table, created together with the environment.
pub const MASTER_ROOT: u32 = 1;
/// Results table of transient storage, the target of bulk loads.
pub const RESULTS_TABLE: u32 = 2;

const OLD_SUFFIX: &str = "-old";

bitflags! {
    pub struct TableFlags: u32 {
        /// Keys are 64-bit integers.
        const INTKEY = 0x01;
        /// Index table, rows carry no data.
        const ZERODATA = 0x02;
    }
}

pub(crate) struct CachedHandle {
    pub(crate) db: Arc<Db>,
    pub(crate) intkey: bool,
    /// Created by this handle rather than opened.
    pub(crate) created: bool,
}

/// A table renamed away by a clear, removed when its transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeletedTable {
    pub(crate) conn: u64,
    pub(crate) table: u32,
    pub(crate) txn: TxnId,
}

#[inline]
pub fn is_intkey(table: u32) -> bool {
    table & 1 == 1
}

/// Smallest id above `last` with the parity required by the flags.
#[inline]
pub fn next_table_id(last: u32, flags: TableFlags) -> u32 {
    let next = last + 1;
    if flags.contains(TableFlags::INTKEY) != is_intkey(next) {
        next + 1
    } else {
        next
    }
}

/// Parse the id of a named table, including renamed-away ones.
pub fn parse_table_id(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("table")?;
    let digits = rest.strip_suffix(OLD_SUFFIX).unwrap_or(rest);
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[inline]
pub(crate) fn old_name(name: &str) -> String {
    format!("{}{}", name, OLD_SUFFIX)
}

/// Run an open operation, retrying while it fails on lock contention.
pub(crate) fn retry_open<T, F>(retries: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> KvResult<T>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_contention() && attempt < retries => {
                attempt += 1;
                log::debug!("retry table open after {}, attempt {}", e, attempt);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl SharedTable {
    /// Physical name of a table. Transient tables have none.
    pub(crate) fn table_name(&self, table: u32) -> Option<String> {
        match self.storage() {
            StorageMode::Named => Some(format!("table{:05}", table)),
            StorageMode::InMemory => Some(format!("temp{:05}_{:05}", self.uid(), table)),
            StorageMode::Transient => None,
        }
    }

    /// Look up the cached handle of a table, or open it. A missing table
    /// is created under the given transaction if allowed.
    pub(crate) fn get_or_create(
        &self,
        table: u32,
        create: bool,
        txn: Option<TxnId>,
    ) -> Result<Arc<Db>> {
        if let Some(h) = self.state.lock().handles.get(&table) {
            if h.db.is_valid() {
                return Ok(Arc::clone(&h.db));
            }
        }
        let env = self.env().ok_or(crate::error::Error::CantOpen)?;
        let name = self.table_name(table);
        let existed = name.as_deref().map_or(false, |n| env.table_exists(n));
        let config = DbConfig {
            create: create || name.is_none(),
            page_size: self.page_size(),
        };
        let db = retry_open(self.config.busy_retry_count, || {
            env.open_db(txn, name.as_deref(), config)
        })?;
        if !is_intkey(table) {
            if let Some(cmp) = self.key_cmp.read().clone() {
                db.set_comparator(cmp)?;
            }
        }
        let max_pages = self.max_page_count.load(Ordering::Acquire);
        if max_pages > 0 {
            db.set_max_pages(max_pages)?;
        }

        let mut g = self.state.lock();
        if let Some(h) = g.handles.get(&table) {
            if h.db.is_valid() {
                return Ok(Arc::clone(&h.db));
            }
        }
        g.handles.insert(
            table,
            CachedHandle {
                db: Arc::clone(&db),
                intkey: is_intkey(table),
                created: !existed,
            },
        );
        Ok(db)
    }

    /// Remove the handle from cache and close it.
    pub(crate) fn evict_handle(&self, table: u32) {
        let handle = self.state.lock().handles.remove(&table);
        if let Some(h) = handle {
            h.db.close();
        }
    }

    /// Drop handles whose table vanished with an aborted transaction.
    pub(crate) fn evict_stale_handles(&self) {
        let mut g = self.state.lock();
        let stale: Vec<u32> = g
            .handles
            .iter()
            .filter(|(_, h)| !h.db.is_valid())
            .map(|(t, _)| *t)
            .collect();
        for table in stale {
            if let Some(h) = g.handles.remove(&table) {
                log::debug!("evict stale handle of table {}", table);
                h.db.close();
            }
        }
    }

    /// Reserve a fresh table id with the parity required by the flags.
    pub(crate) fn allocate_table_id(&self, listed: u32, flags: TableFlags) -> u32 {
        let mut cur = self.last_table.load(Ordering::Acquire);
        loop {
            let next = next_table_id(cur.max(listed), flags);
            match self.last_table.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }
}
