//! Environment: a set of named tables sharing one transaction space,
//! one lock table and one redo log.
//!
//! Transactions form a parent-pointer tree. A nested transaction keeps
//! its own undo records; on commit they are handed to the parent, on
//! abort they are applied in reverse. Only a top-level commit (a
//! transaction whose parent is absent or is a family container) writes
//! the redo log and releases locks.

use crate::db::{Db, DbConfig};
use crate::error::{Error, Result};
use crate::lock::{LockMode, LockTable};
use crate::os::Os;
use crate::redo::{
    read_frames, FileID, RedoFile, RedoKind, RedoLog, Snapshot, SnapshotTable, LOG_FILE_NAME,
};
use crate::table::TableData;
use crate::txn::{TxnFlags, TxnId, TxnNode, Undo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DATA_FILE_NAME: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Create home directory and data file if missing.
    pub create: bool,
    pub transactional: bool,
    /// Write redo log for named tables.
    pub durable: bool,
    pub read_only: bool,
    /// Location of the data file, defaults to a file inside home.
    pub data_file: Option<PathBuf>,
    pub cache_bytes: u64,
    /// Sync the log on every commit.
    pub sync: bool,
}

impl Default for EnvConfig {
    #[inline]
    fn default() -> Self {
        EnvConfig {
            create: true,
            transactional: true,
            durable: true,
            read_only: false,
            data_file: None,
            cache_bytes: 2000 * 1024,
            sync: false,
        }
    }
}

pub struct Env {
    home: Option<PathBuf>,
    data_file: Option<PathBuf>,
    config: EnvConfig,
    pub(crate) inner: Mutex<EnvInner>,
}

impl Env {
    /// Open an environment backed by files under home. Existing data is
    /// recovered from the data file and the redo log.
    pub fn open(home: impl AsRef<Path>, config: EnvConfig, os: Arc<dyn Os>) -> Result<Arc<Env>> {
        let home = home.as_ref().to_path_buf();
        let can_create = config.create && !config.read_only;
        if !os.exists(&home) {
            if !can_create {
                return Err(Error::NoEnt);
            }
            os.mkdir(&home)?;
        }
        let data_file = config
            .data_file
            .clone()
            .unwrap_or_else(|| home.join(DATA_FILE_NAME));
        let mut inner = EnvInner::new(Arc::clone(&os), &config);
        if os.exists(&data_file) {
            let snapshot = Snapshot::decode(&os.read(&data_file)?)?;
            inner.load_snapshot(snapshot);
        } else if can_create {
            os.write(&data_file, &inner.snapshot().encode()?)?;
        } else {
            return Err(Error::NoEnt);
        }

        let log_path = home.join(LOG_FILE_NAME);
        let mut log_size = 0;
        if os.exists(&log_path) {
            let bytes = os.read(&log_path)?;
            let (logs, valid) = read_frames(&bytes)?;
            for log in logs {
                for kind in log.data {
                    inner.apply_redo(kind)?;
                }
            }
            if valid < bytes.len() && !config.read_only {
                os.write(&log_path, &bytes[..valid])?;
            }
            log_size = valid as u64;
        }
        if config.durable && !config.read_only {
            inner.log = Some(RedoFile::new(&home, log_size, config.sync));
        }
        log::debug!(
            "open environment {:?} with {} tables",
            home,
            inner.names.len()
        );
        Ok(Arc::new(Env {
            home: Some(home),
            data_file: Some(data_file),
            config,
            inner: Mutex::new(inner),
        }))
    }

    /// Open a private environment without any file.
    pub fn open_in_memory(mut config: EnvConfig, os: Arc<dyn Os>) -> Arc<Env> {
        config.durable = false;
        config.data_file = None;
        let inner = EnvInner::new(os, &config);
        Arc::new(Env {
            home: None,
            data_file: None,
            config,
            inner: Mutex::new(inner),
        })
    }

    #[inline]
    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    #[inline]
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    #[inline]
    pub fn is_transactional(&self) -> bool {
        self.config.transactional
    }

    /// Begin a transaction. A family transaction must be top-level.
    pub fn txn_begin(&self, parent: Option<TxnId>, flags: TxnFlags) -> Result<TxnId> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if !self.config.transactional {
            return Err(Error::Invalid);
        }
        if flags.contains(TxnFlags::FAMILY) && parent.is_some() {
            return Err(Error::Invalid);
        }
        let mut flags = flags;
        if let Some(p) = parent {
            let node = inner.txns.get(&p).ok_or(Error::Invalid)?;
            if !node.is_family() {
                flags |= node.flags & TxnFlags::READ_UNCOMMITTED;
            }
        }
        inner.next_txn += 1;
        let id = TxnId(inner.next_txn);
        if let Some(p) = parent {
            if let Some(node) = inner.txns.get_mut(&p) {
                node.children.push(id);
            }
        }
        inner.txns.insert(id, TxnNode::new(parent, flags));
        Ok(id)
    }

    /// Commit the transaction together with all its open descendants.
    #[inline]
    pub fn txn_commit(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.commit(txn)
    }

    /// Abort the transaction together with all its open descendants.
    #[inline]
    pub fn txn_abort(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.abort(txn)
    }

    #[inline]
    pub fn txn_parent(&self, txn: TxnId) -> Option<TxnId> {
        self.inner.lock().txns.get(&txn).and_then(|n| n.parent)
    }

    #[inline]
    pub fn txn_active(&self, txn: TxnId) -> bool {
        self.inner.lock().txns.contains_key(&txn)
    }

    /// Open a table handle, creating the table if allowed.
    /// A table without name is private to the returned handle.
    pub fn open_db(
        self: &Arc<Self>,
        txn: Option<TxnId>,
        name: Option<&str>,
        config: DbConfig,
    ) -> Result<Arc<Db>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if let Some(err) = inner.faults.pop_front() {
            return Err(err);
        }
        inner.check_txn(txn)?;
        let existing = name.and_then(|n| inner.names.get(n).copied());
        let file = match existing {
            Some(file) => file,
            None if !config.create => return Err(Error::NoEnt),
            None => inner.create(txn, name, config.page_size)?,
        };
        Ok(Arc::new(Db::new(Arc::clone(self), file)))
    }

    pub fn rename(&self, txn: Option<TxnId>, from: &str, to: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.rename(txn, from, to)
    }

    pub fn remove(&self, txn: Option<TxnId>, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.remove(txn, name)
    }

    /// Names of all tables in sorted order.
    #[inline]
    pub fn list_tables(&self) -> Vec<String> {
        self.inner.lock().names.keys().cloned().collect()
    }

    #[inline]
    pub fn table_exists(&self, name: &str) -> bool {
        self.inner.lock().names.contains_key(name)
    }

    /// Take a table lock on behalf of the transaction.
    pub fn lock_table(&self, txn: TxnId, db: &Db, exclusive: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.check_txn(Some(txn))?;
        let mode = if exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        inner.lock(Some(txn), db.file(), mode)
    }

    /// Write a snapshot of all committed named tables and reset the log,
    /// if at least `min_kb` kilobytes of log were written.
    /// Checkpoint is skipped while any transaction holds uncommitted changes.
    pub fn checkpoint(&self, min_kb: u32) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let data_file = match self.data_file.as_ref() {
            Some(f) => f,
            None => return Ok(false),
        };
        let size = match inner.log.as_ref() {
            Some(log) => log.size(),
            None => return Ok(false),
        };
        if size == 0 || size < min_kb as u64 * 1024 {
            return Ok(false);
        }
        if inner.has_pending_changes() {
            log::debug!("defer checkpoint of {:?}, transactions active", data_file);
            return Ok(false);
        }
        let snapshot = inner.snapshot();
        let os = Arc::clone(&inner.os);
        os.write(data_file, &snapshot.encode()?)?;
        if let Some(log) = inner.log.as_mut() {
            log.reset(os.as_ref())?;
        }
        log::debug!("checkpoint {:?} with {} tables", data_file, snapshot.tables.len());
        Ok(true)
    }

    /// Bytes of redo log since last checkpoint.
    #[inline]
    pub fn log_size(&self) -> u64 {
        self.inner.lock().log.as_ref().map_or(0, |l| l.size())
    }

    /// Close the environment. Open transactions are aborted.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let roots: Vec<TxnId> = inner
            .txns
            .iter()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        if !inner.txns.is_empty() {
            log::warn!(
                "close environment {:?} with {} active transactions",
                self.home,
                inner.txns.len()
            );
        }
        for txn in roots {
            inner.abort(txn)?;
        }
        inner.closed = true;
        log::debug!("close environment {:?}", self.home);
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Fail the next `count` table opens with the given error.
    #[doc(hidden)]
    pub fn inject_open_faults(&self, err: Error, count: usize) {
        let mut inner = self.inner.lock();
        for _ in 0..count {
            inner.faults.push_back(err);
        }
    }
}

pub(crate) struct EnvInner {
    pub(crate) tables: HashMap<FileID, TableData>,
    names: BTreeMap<String, FileID>,
    next_file: FileID,
    txns: HashMap<TxnId, TxnNode>,
    next_txn: u64,
    locks: LockTable,
    log: Option<RedoFile>,
    os: Arc<dyn Os>,
    faults: VecDeque<Error>,
    durable: bool,
    read_only: bool,
    closed: bool,
}

impl EnvInner {
    fn new(os: Arc<dyn Os>, config: &EnvConfig) -> Self {
        EnvInner {
            tables: HashMap::new(),
            names: BTreeMap::new(),
            next_file: 1,
            txns: HashMap::new(),
            next_txn: 0,
            locks: LockTable::default(),
            log: None,
            os,
            faults: VecDeque::new(),
            durable: config.durable,
            read_only: config.read_only,
            closed: false,
        }
    }

    #[inline]
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn check_txn(&self, txn: Option<TxnId>) -> Result<()> {
        match txn {
            Some(t) if !self.txns.contains_key(&t) => Err(Error::Invalid),
            _ => Ok(()),
        }
    }

    #[inline]
    fn writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Access);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn table(&self, file: FileID) -> Result<&TableData> {
        self.tables.get(&file).ok_or(Error::NoEnt)
    }

    #[inline]
    pub(crate) fn table_mut(&mut self, file: FileID) -> Result<&mut TableData> {
        self.tables.get_mut(&file).ok_or(Error::NoEnt)
    }

    #[inline]
    fn is_top_level(&self, node: &TxnNode) -> bool {
        match node.parent {
            None => true,
            Some(p) => self.txns.get(&p).map_or(true, |n| n.is_family()),
        }
    }

    /// The top-level transaction owning locks of the given transaction.
    /// Family containers and non-transactional calls own no locks.
    fn locker(&self, txn: Option<TxnId>) -> Option<TxnId> {
        let mut cur = txn?;
        loop {
            let node = self.txns.get(&cur)?;
            if node.is_family() {
                return None;
            }
            if self.is_top_level(node) {
                return Some(cur);
            }
            cur = node.parent?;
        }
    }

    pub(crate) fn lock(&mut self, txn: Option<TxnId>, file: FileID, mode: LockMode) -> Result<()> {
        if mode == LockMode::Shared {
            let dirty = txn
                .and_then(|t| self.txns.get(&t))
                .map_or(false, |n| n.flags.contains(TxnFlags::READ_UNCOMMITTED));
            if dirty {
                return Ok(());
            }
        }
        let locker = self.locker(txn);
        self.locks.acquire(locker, file, mode)
    }

    /// Keep undo under the transaction, or apply the change immediately
    /// if there is no transaction to hold it.
    fn record(&mut self, txn: Option<TxnId>, undo: Undo, redo: Option<RedoKind>) -> Result<()> {
        if let Some(node) = txn.and_then(|t| self.txns.get_mut(&t)) {
            if !node.is_family() {
                node.undo.push(undo);
                node.redo.extend(redo);
                return Ok(());
            }
        }
        if let Some(redo) = redo {
            if let Err(err) = self.write_log(txn.map_or(0, |t| t.0), vec![redo]) {
                self.apply_undo(undo);
                return Err(err);
            }
        }
        Ok(())
    }

    fn write_log(&mut self, txn: u64, data: Vec<RedoKind>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let os = Arc::clone(&self.os);
        if let Some(log) = self.log.as_mut() {
            log.write(os.as_ref(), &RedoLog { txn, data })?;
        }
        Ok(())
    }

    pub(crate) fn create(
        &mut self,
        txn: Option<TxnId>,
        name: Option<&str>,
        page_size: u32,
    ) -> Result<FileID> {
        if name.is_some() {
            self.writable()?;
        }
        let file = self.next_file;
        self.next_file += 1;
        let durable = name.is_some() && self.durable;
        let table = TableData::new(name.map(String::from), page_size, durable);
        let page_size = table.page_size;
        self.tables.insert(file, table);
        if let Some(name) = name {
            self.names.insert(name.to_string(), file);
        }
        self.lock(txn, file, LockMode::Exclusive)?;
        let redo = durable.then(|| RedoKind::Create {
            file,
            name: name.unwrap_or_default().to_string(),
            page_size,
        });
        self.record(txn, Undo::Create { file }, redo)?;
        Ok(file)
    }

    fn rename(&mut self, txn: Option<TxnId>, from: &str, to: &str) -> Result<()> {
        self.writable()?;
        self.check_txn(txn)?;
        let file = *self.names.get(from).ok_or(Error::NoEnt)?;
        if self.names.contains_key(to) {
            return Err(Error::Exists);
        }
        self.lock(txn, file, LockMode::Exclusive)?;
        self.names.remove(from);
        self.names.insert(to.to_string(), file);
        let table = self.table_mut(file)?;
        table.name = Some(to.to_string());
        let redo = table.durable.then(|| RedoKind::Rename {
            file,
            to: to.to_string(),
        });
        self.record(
            txn,
            Undo::Rename {
                file,
                from: from.to_string(),
            },
            redo,
        )
    }

    fn remove(&mut self, txn: Option<TxnId>, name: &str) -> Result<()> {
        self.writable()?;
        self.check_txn(txn)?;
        let file = *self.names.get(name).ok_or(Error::NoEnt)?;
        self.lock(txn, file, LockMode::Exclusive)?;
        self.names.remove(name);
        let table = self.tables.remove(&file).ok_or(Error::NoEnt)?;
        let redo = table.durable.then_some(RedoKind::Remove { file });
        self.record(txn, Undo::Remove { file, table }, redo)
    }

    /// Drop a private table without undo.
    pub(crate) fn discard(&mut self, file: FileID) {
        if let Some(table) = self.tables.get(&file) {
            if table.name.is_none() {
                self.tables.remove(&file);
                self.locks.forget(file);
            }
        }
    }

    pub(crate) fn get(&mut self, txn: Option<TxnId>, file: FileID, key: &[u8]) -> Result<Vec<u8>> {
        self.check_txn(txn)?;
        self.lock(txn, file, LockMode::Shared)?;
        self.table(file)?
            .get(key)
            .map(|v| v.to_vec())
            .ok_or(Error::NotFound)
    }

    pub(crate) fn put(
        &mut self,
        txn: Option<TxnId>,
        file: FileID,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.writable()?;
        self.check_txn(txn)?;
        self.lock(txn, file, LockMode::Exclusive)?;
        let table = self.table_mut(file)?;
        let extra = match table.get(key) {
            Some(old) => value.len().saturating_sub(old.len()),
            None => key.len() + value.len(),
        };
        if !table.fits(extra) {
            return Err(Error::NoSpace);
        }
        let old = table.upsert(key.to_vec(), value.to_vec());
        let redo = table.durable.then(|| RedoKind::Put {
            file,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.record(
            txn,
            Undo::Row {
                file,
                key: key.to_vec(),
                old,
            },
            redo,
        )
    }

    pub(crate) fn del(&mut self, txn: Option<TxnId>, file: FileID, key: &[u8]) -> Result<()> {
        self.writable()?;
        self.check_txn(txn)?;
        self.lock(txn, file, LockMode::Exclusive)?;
        let table = self.table_mut(file)?;
        let old = table.remove(key).ok_or(Error::NotFound)?;
        let redo = table.durable.then(|| RedoKind::Del {
            file,
            key: key.to_vec(),
        });
        self.record(
            txn,
            Undo::Row {
                file,
                key: key.to_vec(),
                old: Some(old),
            },
            redo,
        )
    }

    pub(crate) fn truncate(&mut self, txn: Option<TxnId>, file: FileID) -> Result<u64> {
        self.writable()?;
        self.check_txn(txn)?;
        self.lock(txn, file, LockMode::Exclusive)?;
        let table = self.table_mut(file)?;
        let rows = table.take_rows();
        let count = rows.len() as u64;
        let redo = table.durable.then_some(RedoKind::Truncate { file });
        self.record(txn, Undo::Rows { file, rows }, redo)?;
        Ok(count)
    }

    fn commit(&mut self, txn: TxnId) -> Result<()> {
        let children = self.txns.get(&txn).ok_or(Error::Invalid)?.children.clone();
        for child in children {
            self.commit(child)?;
        }
        let node = self.txns.remove(&txn).ok_or(Error::Invalid)?;
        if let Some(parent) = node.parent.and_then(|p| self.txns.get_mut(&p)) {
            parent.children.retain(|c| *c != txn);
            if !parent.is_family() {
                parent.undo.extend(node.undo);
                parent.redo.extend(node.redo);
                return Ok(());
            }
        }
        if !node.is_family() {
            self.locks.release_all(txn);
        }
        self.write_log(txn.0, node.redo)
    }

    fn abort(&mut self, txn: TxnId) -> Result<()> {
        let node = self.txns.get(&txn).ok_or(Error::Invalid)?;
        let top_level = self.is_top_level(node);
        let children = node.children.clone();
        for child in children.into_iter().rev() {
            self.abort(child)?;
        }
        let node = self.txns.remove(&txn).ok_or(Error::Invalid)?;
        if let Some(parent) = node.parent.and_then(|p| self.txns.get_mut(&p)) {
            parent.children.retain(|c| *c != txn);
        }
        for undo in node.undo.into_iter().rev() {
            self.apply_undo(undo);
        }
        if top_level && !node.flags.contains(TxnFlags::FAMILY) {
            self.locks.release_all(txn);
        }
        Ok(())
    }

    fn apply_undo(&mut self, undo: Undo) {
        match undo {
            Undo::Row { file, key, old } => {
                if let Some(table) = self.tables.get_mut(&file) {
                    match old {
                        Some(value) => {
                            table.upsert(key, value);
                        }
                        None => {
                            table.remove(&key);
                        }
                    }
                }
            }
            Undo::Rows { file, rows } => {
                if let Some(table) = self.tables.get_mut(&file) {
                    table.set_rows(rows);
                }
            }
            Undo::Create { file } => {
                if let Some(name) = self.tables.remove(&file).and_then(|t| t.name) {
                    self.names.remove(&name);
                }
                self.locks.forget(file);
            }
            Undo::Remove { file, table } => {
                if let Some(name) = table.name.clone() {
                    self.names.insert(name, file);
                }
                self.tables.insert(file, table);
            }
            Undo::Rename { file, from } => {
                if let Some(table) = self.tables.get_mut(&file) {
                    if let Some(to) = table.name.replace(from.clone()) {
                        self.names.remove(&to);
                    }
                    self.names.insert(from, file);
                }
            }
        }
    }

    fn apply_redo(&mut self, kind: RedoKind) -> Result<()> {
        match kind {
            RedoKind::Create {
                file,
                name,
                page_size,
            } => {
                self.names.insert(name.clone(), file);
                self.tables
                    .insert(file, TableData::new(Some(name), page_size, self.durable));
                self.next_file = self.next_file.max(file + 1);
            }
            RedoKind::Put { file, key, value } => {
                self.table_mut(file)
                    .map_err(|_| Error::RunRecovery)?
                    .upsert(key, value);
            }
            RedoKind::Del { file, key } => {
                self.table_mut(file)
                    .map_err(|_| Error::RunRecovery)?
                    .remove(&key);
            }
            RedoKind::Truncate { file } => {
                self.table_mut(file)
                    .map_err(|_| Error::RunRecovery)?
                    .take_rows();
            }
            RedoKind::Rename { file, to } => {
                let table = self.tables.get_mut(&file).ok_or(Error::RunRecovery)?;
                if let Some(from) = table.name.replace(to.clone()) {
                    self.names.remove(&from);
                }
                self.names.insert(to, file);
            }
            RedoKind::Remove { file } => {
                if let Some(name) = self.tables.remove(&file).and_then(|t| t.name) {
                    self.names.remove(&name);
                }
            }
        }
        Ok(())
    }

    fn load_snapshot(&mut self, snapshot: Snapshot) {
        self.next_file = self.next_file.max(snapshot.next_file);
        for t in snapshot.tables {
            let mut table = TableData::new(Some(t.name.clone()), t.page_size, self.durable);
            table.set_rows(t.rows);
            self.names.insert(t.name, t.file);
            self.tables.insert(t.file, table);
            self.next_file = self.next_file.max(t.file + 1);
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut tables: Vec<SnapshotTable> = self
            .tables
            .iter()
            .filter(|(_, t)| t.durable)
            .filter_map(|(file, t)| {
                t.name.as_ref().map(|name| SnapshotTable {
                    file: *file,
                    name: name.clone(),
                    page_size: t.page_size,
                    rows: t.rows.clone(),
                })
            })
            .collect();
        tables.sort_by_key(|t| t.file);
        Snapshot {
            next_file: self.next_file,
            tables,
        }
    }

    #[inline]
    fn has_pending_changes(&self) -> bool {
        self.txns.values().any(|n| !n.undo.is_empty())
    }
}
