//! Shared table: one per database file, shared by every connection
//! opening that file.

use crate::bulk::BulkBuffer;
use crate::config::{Config, StorageMode};
use crate::cursor::{CursorEntry, CursorId};
use crate::error::{Error, Result};
use crate::handle::{parse_table_id, retry_open, CachedHandle, DeletedTable, MASTER_ROOT};
use crate::trx::SchemaLock;
use doradb_kv::cmp::KeyComparator;
use doradb_kv::db::{Db, DbConfig};
use doradb_kv::env::{Env, EnvConfig};
use doradb_kv::os::Os;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of metadata slots.
pub const N_META: usize = 16;
/// Table keeping metadata slots of named storage.
pub const META_TABLE: &str = "metadb";
/// Lower bound of cache size in pages.
const MIN_CACHE_PAGES: u32 = 20;

#[derive(Debug, Clone, Copy, Default)]
struct MetaSlot {
    value: u32,
    valid: bool,
}

pub struct SharedTable {
    uid: u32,
    pub(crate) config: Config,
    pub(crate) transactional: bool,
    /// Connections referencing this table. Changed under the open mutex.
    pub(crate) refs: AtomicUsize,
    /// Ids of database contexts attached to this table.
    pub(crate) owners: Mutex<Vec<u64>>,
    env: RwLock<Option<Arc<Env>>>,
    pub(crate) last_table: AtomicU32,
    meta: Mutex<[MetaSlot; N_META]>,
    page_size: AtomicU32,
    page_size_fixed: AtomicBool,
    cache_size: AtomicU32,
    pub(crate) max_page_count: AtomicU32,
    pub(crate) key_cmp: RwLock<Option<Arc<dyn KeyComparator>>>,
    next_cursor: AtomicU64,
    pub(crate) state: Mutex<SharedState>,
}

/// Mutable state guarded by the shared table mutex.
pub(crate) struct SharedState {
    pub(crate) cursors: BTreeMap<CursorId, CursorEntry>,
    pub(crate) handles: HashMap<u32, CachedHandle>,
    pub(crate) meta_db: Option<Arc<Db>>,
    /// Whether inserts into the results table are still buffered.
    pub(crate) results_buffer: bool,
    pub(crate) bulk: Option<BulkBuffer>,
    pub(crate) deleted: Vec<DeletedTable>,
    pub(crate) schema_locks: HashMap<u64, SchemaLock>,
}

impl SharedTable {
    pub(crate) fn new(uid: u32, config: Config) -> Self {
        let results_buffer = config.storage == StorageMode::Transient
            && config.results_buffer
            && config.bulk_buffer_size > 0;
        let page_size = if Config::valid_page_size(config.page_size) {
            config.page_size
        } else {
            crate::config::DEFAULT_PAGE_SIZE
        };
        SharedTable {
            uid,
            transactional: config.is_transactional(),
            refs: AtomicUsize::new(1),
            owners: Mutex::new(vec![]),
            env: RwLock::new(None),
            last_table: AtomicU32::new(0),
            meta: Mutex::new([MetaSlot::default(); N_META]),
            page_size: AtomicU32::new(page_size),
            page_size_fixed: AtomicBool::new(false),
            cache_size: AtomicU32::new(config.cache_size),
            max_page_count: AtomicU32::new(config.max_page_count),
            key_cmp: RwLock::new(None),
            next_cursor: AtomicU64::new(1),
            state: Mutex::new(SharedState {
                cursors: BTreeMap::new(),
                handles: HashMap::new(),
                meta_db: None,
                results_buffer,
                bulk: None,
                deleted: vec![],
                schema_locks: HashMap::new(),
            }),
            config,
        }
    }

    #[inline]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    #[inline]
    pub fn storage(&self) -> StorageMode {
        self.config.storage
    }

    #[inline]
    pub fn path(&self) -> Option<&PathBuf> {
        self.config.path.as_ref()
    }

    #[inline]
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Number of connections sharing this table.
    #[inline]
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// The physical environment, absent until first real access.
    #[inline]
    pub fn env(&self) -> Option<Arc<Env>> {
        self.env.read().clone()
    }

    #[inline]
    pub fn last_table(&self) -> u32 {
        self.last_table.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn next_cursor_id(&self) -> CursorId {
        self.next_cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Open the environment of named storage and its system tables.
    /// Must be called under the open mutex of named storage.
    pub(crate) fn open_named_env(&self, os: Arc<dyn Os>) -> Result<()> {
        let (path, env_dir) = match (self.config.path.clone(), self.config.env_dir()) {
            (Some(path), Some(dir)) => (path, dir),
            _ => return Err(Error::CantOpen),
        };
        let read_only = self.config.read_only;
        let cache_pages = self.cache_size.load(Ordering::Relaxed).max(MIN_CACHE_PAGES);
        let config = EnvConfig {
            create: self.config.create && !read_only,
            transactional: true,
            durable: true,
            read_only,
            data_file: Some(path),
            cache_bytes: cache_pages as u64 * self.page_size() as u64,
            sync: false,
        };
        let env = Env::open(&env_dir, config, os)?;
        *self.env.write() = Some(Arc::clone(&env));
        if let Err(err) = self.open_system_tables(&env) {
            self.close_handles();
            *self.env.write() = None;
            if let Err(e) = env.close() {
                log::warn!("close environment {:?} after failed open: {}", env_dir, e);
            }
            return Err(err);
        }
        log::debug!("open shared table {} on {:?}", self.uid, env_dir);
        Ok(())
    }

    fn open_system_tables(&self, env: &Arc<Env>) -> Result<()> {
        let read_only = self.config.read_only;
        let config = DbConfig {
            create: !read_only,
            page_size: self.page_size(),
        };
        match retry_open(self.config.busy_retry_count, || {
            env.open_db(None, Some(META_TABLE), config)
        }) {
            Ok(db) => self.state.lock().meta_db = Some(db),
            Err(Error::CantOpen) if read_only => (),
            Err(e) => return Err(e),
        }
        if !read_only {
            self.get_or_create(MASTER_ROOT, true, None)?;
        }
        let listed = env
            .list_tables()
            .iter()
            .filter_map(|name| parse_table_id(name))
            .max()
            .unwrap_or(0);
        self.last_table.fetch_max(listed.max(MASTER_ROOT), Ordering::AcqRel);
        Ok(())
    }

    /// Attach the shared temporary environment.
    pub(crate) fn attach_temp_env(&self, env: Arc<Env>) -> Result<()> {
        *self.env.write() = Some(env);
        if self.config.storage == StorageMode::InMemory {
            self.get_or_create(MASTER_ROOT, true, None)?;
            self.last_table.fetch_max(MASTER_ROOT, Ordering::AcqRel);
        }
        log::debug!("attach shared table {} to temporary environment", self.uid);
        Ok(())
    }

    fn close_handles(&self) {
        let (handles, meta_db) = {
            let mut g = self.state.lock();
            (std::mem::take(&mut g.handles), g.meta_db.take())
        };
        for h in handles.into_values() {
            h.db.close();
        }
        if let Some(db) = meta_db {
            db.close();
        }
    }

    /// Release all physical resources once the last connection is gone.
    pub(crate) fn shutdown(&self) {
        self.close_handles();
        {
            let mut g = self.state.lock();
            g.cursors.clear();
            g.bulk = None;
            g.deleted.clear();
            g.schema_locks.clear();
        }
        let env = match self.env.write().take() {
            Some(env) => env,
            None => return,
        };
        match self.config.storage {
            StorageMode::Named => {
                if self.transactional {
                    if let Err(e) = env.checkpoint(0) {
                        log::warn!("checkpoint of shared table {} failed: {}", self.uid, e);
                    }
                }
                if let Err(e) = env.close() {
                    log::warn!("close environment of shared table {} failed: {}", self.uid, e);
                }
            }
            StorageMode::InMemory => {
                let prefix = format!("temp{:05}_", self.uid);
                for name in env.list_tables() {
                    if name.starts_with(&prefix) {
                        if let Err(e) = env.remove(None, &name) {
                            log::warn!("remove temporary table {} failed: {}", name, e);
                        }
                    }
                }
            }
            StorageMode::Transient => (),
        }
        log::debug!("release shared table {}", self.uid);
    }

    /// Read a metadata slot from cache.
    #[inline]
    pub(crate) fn cached_meta(&self, idx: usize) -> Option<u32> {
        let slot = self.meta.lock()[idx];
        slot.valid.then_some(slot.value)
    }

    #[inline]
    pub(crate) fn cache_meta(&self, idx: usize, value: u32) {
        self.meta.lock()[idx] = MetaSlot { value, valid: true };
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.page_size.load(Ordering::Acquire)
    }

    /// Change page size of tables created later. Invalid sizes are
    /// ignored, as is any change once the environment is open.
    pub(crate) fn set_page_size(&self, page_size: u32, fix: bool) -> Result<()> {
        if !Config::valid_page_size(page_size) {
            return Ok(());
        }
        if self.page_size_fixed.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        if self.env.read().is_some() {
            return Ok(());
        }
        self.page_size.store(page_size, Ordering::Release);
        if fix {
            self.page_size_fixed.store(true, Ordering::Release);
        }
        Ok(())
    }

    #[inline]
    pub fn cache_size(&self) -> u32 {
        self.cache_size.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_cache_size(&self, pages: u32) {
        self.cache_size.store(pages, Ordering::Release);
    }

    /// Pages used by all open tables.
    pub fn page_count(&self) -> Result<u32> {
        let dbs: Vec<Arc<Db>> = self
            .state
            .lock()
            .handles
            .values()
            .map(|h| Arc::clone(&h.db))
            .collect();
        let mut total = 0;
        for db in dbs {
            total += db.page_count()?;
        }
        Ok(total)
    }

    /// Set the page limit, never below what is already in use plus two
    /// reserved pages for each table created since it was opened.
    pub(crate) fn set_max_page_count(&self, pages: u32) -> Result<u32> {
        if pages == 0 {
            return Ok(self.max_page_count.load(Ordering::Acquire));
        }
        let handles: Vec<(Arc<Db>, bool)> = self
            .state
            .lock()
            .handles
            .values()
            .map(|h| (Arc::clone(&h.db), h.created))
            .collect();
        let mut floor = 0;
        for (db, created) in &handles {
            floor += db.page_count()?;
            if *created {
                floor += 2;
            }
        }
        let pages = pages.max(floor);
        for (db, _) in &handles {
            db.set_max_pages(pages)?;
        }
        self.max_page_count.store(pages, Ordering::Release);
        Ok(pages)
    }
}
