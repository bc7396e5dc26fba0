//! Registry of shared tables.
//!
//! Connections opening the same named file share one shared table and
//! one physical environment. The registry owns the list of named shared
//! tables, and the open mutex guarding it serializes every environment
//! open and close. In-memory and transient storage is private to its
//! connection and lives in one temporary environment created on first
//! use.

use crate::config::{Config, StorageMode};
use crate::conn::{ConnInner, ConnState, Connection, DbContext};
use crate::error::{Error, Result};
use crate::shared::SharedTable;
use crossbeam_utils::CachePadded;
use doradb_kv::env::{Env, EnvConfig};
use doradb_kv::os::{Os, StdOs};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    os: Arc<dyn Os>,
    /// Open mutex.
    named: Mutex<Vec<Arc<SharedTable>>>,
    temp: Mutex<Option<Arc<Env>>>,
    next_uid: CachePadded<AtomicU32>,
    next_conn: CachePadded<AtomicU64>,
}

impl Default for Registry {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[inline]
    pub fn new() -> Self {
        Self::with_os(Arc::new(StdOs))
    }

    /// Create a registry on top of the given file system.
    pub fn with_os(os: Arc<dyn Os>) -> Self {
        Registry {
            inner: Arc::new(RegistryInner {
                os,
                named: Mutex::new(vec![]),
                temp: Mutex::new(None),
                next_uid: CachePadded::new(AtomicU32::new(1)),
                next_conn: CachePadded::new(AtomicU64::new(1)),
            }),
        }
    }

    /// Create a static registry living as long as the process.
    #[inline]
    pub fn new_static() -> &'static Self {
        let reg = Self::new();
        Box::leak(Box::new(reg))
    }

    /// Open a connection.
    ///
    /// Named storage is shared: a second open of the same path attaches
    /// to the existing shared table, but one context may attach to a
    /// file only once. An existing environment is linked right away,
    /// otherwise it is created on first access.
    pub fn open(&self, config: Config, ctx: &Arc<DbContext>) -> Result<Connection> {
        let shared = match config.storage {
            StorageMode::Named => self.attach_named(config, ctx)?,
            StorageMode::InMemory | StorageMode::Transient => {
                let uid = self.inner.next_uid.fetch_add(1, Ordering::Relaxed);
                let shared = Arc::new(SharedTable::new(uid, config));
                shared.owners.lock().push(ctx.id());
                shared
            }
        };
        let read_only = shared.config.read_only;
        let inner = Arc::new(ConnInner {
            id: self.inner.next_conn.fetch_add(1, Ordering::Relaxed),
            registry: self.clone(),
            shared,
            ctx: Arc::clone(ctx),
            read_only,
            state: Mutex::new(ConnState::default()),
        });
        let conn = Connection::new(Arc::clone(&inner));
        if inner.shared.env().is_some() {
            let mut st = inner.state.lock();
            inner.connect(&mut st)?;
        }
        log::debug!(
            "open connection {} on shared table {}",
            conn.id(),
            inner.shared.uid()
        );
        Ok(conn)
    }

    fn attach_named(&self, config: Config, ctx: &Arc<DbContext>) -> Result<Arc<SharedTable>> {
        let path = config.path.clone().ok_or(Error::CantOpen)?;
        let mut named = self.inner.named.lock();
        let existing = named
            .iter()
            .find(|s| s.path().map_or(false, |p| p == &path))
            .cloned();
        if let Some(shared) = existing {
            let mut owners = shared.owners.lock();
            if owners.contains(&ctx.id()) {
                return Err(Error::Constraint);
            }
            owners.push(ctx.id());
            drop(owners);
            shared.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(shared);
        }
        let exists = self.prepare_environment(&config)?;
        let uid = self.inner.next_uid.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SharedTable::new(uid, config));
        if exists {
            shared.open_named_env(Arc::clone(&self.inner.os))?;
        }
        shared.owners.lock().push(ctx.id());
        named.push(Arc::clone(&shared));
        log::debug!("register shared table {} for {:?}", uid, path);
        Ok(shared)
    }

    /// Check the database file and get its environment directory ready.
    /// Returns whether the file exists.
    fn prepare_environment(&self, config: &Config) -> Result<bool> {
        let (path, env_dir) = match (config.path.as_ref(), config.env_dir()) {
            (Some(path), Some(dir)) => (path, dir),
            _ => return Err(Error::CantOpen),
        };
        let os = self.inner.os.as_ref();
        let exists = os.exists(path);
        if !exists {
            if config.read_only {
                return Err(Error::ReadOnly);
            }
            if !config.create {
                return Err(Error::CantOpen);
            }
            if os.exists(&env_dir) {
                remove_stale_environment(os, &env_dir)?;
            }
        }
        if !config.read_only && !os.exists(&env_dir) {
            os.mkdir(&env_dir)?;
        }
        Ok(exists)
    }

    /// Open the environment of a shared table on first access.
    pub(crate) fn open_environment(&self, shared: &SharedTable) -> Result<()> {
        match shared.storage() {
            StorageMode::Named => {
                let _named = self.inner.named.lock();
                if shared.env().is_none() {
                    shared.open_named_env(Arc::clone(&self.inner.os))?;
                }
            }
            StorageMode::InMemory | StorageMode::Transient => {
                if shared.env().is_none() {
                    shared.attach_temp_env(self.temp_env())?;
                }
            }
        }
        Ok(())
    }

    fn temp_env(&self) -> Arc<Env> {
        let mut temp = self.inner.temp.lock();
        let env = temp.get_or_insert_with(|| {
            log::debug!("create temporary environment");
            Env::open_in_memory(EnvConfig::default(), Arc::clone(&self.inner.os))
        });
        Arc::clone(env)
    }

    /// Drop one reference of a shared table, releasing it with the last.
    pub(crate) fn release(&self, shared: &Arc<SharedTable>, ctx_id: u64) {
        match shared.storage() {
            StorageMode::Named => {
                let mut named = self.inner.named.lock();
                shared.owners.lock().retain(|id| *id != ctx_id);
                if shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                    named.retain(|s| !Arc::ptr_eq(s, shared));
                    shared.shutdown();
                }
            }
            StorageMode::InMemory | StorageMode::Transient => {
                shared.refs.fetch_sub(1, Ordering::AcqRel);
                shared.shutdown();
            }
        }
    }

    /// Number of named files currently open.
    #[inline]
    pub fn named_count(&self) -> usize {
        self.inner.named.lock().len()
    }

    /// The shared table of an open named file.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<Arc<SharedTable>> {
        let path = path.as_ref();
        self.inner
            .named
            .lock()
            .iter()
            .find(|s| s.path().map_or(false, |p| p == path))
            .cloned()
    }
}

/// Remove an environment directory left behind by a deleted database.
fn remove_stale_environment(os: &dyn Os, env_dir: &Path) -> Result<()> {
    for name in os.dirlist(env_dir)? {
        os.unlink(&env_dir.join(&name))?;
    }
    os.rmdir(env_dir)?;
    log::debug!("remove stale environment {:?}", env_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_registry_static() {
        let reg = Registry::new_static();
        let ctx = DbContext::new();
        let conn = reg.open(Config::transient(), &ctx).unwrap();
        assert_eq!(reg.named_count(), 0);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_stale_environment_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let env_dir = dir.path().join("db-journal");
        std::fs::create_dir(&env_dir).unwrap();
        std::fs::write(env_dir.join("log.0000000001"), b"stale").unwrap();

        let reg = Registry::new();
        let ctx = DbContext::new();
        let conn = reg.open(Config::named(&path), &ctx).unwrap();
        assert!(!env_dir.join("log.0000000001").exists());
        assert!(env_dir.exists());
        assert!(conn.env().is_none());
        assert!(reg.lookup(&path).is_some());
        drop(conn);
        assert!(reg.lookup(&path).is_none());
    }
}
