//! Transaction hierarchy of a connection.
//!
//! Each connection owns a chain of engine transactions:
//! a family transaction living as long as the connection, a read
//! transaction per top-level SQL transaction, and one nested
//! transaction per open savepoint level. Level 0 is the statement level
//! opened together with the read transaction, so SQL savepoint `i`
//! lives at level `i + 1`.
//!
//! Cursors are bound to a node of the chain. Before a node is committed
//! or aborted, every cursor bound to it or to a descendant is detached.

use crate::conn::{ConnInner, ConnState};
use crate::cursor::detach_cursors;
use crate::error::{Error, Result};
use crate::handle::{old_name, DeletedTable};
use doradb_kv::txn::{TxnFlags, TxnId};

/// Transaction state of a connection. Only promoted within one
/// top-level transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TransState {
    #[default]
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SchemaLock {
    #[default]
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    Release,
    Rollback,
}

#[derive(Debug, Default)]
pub(crate) struct TxnChain {
    pub(crate) family: Option<TxnId>,
    pub(crate) read: Option<TxnId>,
    pub(crate) savepoints: Vec<TxnId>,
}

impl TxnChain {
    #[inline]
    fn innermost(&self) -> Option<TxnId> {
        self.savepoints.last().copied().or(self.read)
    }

    /// Transaction a new cursor binds to. Writers use the innermost
    /// savepoint, readers the read transaction.
    #[inline]
    pub(crate) fn cursor_txn(&self, write: bool) -> Option<TxnId> {
        if write {
            self.innermost().or(self.family)
        } else {
            self.read.or(self.family)
        }
    }

    /// The read transaction followed by all savepoints.
    #[inline]
    fn read_and_below(&self) -> Vec<TxnId> {
        self.read.iter().chain(self.savepoints.iter()).copied().collect()
    }
}

impl ConnInner {
    pub(crate) fn begin_trans_locked(&self, st: &mut ConnState, write: bool) -> Result<()> {
        if write && self.read_only {
            return Err(Error::ReadOnly);
        }
        if !st.connected {
            st.trans = if write || st.trans == TransState::Write {
                TransState::Write
            } else {
                TransState::Read
            };
            return Ok(());
        }
        if write {
            st.trans = TransState::Write;
        } else if st.trans == TransState::None {
            st.trans = TransState::Read;
        }
        if self.shared.transactional {
            let depth = self.ctx.savepoint_depth();
            if st.chain.read.is_none() || st.chain.savepoints.len() <= depth {
                self.begin_stmt_locked(st, depth)?;
            }
        }
        Ok(())
    }

    /// Open the read transaction if absent, then nested transactions
    /// until level `depth` exists.
    pub(crate) fn begin_stmt_locked(&self, st: &mut ConnState, depth: usize) -> Result<()> {
        if !st.connected || !self.shared.transactional {
            return Ok(());
        }
        let env = self.env()?;
        if st.chain.read.is_none() {
            let flags = if self.shared.config.read_uncommitted {
                TxnFlags::READ_UNCOMMITTED
            } else {
                TxnFlags::empty()
            };
            st.chain.read = Some(env.txn_begin(st.chain.family, flags)?);
        }
        while st.chain.savepoints.len() <= depth {
            let parent = st.chain.innermost();
            st.chain
                .savepoints
                .push(env.txn_begin(parent, TxnFlags::empty())?);
        }
        Ok(())
    }

    /// Release or roll back savepoint `level`, a negative level means the
    /// whole read transaction.
    pub(crate) fn savepoint_locked(
        &self,
        st: &mut ConnState,
        op: SavepointOp,
        level: i32,
    ) -> Result<()> {
        if !st.connected || !self.shared.transactional {
            return Ok(());
        }
        let n = st.chain.savepoints.len() as i64;
        if n == 0 || level as i64 + 2 > n {
            return Ok(());
        }
        if level < 0 {
            let res = self.end_read_txn(st, op == SavepointOp::Release);
            st.trans = TransState::None;
            return res;
        }
        let idx = level as usize + 1;
        let target = st.chain.savepoints[idx];
        let parent = st.chain.savepoints[idx - 1];
        let torn: Vec<TxnId> = st.chain.savepoints.split_off(idx);
        detach_cursors(&self.shared, self.id, |txn| {
            txn.map_or(false, |t| torn.contains(&t))
        });
        {
            let mut g = self.shared.state.lock();
            match op {
                SavepointOp::Rollback => g
                    .deleted
                    .retain(|d| d.conn != self.id || !torn.contains(&d.txn)),
                SavepointOp::Release => {
                    for d in g.deleted.iter_mut() {
                        if d.conn == self.id && torn.contains(&d.txn) {
                            d.txn = parent;
                        }
                    }
                }
            }
        }
        let env = self.env()?;
        let res = match op {
            SavepointOp::Release => env.txn_commit(target),
            SavepointOp::Rollback => env.txn_abort(target),
        };
        if op == SavepointOp::Rollback {
            self.shared.evict_stale_handles();
        }
        log::debug!(
            "{:?} savepoint {} of connection {}, depth {}",
            op,
            level,
            self.id,
            st.chain.savepoints.len()
        );
        Ok(res?)
    }

    /// Commit or abort the read transaction, tearing down the chain below
    /// the family transaction.
    pub(crate) fn end_read_txn(&self, st: &mut ConnState, commit: bool) -> Result<()> {
        let torn = st.chain.read_and_below();
        let read = match st.chain.read.take() {
            Some(read) => read,
            None => return Ok(()),
        };
        st.chain.savepoints.clear();
        detach_cursors(&self.shared, self.id, |txn| {
            txn.map_or(false, |t| torn.contains(&t))
        });
        let deleted: Vec<DeletedTable> = {
            let mut g = self.shared.state.lock();
            let (own, rest) = g.deleted.drain(..).partition(|d| d.conn == self.id);
            g.deleted = rest;
            own
        };
        let env = self.env()?;
        let res = if commit {
            env.txn_commit(read)
        } else {
            env.txn_abort(read)
        };
        if commit && res.is_ok() {
            for d in deleted {
                if let Some(name) = self.shared.table_name(d.table) {
                    let old = old_name(&name);
                    if let Err(e) = env.remove(None, &old) {
                        log::warn!("remove truncated table {} failed: {}", old, e);
                    }
                }
            }
        }
        if !commit {
            self.shared.evict_stale_handles();
        }
        Ok(res?)
    }

    pub(crate) fn commit_locked(&self, st: &mut ConnState) -> Result<()> {
        let active = self.ctx.active_stmts();
        let mut res = Ok(());
        if st.connected && st.chain.read.is_some() && active <= 1 {
            res = self.end_read_txn(st, true);
            if res.is_ok() {
                self.checkpoint();
            }
        } else if st.trans == TransState::Write {
            res = self.savepoint_locked(st, SavepointOp::Release, 0);
        }
        if active > 1 {
            st.trans = TransState::Read;
        } else {
            st.trans = TransState::None;
            self.release_schema_lock(st);
        }
        res
    }

    pub(crate) fn rollback_locked(&self, st: &mut ConnState) -> Result<()> {
        let res = if st.connected {
            self.end_read_txn(st, false)
        } else {
            Ok(())
        };
        st.trans = TransState::None;
        self.release_schema_lock(st);
        res
    }

    fn checkpoint(&self) {
        if let Some(env) = self.shared.env() {
            match env.checkpoint(self.shared.config.log_file_size) {
                Ok(true) => log::debug!("checkpoint shared table {}", self.shared.uid()),
                Ok(false) => (),
                Err(e) => log::warn!("checkpoint shared table {} failed: {}", self.shared.uid(), e),
            }
        }
    }

    #[inline]
    pub(crate) fn release_schema_lock(&self, st: &mut ConnState) {
        if st.schema_lock != SchemaLock::None {
            st.schema_lock = SchemaLock::None;
            self.shared.state.lock().schema_locks.remove(&self.id);
        }
    }
}
