use crate::error::{Error, Result};
use crate::redo::FileID;
use crate::txn::TxnId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockEntry {
    exclusive: Option<TxnId>,
    shared: Vec<TxnId>,
}

impl LockEntry {
    #[inline]
    fn is_empty(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }

    #[inline]
    fn conflicts(&self, locker: Option<TxnId>, mode: LockMode) -> bool {
        if let Some(owner) = self.exclusive {
            return Some(owner) != locker;
        }
        match mode {
            LockMode::Shared => false,
            LockMode::Exclusive => self.shared.iter().any(|s| Some(*s) != locker),
        }
    }
}

/// Table level locks, owned by top-level transactions.
///
/// Requests never wait: a conflicting request fails immediately with
/// lock-not-granted.
#[derive(Default)]
pub(crate) struct LockTable {
    entries: HashMap<FileID, LockEntry>,
}

impl LockTable {
    /// Acquire a lock for the locker. A request without locker only checks
    /// for conflicts and records nothing.
    pub(crate) fn acquire(
        &mut self,
        locker: Option<TxnId>,
        file: FileID,
        mode: LockMode,
    ) -> Result<()> {
        let entry = self.entries.entry(file).or_default();
        if entry.conflicts(locker, mode) {
            return Err(Error::LockNotGranted);
        }
        if let Some(locker) = locker {
            match mode {
                LockMode::Shared => {
                    if entry.exclusive != Some(locker) && !entry.shared.contains(&locker) {
                        entry.shared.push(locker);
                    }
                }
                LockMode::Exclusive => {
                    entry.shared.retain(|s| *s != locker);
                    entry.exclusive = Some(locker);
                }
            }
        }
        if entry.is_empty() {
            self.entries.remove(&file);
        }
        Ok(())
    }

    pub(crate) fn release_all(&mut self, locker: TxnId) {
        self.entries.retain(|_, entry| {
            if entry.exclusive == Some(locker) {
                entry.exclusive = None;
            }
            entry.shared.retain(|s| *s != locker);
            !entry.is_empty()
        });
    }

    #[inline]
    pub(crate) fn forget(&mut self, file: FileID) {
        self.entries.remove(&file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_table_conflicts() {
        let mut locks = LockTable::default();
        let (a, b) = (TxnId(1), TxnId(2));
        locks.acquire(Some(a), 7, LockMode::Shared).unwrap();
        locks.acquire(Some(b), 7, LockMode::Shared).unwrap();
        assert_eq!(
            locks.acquire(Some(a), 7, LockMode::Exclusive),
            Err(Error::LockNotGranted)
        );
        locks.release_all(b);
        // sole shared owner may upgrade
        locks.acquire(Some(a), 7, LockMode::Exclusive).unwrap();
        assert_eq!(
            locks.acquire(Some(b), 7, LockMode::Shared),
            Err(Error::LockNotGranted)
        );
        assert_eq!(
            locks.acquire(None, 7, LockMode::Shared),
            Err(Error::LockNotGranted)
        );
        locks.acquire(Some(a), 7, LockMode::Shared).unwrap();
        locks.release_all(a);
        locks.acquire(None, 7, LockMode::Exclusive).unwrap();
        locks.acquire(Some(b), 7, LockMode::Exclusive).unwrap();
    }
}
