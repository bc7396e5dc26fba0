use doradb_kv::error::Error as KvError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Status codes reported to the query engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Lock contention, the whole top-level transaction should be retried.
    #[error("database is busy")]
    Busy,
    /// Conflict with another connection sharing the same handle.
    #[error("table is locked")]
    Locked,
    #[error("attempt to write a read-only database")]
    ReadOnly,
    #[error("not found")]
    NotFound,
    /// Unrecoverable, the environment must be recovered.
    #[error("database is corrupt")]
    Corrupt,
    #[error("disk I/O error")]
    IoErr,
    #[error("access permission denied")]
    Perm,
    #[error("out of memory")]
    NoMem,
    #[error("unable to open database")]
    CantOpen,
    #[error("database or table is full")]
    Full,
    #[error("database already attached")]
    Constraint,
    #[error("cursor used after its transaction ended")]
    Abort,
    #[error("table does not exist")]
    Empty,
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Map an engine error raised by a cursor or table operation, where
    /// contention means another connection holds the table.
    #[inline]
    pub fn locked(err: KvError) -> Self {
        match Error::from(err) {
            Error::Busy => Error::Locked,
            e => e,
        }
    }
}

impl From<KvError> for Error {
    #[inline]
    fn from(src: KvError) -> Self {
        match src {
            KvError::Deadlock | KvError::LockNotGranted => Error::Busy,
            KvError::NotFound => Error::NotFound,
            KvError::RunRecovery => Error::Corrupt,
            KvError::Access => Error::ReadOnly,
            KvError::Io => Error::IoErr,
            KvError::Perm => Error::Perm,
            KvError::NoMem => Error::NoMem,
            KvError::NoEnt => Error::CantOpen,
            KvError::NoSpace => Error::Full,
            KvError::KeyEmpty | KvError::Exists | KvError::Invalid => Error::Internal,
        }
    }
}
