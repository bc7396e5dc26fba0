use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Status codes of the key-value engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("key deleted")]
    KeyEmpty,
    #[error("lock deadlock")]
    Deadlock,
    #[error("lock not granted")]
    LockNotGranted,
    #[error("environment requires recovery")]
    RunRecovery,
    #[error("access denied")]
    Access,
    #[error("IO error")]
    Io,
    #[error("permission denied")]
    Perm,
    #[error("out of memory")]
    NoMem,
    #[error("no such file or table")]
    NoEnt,
    #[error("no space left")]
    NoSpace,
    #[error("already exists")]
    Exists,
    #[error("invalid argument")]
    Invalid,
}

impl Error {
    /// Returns true if the error is caused by lock contention and the
    /// operation is safe to retry.
    #[inline]
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Deadlock | Error::LockNotGranted)
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(src: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match src.kind() {
            ErrorKind::NotFound => Error::NoEnt,
            ErrorKind::PermissionDenied => Error::Perm,
            ErrorKind::AlreadyExists => Error::Exists,
            ErrorKind::OutOfMemory => Error::NoMem,
            ErrorKind::InvalidInput => Error::Invalid,
            _ => Error::Io,
        }
    }
}

impl From<bincode::error::DecodeError> for Error {
    #[inline]
    fn from(_src: bincode::error::DecodeError) -> Self {
        Error::RunRecovery
    }
}

impl From<bincode::error::EncodeError> for Error {
    #[inline]
    fn from(_src: bincode::error::EncodeError) -> Self {
        Error::Invalid
    }
}
