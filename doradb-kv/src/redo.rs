//! Redo log and checkpoint snapshot.
//!
//! Only committed top-level transactions are written to the log, so
//! recovery replays every complete frame in order. A torn frame at the
//! tail is ignored.

use crate::error::{Error, Result};
use crate::os::Os;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOG_FILE_NAME: &str = "log.0000000001";

const CONFIG: bincode::config::Configuration = bincode::config::standard();
const FRAME_HEADER: usize = 4;

pub type FileID = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedoKind {
    Create {
        file: FileID,
        name: String,
        page_size: u32,
    },
    Put { file: FileID, key: Vec<u8>, value: Vec<u8> },
    Del { file: FileID, key: Vec<u8> },
    Truncate { file: FileID },
    Rename { file: FileID, to: String },
    Remove { file: FileID },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoLog {
    pub txn: u64,
    pub data: Vec<RedoKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotTable {
    pub file: FileID,
    pub name: String,
    pub page_size: u32,
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Persisted image of all named tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_file: FileID,
    pub tables: Vec<SnapshotTable>,
}

impl Snapshot {
    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, CONFIG)?)
    }

    #[inline]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::serde::decode_from_slice(bytes, CONFIG)?.0)
    }
}

/// Append-only redo log file.
pub struct RedoFile {
    path: PathBuf,
    size: u64,
    sync: bool,
}

impl RedoFile {
    #[inline]
    pub fn new(home: &Path, size: u64, sync: bool) -> Self {
        RedoFile {
            path: home.join(LOG_FILE_NAME),
            size,
            sync,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written since last reset.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write(&mut self, os: &dyn Os, log: &RedoLog) -> Result<()> {
        let body = bincode::serde::encode_to_vec(log, CONFIG)?;
        let len = u32::try_from(body.len()).map_err(|_| Error::Invalid)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        self.size = os.append(&self.path, &frame, self.sync)?;
        Ok(())
    }

    /// Drop all log content after a checkpoint.
    pub fn reset(&mut self, os: &dyn Os) -> Result<()> {
        if os.exists(&self.path) {
            os.unlink(&self.path)?;
        }
        self.size = 0;
        Ok(())
    }
}

/// Decode all complete frames of a log file.
/// Returns the frames and the length of the valid prefix.
pub fn read_frames(bytes: &[u8]) -> Result<(Vec<RedoLog>, usize)> {
    let mut logs = vec![];
    let mut offset = 0;
    while offset + FRAME_HEADER <= bytes.len() {
        let header: [u8; FRAME_HEADER] = bytes[offset..offset + FRAME_HEADER]
            .try_into()
            .map_err(|_| Error::RunRecovery)?;
        let len = u32::from_le_bytes(header) as usize;
        let start = offset + FRAME_HEADER;
        if start + len > bytes.len() {
            log::warn!("ignore torn redo frame at offset {}", offset);
            break;
        }
        let (log, _) = bincode::serde::decode_from_slice(&bytes[start..start + len], CONFIG)?;
        logs.push(log);
        offset = start + len;
    }
    Ok((logs, offset))
}
