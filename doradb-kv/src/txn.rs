use crate::redo::{FileID, RedoKind};
use crate::table::TableData;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Identifier of a transaction node inside one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

bitflags! {
    pub struct TxnFlags: u32 {
        /// Container transaction of a connection. Its children commit on
        /// their own and do not share locks with each other.
        const FAMILY = 0x01;
        /// Reads under this transaction neither take nor respect locks.
        const READ_UNCOMMITTED = 0x02;
    }
}

/// Compensation record applied in reverse order on abort.
pub(crate) enum Undo {
    /// Restore a single key to its previous value, or remove it.
    Row {
        file: FileID,
        key: Vec<u8>,
        old: Option<Vec<u8>>,
    },
    /// Restore all rows of a truncated table.
    Rows {
        file: FileID,
        rows: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Create {
        file: FileID,
    },
    Remove {
        file: FileID,
        table: TableData,
    },
    Rename {
        file: FileID,
        from: String,
    },
}

pub(crate) struct TxnNode {
    pub(crate) parent: Option<TxnId>,
    pub(crate) flags: TxnFlags,
    pub(crate) children: Vec<TxnId>,
    pub(crate) undo: Vec<Undo>,
    pub(crate) redo: Vec<RedoKind>,
}

impl TxnNode {
    #[inline]
    pub(crate) fn new(parent: Option<TxnId>, flags: TxnFlags) -> Self {
        TxnNode {
            parent,
            flags,
            children: vec![],
            undo: vec![],
            redo: vec![],
        }
    }

    #[inline]
    pub(crate) fn is_family(&self) -> bool {
        self.flags.contains(TxnFlags::FAMILY)
    }
}
