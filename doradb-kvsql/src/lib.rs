//! Storage adapter running a SQL engine on top of the doradb key-value
//! engine.
//!
//! The query engine talks in logical tables identified by integers,
//! cursors with save and restore semantics, and nested statement
//! transactions. This crate maps them onto physical tables, engine
//! cursors and nested engine transactions.
//!
//! ```no_run
//! use doradb_kvsql::prelude::*;
//!
//! let registry = Registry::new();
//! let ctx = DbContext::new();
//! let conn = registry.open(Config::named("test.db"), &ctx).unwrap();
//! conn.begin_trans(true).unwrap();
//! let table = conn.create_table(TableFlags::INTKEY).unwrap();
//! let mut cursor = conn.cursor(table, true).unwrap();
//! cursor.insert_int(1, b"hello", 0, false).unwrap();
//! drop(cursor);
//! conn.commit().unwrap();
//! ```

mod bulk;
pub mod codec;
pub mod config;
pub mod conn;
pub mod cursor;
pub mod error;
pub mod handle;
pub mod registry;
pub mod shared;
pub mod trx;

pub mod prelude {
    pub use crate::codec::{decode_i64, encode_i64};
    pub use crate::config::*;
    pub use crate::conn::{Connection, DbContext};
    pub use crate::cursor::{Cursor, CursorState};
    pub use crate::error::{Error, Result};
    pub use crate::handle::{TableFlags, MASTER_ROOT, RESULTS_TABLE};
    pub use crate::registry::Registry;
    pub use crate::shared::SharedTable;
    pub use crate::trx::{SavepointOp, TransState};
}
