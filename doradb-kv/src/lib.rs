//! Transactional key-value engine.
//!
//! An [`env::Env`] holds named tables of sorted byte rows. Transactions
//! nest arbitrarily deep, take table level locks without waiting, and
//! are made durable through a redo log plus periodic checkpoint.

pub mod cmp;
pub mod cursor;
pub mod db;
pub mod env;
pub mod error;
mod lock;
pub mod os;
pub mod redo;
mod table;
pub mod txn;

pub mod prelude {
    pub use crate::cmp::*;
    pub use crate::cursor::*;
    pub use crate::db::*;
    pub use crate::env::*;
    pub use crate::error::*;
    pub use crate::os::*;
    pub use crate::txn::*;
}
