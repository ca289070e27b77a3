//! `pagevault`: an embedded reader/writer for the SQLite 3 on-disk B-tree
//! format, with ACID rollback-journal transactions and an optional
//! transparent page-level AES-256-GCM encryption layer.
//!
//! The entry point is [`Database`]; open or create one, then read through
//! [`btree::cursor::Cursor`] or mutate through [`Transaction`]/[`Writer`].
//! This crate never initializes a logger -- wire up `env_logger` or
//! whatever the embedding application uses.

pub mod btree;
pub mod crypto;
pub mod db;
pub mod error;
pub mod options;
pub mod page;
pub mod record;
pub mod schema;
pub mod transaction;
pub mod varint;

pub use btree::cursor::Cursor;
pub use db::{Database, Writer};
pub use error::{Error, Result};
pub use options::{CreateOptions, OpenOptions};
pub use record::{OwnedValue, Row, SerialType, Value};
pub use schema::{Affinity, ColumnDescriptor, TableDescriptor};
pub use transaction::Transaction;
