//! Page-resident data structures for Kestrel.
//!
//! This crate provides:
//! - The persistence base every structure is built on ([`persist`])
//! - Size-bounded blocks and chained hash tables of blocks
//! - A B-tree with linked leaves and range cursors
//! - Rows of self-describing values
//! - The catalog of named structures
//! - Tables, temporary tables and unique indexes

mod block;
mod btree;
mod catalog;
pub mod codec;
mod hash;
mod index;
pub mod persist;
mod row;
mod table;

pub use block::{BLOCK_OVERHEAD, Block};
pub use btree::{BTree, RangeCursor};
pub use catalog::{CATALOG_ROOT, Catalog};
pub use codec::Codec;
pub use hash::{ChainedHash, HashCursor, MAX_BUCKETS};
pub use index::Index;
pub use persist::{Loading, Meta, Persistent};
pub use row::{Column, MAX_COLUMNS, Row, Value};
pub use table::{Table, TempTable};
