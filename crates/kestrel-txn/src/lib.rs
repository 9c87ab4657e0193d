//! Kestrel transactions and block locking.
//!
//! This crate provides:
//! - [`Engine`]: the node-local context every transaction runs against
//! - [`Txn`]: write-set staging, commit, abort and rollback
//! - [`LockManager`]: the local + cluster-wide lock protocol per block id
//! - [`BlockSource`]: the lock-free read path used by structure loads

pub mod engine;
pub mod lock;
pub mod source;
pub mod txn;

pub use engine::Engine;
pub use lock::LockManager;
pub use source::{BlockSource, Fetch};
pub use txn::Txn;
