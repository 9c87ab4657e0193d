//! Kestrel block store boundary.
//!
//! This crate provides:
//! - [`Store`]: the asynchronous, transactional blob store contract
//! - [`MemoryStore`] / [`MemoryGrid`]: an in-process implementation with
//!   per-node distributed locks

pub mod memory;
pub mod store;

pub use memory::{MemoryGrid, MemoryStore};
pub use store::{Store, StoreTxn};
