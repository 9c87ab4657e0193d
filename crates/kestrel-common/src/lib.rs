//! Kestrel common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Kestrel components.

pub mod config;
pub mod error;
pub mod id;
pub mod page;
pub mod types;

pub use config::{ClusterConfig, CompressionType, StorageConfig};
pub use error::{ErrorCategory, KestrelError, Result};
pub use id::{RowId, RowIdGenerator};
pub use page::{BlockId, NodeId, TxnId, IMAGE_HEADER_SIZE, PAGE_BUDGET};
pub use types::{StructureKind, TypeId};
