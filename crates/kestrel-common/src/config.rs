//! Configuration structures for Kestrel.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{KestrelError, Result};

/// Storage configuration shared by every structure on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Compression algorithm for page images.
    pub compression: CompressionType,
    /// Zstd compression level.
    pub zstd_level: i32,
    /// Bound on waiting for an in-flight load or create, in milliseconds.
    pub load_timeout_ms: u64,
    /// Bound on waiting for a block lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Bucket count of a freshly created chained hash table.
    pub hash_initial_buckets: usize,
    /// Growth factor applied to the bucket count on resize.
    pub hash_expansion_factor: usize,
    /// Maximum entries per B-tree node. Must be even and at least 4.
    pub btree_node_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: CompressionType::Zstd,
            zstd_level: 3,
            load_timeout_ms: 5000,
            lock_timeout_ms: 5000,
            hash_initial_buckets: 16,
            hash_expansion_factor: 3,
            btree_node_capacity: 64,
        }
    }
}

impl StorageConfig {
    /// Returns the load wait bound as a Duration.
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Returns the lock wait bound as a Duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Checks every field for a legal value.
    pub fn validate(&self) -> Result<()> {
        if self.btree_node_capacity < 4 || self.btree_node_capacity % 2 != 0 {
            return Err(invalid("btree_node_capacity", self.btree_node_capacity));
        }
        if self.hash_initial_buckets == 0 {
            return Err(invalid("hash_initial_buckets", self.hash_initial_buckets));
        }
        if self.hash_expansion_factor < 2 {
            return Err(invalid("hash_expansion_factor", self.hash_expansion_factor));
        }
        if self.load_timeout_ms == 0 {
            return Err(invalid("load_timeout_ms", self.load_timeout_ms));
        }
        if self.lock_timeout_ms == 0 {
            return Err(invalid("lock_timeout_ms", self.lock_timeout_ms));
        }
        Ok(())
    }
}

/// Cluster routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bound on waiting for a routed reply, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
        }
    }
}

impl ClusterConfig {
    /// Returns the reply wait bound as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Compression algorithm for page images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstd compression.
    #[default]
    Zstd = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = KestrelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            other => Err(KestrelError::Codec(format!("unknown compression type {other}"))),
        }
    }
}

fn invalid(name: &str, value: impl ToString) -> KestrelError {
    KestrelError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
