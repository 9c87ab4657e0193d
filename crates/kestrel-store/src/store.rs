//! The block store contract.
//!
//! Kestrel never owns physical storage. Every page image lives in a store:
//! a key-addressed, asynchronous, transactional blob store that also offers
//! named roots and a cluster-wide lock per block id.

use async_trait::async_trait;
use bytes::Bytes;
use kestrel_common::{BlockId, NodeId, Result};

/// Handle to one store-level transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreTxn(pub u64);

impl std::fmt::Display for StoreTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store-txn-{}", self.0)
    }
}

/// Asynchronous transactional blob store addressed by [`BlockId`].
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Node this handle acts for. Distributed locks are owned per node.
    fn node_id(&self) -> NodeId;

    /// Reads the committed image of a block.
    async fn get(&self, id: BlockId) -> Result<Bytes>;

    /// Reads a block inside a transaction, seeing that transaction's writes.
    async fn get_for_update(&self, id: BlockId, txn: StoreTxn) -> Result<Bytes>;

    /// Writes a new block and returns the id the store assigned to it.
    async fn put(&self, data: Bytes, txn: StoreTxn) -> Result<BlockId>;

    /// Overwrites an existing block.
    async fn set(&self, id: BlockId, data: Bytes, txn: StoreTxn) -> Result<()>;

    /// Deletes a block.
    async fn delete(&self, id: BlockId, txn: StoreTxn) -> Result<()>;

    /// Starts a transaction.
    async fn begin(&self) -> Result<StoreTxn>;

    /// Publishes every write of the transaction atomically.
    async fn commit(&self, txn: StoreTxn) -> Result<()>;

    /// Abandons a transaction whose commit failed. Idempotent.
    async fn abort(&self, txn: StoreTxn) -> Result<()>;

    /// Discards every write of the transaction. Idempotent.
    async fn rollback(&self, txn: StoreTxn) -> Result<()>;

    /// Returns the block registered under a well-known name, creating it
    /// (with empty content) if no such root exists yet.
    async fn get_root(&self, name: &str, txn: StoreTxn) -> Result<BlockId>;

    /// Returns true if `id` was created by `get_root` within this transaction.
    async fn is_root_created(&self, id: BlockId, txn: StoreTxn) -> Result<bool>;

    /// Acquires the cluster-wide lock on a block for this node.
    ///
    /// Resolves with the committed image at grant time (empty if none).
    async fn acquire(&self, id: BlockId) -> Result<Bytes>;

    /// Releases this node's cluster-wide lock on a block.
    async fn release(&self, id: BlockId) -> Result<()>;
}
