//! In-process block store.
//!
//! A [`MemoryGrid`] holds the committed blocks, named roots, open
//! transactions and distributed locks of a whole simulated cluster. Each
//! node talks to it through its own [`MemoryStore`] handle, so several
//! nodes in one process share data while owning locks separately.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use kestrel_common::{BlockId, KestrelError, NodeId, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::store::{Store, StoreTxn};

/// Writes buffered by an open transaction. `None` marks a deletion.
#[derive(Default)]
struct PendingTxn {
    writes: HashMap<BlockId, Option<Bytes>>,
    created_roots: Vec<(String, BlockId)>,
}

/// Cluster-wide lock on one block.
#[derive(Default)]
struct DistLock {
    owner: Option<NodeId>,
    queue: VecDeque<(NodeId, oneshot::Sender<()>)>,
}

#[derive(Default)]
struct GridInner {
    blocks: RwLock<HashMap<BlockId, Bytes>>,
    roots: Mutex<HashMap<String, BlockId>>,
    txns: Mutex<HashMap<StoreTxn, PendingTxn>>,
    locks: Mutex<HashMap<BlockId, DistLock>>,
    next_block: AtomicU64,
    next_txn: AtomicU64,
}

/// Shared state of an in-process cluster.
#[derive(Clone, Default)]
pub struct MemoryGrid {
    inner: Arc<GridInner>,
}

impl MemoryGrid {
    /// Creates an empty grid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a store handle acting for `node`.
    pub fn node(&self, node: NodeId) -> MemoryStore {
        MemoryStore {
            grid: self.clone(),
            node,
        }
    }

    /// Node currently holding the distributed lock on `id`, if any.
    pub fn lock_owner(&self, id: BlockId) -> Option<NodeId> {
        self.inner.locks.lock().get(&id).and_then(|l| l.owner)
    }

    /// Number of committed blocks.
    pub fn block_count(&self) -> usize {
        self.inner.blocks.read().len()
    }

    /// Number of transactions begun but not yet finished.
    pub fn open_transactions(&self) -> usize {
        self.inner.txns.lock().len()
    }

    fn allocate_block(&self) -> BlockId {
        BlockId(self.inner.next_block.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn with_txn<T>(&self, txn: StoreTxn, f: impl FnOnce(&mut PendingTxn) -> T) -> Result<T> {
        let mut txns = self.inner.txns.lock();
        let pending = txns
            .get_mut(&txn)
            .ok_or_else(|| KestrelError::Store(format!("unknown transaction {txn}")))?;
        Ok(f(pending))
    }

    fn committed(&self, id: BlockId) -> Result<Bytes> {
        self.inner
            .blocks
            .read()
            .get(&id)
            .cloned()
            .ok_or(KestrelError::BlockNotFound { block_id: id })
    }

    fn discard(&self, txn: StoreTxn) {
        let Some(pending) = self.inner.txns.lock().remove(&txn) else {
            return;
        };
        if pending.created_roots.is_empty() {
            return;
        }
        let mut roots = self.inner.roots.lock();
        let mut blocks = self.inner.blocks.write();
        for (name, id) in pending.created_roots {
            roots.remove(&name);
            blocks.remove(&id);
        }
    }
}

/// Per-node handle onto a [`MemoryGrid`].
#[derive(Clone)]
pub struct MemoryStore {
    grid: MemoryGrid,
    node: NodeId,
}

impl MemoryStore {
    /// Creates a single-node store on a private grid.
    pub fn standalone() -> Self {
        MemoryGrid::new().node(NodeId(1))
    }

    /// Grid this handle belongs to.
    pub fn grid(&self) -> &MemoryGrid {
        &self.grid
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn node_id(&self) -> NodeId {
        self.node
    }

    async fn get(&self, id: BlockId) -> Result<Bytes> {
        self.grid.committed(id)
    }

    async fn get_for_update(&self, id: BlockId, txn: StoreTxn) -> Result<Bytes> {
        let staged = self.grid.with_txn(txn, |p| p.writes.get(&id).cloned())?;
        match staged {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(KestrelError::BlockNotFound { block_id: id }),
            None => self.grid.committed(id),
        }
    }

    async fn put(&self, data: Bytes, txn: StoreTxn) -> Result<BlockId> {
        let id = self.grid.allocate_block();
        self.grid.with_txn(txn, |p| p.writes.insert(id, Some(data)))?;
        trace!(block_id = %id, %txn, "put");
        Ok(id)
    }

    async fn set(&self, id: BlockId, data: Bytes, txn: StoreTxn) -> Result<()> {
        self.grid.with_txn(txn, |p| p.writes.insert(id, Some(data)))?;
        Ok(())
    }

    async fn delete(&self, id: BlockId, txn: StoreTxn) -> Result<()> {
        self.grid.with_txn(txn, |p| p.writes.insert(id, None))?;
        Ok(())
    }

    async fn begin(&self) -> Result<StoreTxn> {
        let txn = StoreTxn(self.grid.inner.next_txn.fetch_add(1, Ordering::Relaxed) + 1);
        self.grid
            .inner
            .txns
            .lock()
            .insert(txn, PendingTxn::default());
        Ok(txn)
    }

    async fn commit(&self, txn: StoreTxn) -> Result<()> {
        let pending = self
            .grid
            .inner
            .txns
            .lock()
            .remove(&txn)
            .ok_or_else(|| KestrelError::Store(format!("unknown transaction {txn}")))?;

        let writes = pending.writes.len();
        let mut blocks = self.grid.inner.blocks.write();
        for (id, data) in pending.writes {
            match data {
                Some(data) => {
                    blocks.insert(id, data);
                }
                None => {
                    blocks.remove(&id);
                }
            }
        }
        debug!(%txn, node = %self.node, writes, "store commit");
        Ok(())
    }

    async fn abort(&self, txn: StoreTxn) -> Result<()> {
        self.grid.discard(txn);
        Ok(())
    }

    async fn rollback(&self, txn: StoreTxn) -> Result<()> {
        self.grid.discard(txn);
        Ok(())
    }

    async fn get_root(&self, name: &str, txn: StoreTxn) -> Result<BlockId> {
        // Fail before registering anything if the transaction is unknown.
        self.grid.with_txn(txn, |_| ())?;

        let id = {
            let mut roots = self.grid.inner.roots.lock();
            match roots.entry(name.to_string()) {
                Entry::Occupied(e) => return Ok(*e.get()),
                Entry::Vacant(e) => {
                    let id = self.grid.allocate_block();
                    e.insert(id);
                    self.grid.inner.blocks.write().insert(id, Bytes::new());
                    id
                }
            }
        };

        self.grid
            .with_txn(txn, |p| p.created_roots.push((name.to_string(), id)))?;
        debug!(root = name, block_id = %id, "root created");
        Ok(id)
    }

    async fn is_root_created(&self, id: BlockId, txn: StoreTxn) -> Result<bool> {
        self.grid
            .with_txn(txn, |p| p.created_roots.iter().any(|(_, root)| *root == id))
    }

    async fn acquire(&self, id: BlockId) -> Result<Bytes> {
        let waiter = {
            let mut locks = self.grid.inner.locks.lock();
            let lock = locks.entry(id).or_default();
            if lock.owner.is_none() {
                lock.owner = Some(self.node);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                lock.queue.push_back((self.node, tx));
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            rx.await.map_err(|_| {
                KestrelError::Store(format!("distributed lock on block {id} was dropped"))
            })?;
        }
        trace!(block_id = %id, node = %self.node, "distributed lock granted");

        Ok(self.grid.inner.blocks.read().get(&id).cloned().unwrap_or_default())
    }

    async fn release(&self, id: BlockId) -> Result<()> {
        let mut locks = self.grid.inner.locks.lock();
        let Some(lock) = locks.get_mut(&id) else {
            return Err(KestrelError::Store(format!(
                "{} does not hold the distributed lock on block {id}",
                self.node
            )));
        };
        if lock.owner != Some(self.node) {
            return Err(KestrelError::Store(format!(
                "{} does not hold the distributed lock on block {id}",
                self.node
            )));
        }

        lock.owner = None;
        while let Some((node, tx)) = lock.queue.pop_front() {
            if tx.send(()).is_ok() {
                lock.owner = Some(node);
                break;
            }
        }
        if lock.owner.is_none() {
            locks.remove(&id);
        }
        trace!(block_id = %id, node = %self.node, "distributed lock released");
        Ok(())
    }
}
