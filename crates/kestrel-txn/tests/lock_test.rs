//! Block lock protocol tests.
//!
//! Exercises the two-level lock through real transactions:
//! - mutual exclusion between transactions on one node
//! - hand-off to a queued local waiter keeps the distributed lock
//! - commit failures surface as TransactionFailed

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kestrel_common::{BlockId, KestrelError, NodeId, Result, StorageConfig};
use kestrel_store::{MemoryGrid, MemoryStore, Store, StoreTxn};
use kestrel_txn::Engine;

/// MemoryStore wrapper that counts distributed lock traffic and can fail commits.
struct InstrumentedStore {
    inner: MemoryStore,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    fail_commit: AtomicBool,
}

impl InstrumentedStore {
    fn new(inner: MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            fail_commit: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Store for InstrumentedStore {
    fn node_id(&self) -> NodeId {
        self.inner.node_id()
    }
    async fn get(&self, id: BlockId) -> Result<Bytes> {
        self.inner.get(id).await
    }
    async fn get_for_update(&self, id: BlockId, txn: StoreTxn) -> Result<Bytes> {
        self.inner.get_for_update(id, txn).await
    }
    async fn put(&self, data: Bytes, txn: StoreTxn) -> Result<BlockId> {
        self.inner.put(data, txn).await
    }
    async fn set(&self, id: BlockId, data: Bytes, txn: StoreTxn) -> Result<()> {
        self.inner.set(id, data, txn).await
    }
    async fn delete(&self, id: BlockId, txn: StoreTxn) -> Result<()> {
        self.inner.delete(id, txn).await
    }
    async fn begin(&self) -> Result<StoreTxn> {
        self.inner.begin().await
    }
    async fn commit(&self, txn: StoreTxn) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(KestrelError::Store("replica unavailable".into()));
        }
        self.inner.commit(txn).await
    }
    async fn abort(&self, txn: StoreTxn) -> Result<()> {
        self.inner.abort(txn).await
    }
    async fn rollback(&self, txn: StoreTxn) -> Result<()> {
        self.inner.rollback(txn).await
    }
    async fn get_root(&self, name: &str, txn: StoreTxn) -> Result<BlockId> {
        self.inner.get_root(name, txn).await
    }
    async fn is_root_created(&self, id: BlockId, txn: StoreTxn) -> Result<bool> {
        self.inner.is_root_created(id, txn).await
    }
    async fn acquire(&self, id: BlockId) -> Result<Bytes> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(id).await
    }
    async fn release(&self, id: BlockId) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(id).await
    }
}

fn setup() -> (Engine, Arc<InstrumentedStore>, MemoryGrid) {
    let grid = MemoryGrid::new();
    let store = InstrumentedStore::new(grid.node(NodeId(1)));
    let engine = Engine::new(store.clone(), StorageConfig::default()).unwrap();
    (engine, store, grid)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_locker_waits_for_release() {
    let (engine, _, _) = setup();
    let block = BlockId(100);

    let mut first = engine.begin().await.unwrap();
    first.lock(block).await.unwrap();

    let acquired = Arc::new(AtomicBool::new(false));
    let contender = {
        let engine = engine.clone();
        let acquired = Arc::clone(&acquired);
        tokio::spawn(async move {
            let mut second = engine.begin().await.unwrap();
            second.lock(block).await.unwrap();
            acquired.store(true, Ordering::SeqCst);
            second.commit().await.unwrap();
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!acquired.load(Ordering::SeqCst), "second locker must wait");
    assert_eq!(engine.locks().holder(block), Some(first.id()));

    first.commit().await.unwrap();
    contender.await.unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert!(!engine.locks().is_locked(block));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_lockers_are_mutually_exclusive() {
    let (engine, _, _) = setup();
    let block = BlockId(7);
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tokio::spawn(async move {
                let mut txn = engine.begin().await.unwrap();
                txn.lock(block).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                txn.commit().await.unwrap();
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(engine.locks().tracked(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hand_off_keeps_distributed_lock() {
    let (engine, store, grid) = setup();
    let block = BlockId(55);

    let mut first = engine.begin().await.unwrap();
    first.lock(block).await.unwrap();
    assert_eq!(store.acquires.load(Ordering::SeqCst), 1);

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut second = engine.begin().await.unwrap();
            second.lock(block).await.unwrap();
            // Hold until the test has inspected the hand-off.
            let _ = rx.await;
            second.commit().await.unwrap();
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    first.commit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Local lock moved to the waiter; the cluster-wide lock never left this node.
    assert_ne!(engine.locks().holder(block), None);
    assert_ne!(engine.locks().holder(block), Some(first.id()));
    assert_eq!(store.releases.load(Ordering::SeqCst), 0);
    assert_eq!(store.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(grid.lock_owner(block), Some(NodeId(1)));

    tx.send(()).unwrap();
    waiter.await.unwrap();

    // No waiter left: both levels are released.
    assert_eq!(store.releases.load(Ordering::SeqCst), 1);
    assert_eq!(grid.lock_owner(block), None);
    assert!(!engine.locks().is_locked(block));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nodes_contend_through_distributed_lock() {
    let grid = MemoryGrid::new();
    let node1 = Engine::new(Arc::new(grid.node(NodeId(1))), StorageConfig::default()).unwrap();
    let node2 = Engine::new(Arc::new(grid.node(NodeId(2))), StorageConfig::default()).unwrap();
    let block = BlockId(12);

    let mut holder = node1.begin().await.unwrap();
    holder.lock(block).await.unwrap();

    let remote = tokio::spawn(async move {
        let mut txn = node2.begin().await.unwrap();
        txn.lock(block).await.unwrap();
        txn.commit().await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!remote.is_finished());
    assert_eq!(grid.lock_owner(block), Some(NodeId(1)));

    holder.commit().await.unwrap();
    remote.await.unwrap();
    assert_eq!(grid.lock_owner(block), None);
}

#[tokio::test]
async fn test_lock_wait_is_bounded() {
    let grid = MemoryGrid::new();
    let config = StorageConfig {
        lock_timeout_ms: 50,
        ..StorageConfig::default()
    };
    let engine = Engine::new(Arc::new(grid.node(NodeId(1))), config).unwrap();

    let mut first = engine.begin().await.unwrap();
    first.lock(BlockId(1)).await.unwrap();

    let mut second = engine.begin().await.unwrap();
    let err = second.lock(BlockId(1)).await.unwrap_err();
    assert!(matches!(err, KestrelError::Timeout { .. }));
    assert!(err.is_fatal());

    second.rollback().await.unwrap();
    first.commit().await.unwrap();
}

#[tokio::test]
async fn test_commit_failure_is_wrapped_and_left_for_abort() {
    let (engine, store, grid) = setup();

    let mut txn = engine.begin().await.unwrap();
    let block = txn.create(Bytes::from_static(b"page")).await.unwrap();
    txn.lock(block).await.unwrap();

    store.fail_commit.store(true, Ordering::SeqCst);
    let err = txn.commit().await.unwrap_err();
    assert!(matches!(err, KestrelError::TransactionFailed { .. }));
    assert!(matches!(err.root_cause(), KestrelError::Store(_)));
    assert_eq!(txn.changed_len(), 0);

    // The store transaction and locks stay until an explicit abort.
    assert_eq!(grid.open_transactions(), 1);
    assert!(engine.locks().is_locked(block));

    txn.abort().await.unwrap();
    assert_eq!(grid.open_transactions(), 0);
    assert!(!engine.locks().is_locked(block));
}

#[tokio::test]
async fn test_transactionally_aborts_after_commit_failure() {
    let (engine, store, grid) = setup();
    store.fail_commit.store(true, Ordering::SeqCst);

    let err = engine
        .transactionally(|txn| {
            Box::pin(async move { txn.create(Bytes::from_static(b"x")).await })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KestrelError::TransactionFailed { .. }));
    assert_eq!(grid.open_transactions(), 0);
}
