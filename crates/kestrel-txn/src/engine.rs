//! Node-local engine context.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use kestrel_common::{BlockId, KestrelError, NodeId, Result, RowId, RowIdGenerator, StorageConfig, TxnId};
use kestrel_store::Store;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::lock::LockManager;
use crate::source::{BlockSource, Fetch};
use crate::txn::Txn;

struct EngineInner {
    store: Arc<dyn Store>,
    locks: LockManager,
    config: StorageConfig,
    next_txn: AtomicU64,
    row_ids: RowIdGenerator,
    catalog: OnceCell<BlockId>,
}

/// Everything one node needs to run transactions against a store.
///
/// Cheap to clone; clones share the lock table and configuration.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine over `store` after validating `config`.
    pub fn new(store: Arc<dyn Store>, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let node = store.node_id();
        let locks = LockManager::new(Arc::clone(&store), config.lock_timeout());
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                locks,
                config,
                next_txn: AtomicU64::new(1),
                row_ids: RowIdGenerator::new(node),
                catalog: OnceCell::new(),
            }),
        })
    }

    /// Starts a transaction.
    pub async fn begin(&self) -> Result<Txn> {
        let id = TxnId(self.inner.next_txn.fetch_add(1, Ordering::Relaxed));
        let store_txn = self.bounded("transaction begin", self.store().begin()).await?;
        Ok(Txn::new(id, store_txn, self.clone()))
    }

    /// Runs `work` in a fresh transaction.
    ///
    /// Commits when `work` succeeds. When `work` fails the transaction is
    /// rolled back and the error is returned wrapped in `TransactionFailed`.
    ///
    /// ```ignore
    /// let id = engine
    ///     .transactionally(|txn| Box::pin(async move { txn.create(image).await }))
    ///     .await?;
    /// ```
    pub async fn transactionally<T, F>(&self, work: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut Txn) -> BoxFuture<'t, Result<T>>,
    {
        let mut txn = self.begin().await?;
        match work(&mut txn).await {
            Ok(value) => match txn.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    if let Err(abort) = txn.abort().await {
                        warn!(txn = %txn.id(), error = %abort, "abort after failed commit failed");
                    }
                    Err(e)
                }
            },
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(txn = %txn.id(), error = %rollback, "rollback failed");
                }
                Err(KestrelError::transaction_failed(e))
            }
        }
    }

    /// Store backing this engine.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Node this engine runs on.
    pub fn node_id(&self) -> NodeId {
        self.inner.store.node_id()
    }

    /// Storage configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Block lock table for this node.
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Issues a fresh row id.
    pub fn next_row_id(&self) -> Result<RowId> {
        self.inner.row_ids.next_id()
    }

    /// Once-per-engine cell holding the catalog's root block.
    pub fn catalog_root(&self) -> &OnceCell<BlockId> {
        &self.inner.catalog
    }

    /// Awaits a store call, failing with `Timeout` past the load bound.
    pub(crate) async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let bound = self.inner.config.load_timeout();
        tokio::time::timeout(bound, call)
            .await
            .map_err(|_| KestrelError::Timeout {
                operation: operation.to_string(),
                waited_ms: bound.as_millis() as u64,
            })?
    }

    pub(crate) fn fetch_committed(&self, id: BlockId) -> Fetch {
        let store = Arc::clone(&self.inner.store);
        Fetch::InFlight(tokio::spawn(async move { store.get(id).await }))
    }
}

impl BlockSource for Engine {
    fn fetch(&self, id: BlockId) -> Fetch {
        self.fetch_committed(id)
    }

    fn load_timeout(&self) -> Duration {
        self.inner.config.load_timeout()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node", &self.node_id())
            .field("locks", &self.inner.locks)
            .finish()
    }
}
