//! Transactions.
//!
//! A [`Txn`] wraps one store transaction together with the page images it
//! changed. Images are staged in memory and written to the store at commit;
//! reads through the transaction see its own staged images first.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use kestrel_common::{BlockId, KestrelError, Result, RowId, StorageConfig, TxnId};
use kestrel_store::StoreTxn;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::source::{BlockSource, Fetch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    /// Commit flush failed; waiting for an explicit abort.
    Failed,
    Committed,
    Aborted,
}

/// Process-local transaction handle. Not shared across tasks.
pub struct Txn {
    id: TxnId,
    store_txn: StoreTxn,
    engine: Engine,
    changed: HashMap<BlockId, Bytes>,
    deleted: HashSet<BlockId>,
    locked: HashSet<BlockId>,
    state: TxnState,
}

impl Txn {
    pub(crate) fn new(id: TxnId, store_txn: StoreTxn, engine: Engine) -> Self {
        Self {
            id,
            store_txn,
            engine,
            changed: HashMap::new(),
            deleted: HashSet::new(),
            locked: HashSet::new(),
            state: TxnState::Active,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn store_txn(&self) -> StoreTxn {
        self.store_txn
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &StorageConfig {
        self.engine.config()
    }

    /// Returns true until the transaction commits or aborts.
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Number of staged images.
    pub fn changed_len(&self) -> usize {
        self.changed.len()
    }

    /// Number of blocks marked for deletion.
    pub fn deleted_len(&self) -> usize {
        self.deleted.len()
    }

    /// Returns true if `id` is marked for deletion in this transaction.
    pub fn is_deleted(&self, id: BlockId) -> bool {
        self.deleted.contains(&id)
    }

    /// Issues a fresh row id.
    pub fn next_row_id(&self) -> Result<RowId> {
        self.engine.next_row_id()
    }

    /// Takes the block lock on `id` for the rest of this transaction.
    pub async fn lock(&mut self, id: BlockId) -> Result<()> {
        self.ensure_active()?;
        if self.locked.contains(&id) {
            return Ok(());
        }
        self.engine.locks().lock(self.id, id).await?;
        self.locked.insert(id);
        Ok(())
    }

    /// Reads `id` for modification: locks it, then reads through the store
    /// transaction. Staged images are returned without locking.
    pub async fn read_for_update(&mut self, id: BlockId) -> Result<Bytes> {
        self.ensure_active()?;
        if self.deleted.contains(&id) {
            return Err(KestrelError::BlockNotFound { block_id: id });
        }
        if let Some(image) = self.changed.get(&id) {
            return Ok(image.clone());
        }
        self.lock(id).await?;
        let operation = format!("load of block {id}");
        self.engine
            .bounded(
                &operation,
                self.engine.store().get_for_update(id, self.store_txn),
            )
            .await
    }

    /// Writes a new block and stages its image. Returns the assigned id.
    pub async fn create(&mut self, image: Bytes) -> Result<BlockId> {
        self.ensure_active()?;
        let id = self
            .engine
            .bounded(
                "block create",
                self.engine.store().put(image.clone(), self.store_txn),
            )
            .await?;
        self.changed.insert(id, image);
        Ok(id)
    }

    /// Stages a new image for an existing block.
    pub fn stage(&mut self, id: BlockId, image: Bytes) -> Result<()> {
        self.ensure_active()?;
        self.deleted.remove(&id);
        self.changed.insert(id, image);
        Ok(())
    }

    /// Marks `id` for deletion at commit.
    pub fn delete(&mut self, id: BlockId) -> Result<()> {
        self.ensure_active()?;
        self.changed.remove(&id);
        self.deleted.insert(id);
        Ok(())
    }

    /// Flushes every staged image, then commits the store transaction.
    ///
    /// On failure the staged changes are discarded and the error is returned
    /// as `TransactionFailed`; the store transaction is left for [`Txn::abort`].
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        let changed = self.changed.len();
        let deleted = self.deleted.len();

        if let Err(e) = self.flush().await {
            self.changed.clear();
            self.deleted.clear();
            self.state = TxnState::Failed;
            warn!(txn = %self.id, error = %e, "commit failed");
            return Err(KestrelError::transaction_failed(e));
        }

        self.state = TxnState::Committed;
        self.release_locks().await;
        debug!(txn = %self.id, changed, deleted, "committed");
        Ok(())
    }

    /// Abandons the transaction through the store's abort path.
    pub async fn abort(&mut self) -> Result<()> {
        self.finish(false).await
    }

    /// Discards every change and rolls the store transaction back.
    pub async fn rollback(&mut self) -> Result<()> {
        self.finish(true).await
    }

    async fn flush(&mut self) -> Result<()> {
        let store = std::sync::Arc::clone(self.engine.store());
        // Unordered: the write-set carries no cross-block ordering.
        for (id, image) in self.changed.drain() {
            let operation = format!("write of block {id}");
            self.engine
                .bounded(&operation, store.set(id, image, self.store_txn))
                .await?;
        }
        for id in self.deleted.drain() {
            let operation = format!("delete of block {id}");
            self.engine
                .bounded(&operation, store.delete(id, self.store_txn))
                .await?;
        }
        self.engine
            .bounded("store commit", store.commit(self.store_txn))
            .await
    }

    async fn finish(&mut self, rollback: bool) -> Result<()> {
        match self.state {
            TxnState::Aborted => return Ok(()),
            TxnState::Committed => return Err(KestrelError::TransactionClosed(self.id)),
            TxnState::Active | TxnState::Failed => {}
        }
        let changed = self.changed.len();
        self.changed.clear();
        self.deleted.clear();
        self.state = TxnState::Aborted;

        let store = self.engine.store();
        let outcome = if rollback {
            self.engine
                .bounded("store rollback", store.rollback(self.store_txn))
                .await
        } else {
            self.engine
                .bounded("store abort", store.abort(self.store_txn))
                .await
        };
        self.release_locks().await;
        debug!(txn = %self.id, discarded = changed, rollback, "transaction ended without commit");
        outcome
    }

    async fn release_locks(&mut self) {
        release_all(&self.engine, self.id, std::mem::take(&mut self.locked)).await;
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            _ => Err(KestrelError::TransactionClosed(self.id)),
        }
    }
}

impl BlockSource for Txn {
    fn fetch(&self, id: BlockId) -> Fetch {
        if self.deleted.contains(&id) {
            return Fetch::Missing(id);
        }
        match self.changed.get(&id) {
            Some(image) => Fetch::Ready(image.clone()),
            None => self.engine.fetch_committed(id),
        }
    }

    fn load_timeout(&self) -> Duration {
        self.engine.config().load_timeout()
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !matches!(self.state, TxnState::Active | TxnState::Failed) {
            return;
        }
        warn!(txn = %self.id, locks = self.locked.len(), "transaction dropped while active");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = self.engine.clone();
        let id = self.id;
        let store_txn = self.store_txn;
        let locked = std::mem::take(&mut self.locked);
        runtime.spawn(async move {
            if let Err(e) = engine.store().rollback(store_txn).await {
                warn!(txn = %id, error = %e, "rollback of dropped transaction failed");
            }
            release_all(&engine, id, locked).await;
        });
    }
}

/// Releases every lock in `locked` held by `txn`, logging each failure.
/// Returns the number of locks that could not be released.
async fn release_all(engine: &Engine, txn: TxnId, locked: HashSet<BlockId>) -> usize {
    let mut failed = 0;
    for block in locked {
        if let Err(e) = engine.locks().release(txn, block).await {
            warn!(%txn, block_id = %block, error = %e, "lock release failed");
            failed += 1;
        }
    }
    failed
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("store_txn", &self.store_txn)
            .field("state", &self.state)
            .field("changed", &self.changed.len())
            .field("deleted", &self.deleted.len())
            .field("locked", &self.locked.len())
            .finish()
    }
}
