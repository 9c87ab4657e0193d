//! Two-level block lock manager.
//!
//! Write access to a block requires two locks: a node-local lock that one
//! transaction on this node owns, and the store's cluster-wide lock that this
//! node owns. Each locked block has one [`LockRecord`] in a sharded map:
//!
//! ```text
//!   unlocked --lock--> held --lock (other txn)--> held + waiters
//!      ^                 |                              |
//!      +----release------+        release: hand-off ----+
//! ```
//!
//! The first locker installs the record and starts the cluster-wide acquire
//! in the background. Other transactions on this node queue on the record.
//! Releasing with queued waiters hands the local lock over and keeps the
//! cluster-wide lock on this node; releasing with no waiters drops both and
//! removes the record.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kestrel_common::{BlockId, KestrelError, Result, TxnId};
use kestrel_store::Store;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Progress of the cluster-wide lock behind a record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RemoteLock {
    Pending,
    Held,
    Failed(String),
}

#[derive(Debug)]
struct LockState {
    owner: Option<TxnId>,
    /// Reentrancy depth of the owner.
    depth: u32,
    /// Transactions parked on this record.
    waiters: usize,
    /// Set once the record has left the map. Lockers that see it retry.
    retired: bool,
}

/// Bookkeeping for one locked block id.
struct LockRecord {
    state: Mutex<LockState>,
    /// Bumped on every local release.
    released: watch::Sender<u64>,
    remote: watch::Sender<RemoteLock>,
}

impl LockRecord {
    fn owned_by(txn: TxnId) -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: Some(txn),
                depth: 1,
                waiters: 0,
                retired: false,
            }),
            released: watch::Sender::new(0),
            remote: watch::Sender::new(RemoteLock::Pending),
        }
    }

    fn remote_held(&self) -> bool {
        matches!(*self.remote.borrow(), RemoteLock::Held)
    }
}

/// Outcome of inspecting an existing record.
enum Attempt {
    Acquired,
    Retry,
    Wait(watch::Receiver<u64>, watch::Receiver<RemoteLock>),
}

/// Node-local lock table in front of the store's distributed lock.
pub struct LockManager {
    store: Arc<dyn Store>,
    records: DashMap<BlockId, Arc<LockRecord>>,
    timeout: Duration,
}

impl LockManager {
    /// Creates a lock manager whose waits are bounded by `timeout`.
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self {
            store,
            records: DashMap::new(),
            timeout,
        }
    }

    /// Locks `id` for `txn`, waiting for both the local and the cluster-wide lock.
    ///
    /// Reentrant for the owning transaction. Fails with `Timeout` if the
    /// lock is not granted within the configured bound.
    pub async fn lock(&self, txn: TxnId, id: BlockId) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let (record, installed) = match self.records.entry(id) {
                Entry::Occupied(e) => (Arc::clone(e.get()), false),
                Entry::Vacant(e) => {
                    let record = Arc::new(LockRecord::owned_by(txn));
                    e.insert(Arc::clone(&record));
                    (record, true)
                }
            };
            if installed {
                self.spawn_remote_acquire(id, Arc::clone(&record));
                return self.await_remote(txn, id, &record, deadline).await;
            }

            let attempt = {
                let mut state = record.state.lock();
                if state.retired {
                    Attempt::Retry
                } else if state.owner == Some(txn) {
                    state.depth += 1;
                    Attempt::Acquired
                } else if state.owner.is_none() {
                    state.owner = Some(txn);
                    state.depth = 1;
                    Attempt::Acquired
                } else {
                    state.waiters += 1;
                    Attempt::Wait(record.released.subscribe(), record.remote.subscribe())
                }
            };

            let (mut released, mut remote) = match attempt {
                Attempt::Acquired => return self.await_remote(txn, id, &record, deadline).await,
                Attempt::Retry => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Attempt::Wait(released, remote) => (released, remote),
            };

            let woke = tokio::time::timeout_at(deadline, async {
                let _ = released.changed().await;
                let _ = remote.wait_for(|r| *r != RemoteLock::Pending).await;
            })
            .await;

            let claimed = {
                let mut state = record.state.lock();
                state.waiters -= 1;
                if state.retired || state.owner.is_some() {
                    false
                } else if woke.is_ok() {
                    state.owner = Some(txn);
                    state.depth = 1;
                    true
                } else {
                    if state.waiters == 0 {
                        // Handed off to us but nobody is left to take it.
                        state.retired = true;
                    }
                    false
                }
            };

            if claimed {
                return self.await_remote(txn, id, &record, deadline).await;
            }
            if woke.is_err() {
                let retired = record.state.lock().retired;
                if retired {
                    self.forget(id, &record).await;
                }
                warn!(block_id = %id, %txn, "timed out waiting for local lock");
                return Err(self.timeout_error(id));
            }
        }
    }

    /// Releases one level of `txn`'s lock on `id`.
    ///
    /// Fails with `LockNotHeld` if `txn` does not own the lock.
    pub async fn release(&self, txn: TxnId, id: BlockId) -> Result<()> {
        let not_held = || KestrelError::LockNotHeld {
            block_id: id,
            txn_id: txn,
        };
        let record = self
            .records
            .get(&id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(not_held)?;

        let drop_remote = {
            let mut state = record.state.lock();
            if state.retired || state.owner != Some(txn) {
                return Err(not_held());
            }
            state.depth -= 1;
            if state.depth > 0 {
                return Ok(());
            }
            state.owner = None;
            if state.waiters > 0 {
                debug!(block_id = %id, %txn, waiters = state.waiters, "lock handed off to local waiter");
                false
            } else {
                state.retired = true;
                true
            }
        };
        record.released.send_modify(|v| *v += 1);

        if drop_remote {
            self.forget(id, &record).await;
        }
        Ok(())
    }

    /// Returns true if any transaction on this node holds `id`.
    pub fn is_locked(&self, id: BlockId) -> bool {
        self.holder(id).is_some()
    }

    /// Transaction currently holding `id`, if any.
    pub fn holder(&self, id: BlockId) -> Option<TxnId> {
        let record = self.records.get(&id).map(|r| Arc::clone(r.value()))?;
        let state = record.state.lock();
        if state.retired { None } else { state.owner }
    }

    /// Number of block ids with live bookkeeping.
    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    fn spawn_remote_acquire(&self, id: BlockId, record: Arc<LockRecord>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let outcome = store.acquire(id).await;
            let give_back = {
                let state = record.state.lock();
                match outcome {
                    Ok(_) if state.retired => true,
                    Ok(_) => {
                        record.remote.send_replace(RemoteLock::Held);
                        false
                    }
                    Err(e) => {
                        warn!(block_id = %id, error = %e, "distributed lock acquire failed");
                        record.remote.send_replace(RemoteLock::Failed(e.to_string()));
                        false
                    }
                }
            };
            if give_back {
                if let Err(e) = store.release(id).await {
                    warn!(block_id = %id, error = %e, "failed to return abandoned distributed lock");
                }
            }
        });
    }

    /// Waits until the cluster-wide lock behind `record` is resolved.
    async fn await_remote(
        &self,
        txn: TxnId,
        id: BlockId,
        record: &Arc<LockRecord>,
        deadline: Instant,
    ) -> Result<()> {
        let mut remote = record.remote.subscribe();
        let resolved = tokio::time::timeout_at(deadline, async {
            remote
                .wait_for(|r| *r != RemoteLock::Pending)
                .await
                .map(|r| r.clone())
        })
        .await;

        let failure = match resolved {
            Ok(Ok(RemoteLock::Held)) => return Ok(()),
            Ok(Ok(RemoteLock::Failed(reason))) => KestrelError::Store(reason),
            Ok(Ok(RemoteLock::Pending)) | Ok(Err(_)) => {
                KestrelError::Internal(format!("lock record for block {id} closed"))
            }
            Err(_) => {
                warn!(block_id = %id, %txn, "timed out waiting for distributed lock");
                self.timeout_error(id)
            }
        };

        // The owner never got the cluster-wide lock; abandon the record so
        // waiters start over with a fresh acquire.
        {
            let mut state = record.state.lock();
            if state.owner == Some(txn) {
                state.owner = None;
                state.depth = 0;
            }
            state.retired = true;
            record.remote.send_if_modified(|r| {
                if *r == RemoteLock::Pending {
                    *r = RemoteLock::Failed("abandoned".to_string());
                    true
                } else {
                    false
                }
            });
        }
        record.released.send_modify(|v| *v += 1);
        self.forget(id, record).await;
        Err(failure)
    }

    /// Removes a retired record and returns its cluster-wide lock if held.
    async fn forget(&self, id: BlockId, record: &Arc<LockRecord>) {
        self.records.remove_if(&id, |_, r| Arc::ptr_eq(r, record));
        let held = {
            let _state = record.state.lock();
            record.remote_held()
        };
        if held {
            if let Err(e) = self.store.release(id).await {
                warn!(block_id = %id, error = %e, "distributed lock release failed");
            }
        }
    }

    fn timeout_error(&self, id: BlockId) -> KestrelError {
        KestrelError::Timeout {
            operation: format!("lock on block {id}"),
            waited_ms: self.timeout.as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("tracked", &self.records.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
