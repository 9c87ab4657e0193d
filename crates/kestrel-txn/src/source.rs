//! Lock-free read path.

use std::time::Duration;

use bytes::Bytes;
use kestrel_common::{BlockId, KestrelError, Result};
use tokio::task::JoinHandle;

/// An image read that may still be in flight.
#[derive(Debug)]
pub enum Fetch {
    /// The image was already available locally.
    Ready(Bytes),
    /// The block is known to be gone.
    Missing(BlockId),
    /// A background read against the store.
    InFlight(JoinHandle<Result<Bytes>>),
}

impl Fetch {
    /// Waits for the image, failing with `Timeout` after `bound`.
    pub async fn resolve(self, id: BlockId, bound: Duration) -> Result<Bytes> {
        match self {
            Fetch::Ready(image) => Ok(image),
            Fetch::Missing(block_id) => Err(KestrelError::BlockNotFound { block_id }),
            Fetch::InFlight(handle) => match tokio::time::timeout(bound, handle).await {
                Ok(Ok(read)) => read,
                Ok(Err(join)) => Err(KestrelError::Internal(format!(
                    "load of block {id} did not complete: {join}"
                ))),
                Err(_) => Err(KestrelError::Timeout {
                    operation: format!("load of block {id}"),
                    waited_ms: bound.as_millis() as u64,
                }),
            },
        }
    }
}

/// Something page images can be read from without taking locks.
///
/// `fetch` starts the read immediately; the caller decides when to wait.
pub trait BlockSource: Send + Sync {
    /// Begins reading the image of `id`.
    fn fetch(&self, id: BlockId) -> Fetch;

    /// Bound on waiting for a fetch.
    fn load_timeout(&self) -> Duration;
}
