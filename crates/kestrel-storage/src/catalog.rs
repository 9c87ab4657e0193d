//! Name → root block directory.
//!
//! The catalog is a [`ChainedHash`] of structure name to header block id,
//! itself stored at the store root named [`CATALOG_ROOT`]. Whichever
//! transaction first creates that root initializes the catalog; every other
//! engine discovers it. Each engine bootstraps at most once.

use kestrel_common::{BlockId, KestrelError, Result};
use kestrel_txn::{BlockSource, Engine, Txn};
use tracing::info;

use crate::hash::ChainedHash;
use crate::persist;

/// Well-known store root holding the catalog.
pub const CATALOG_ROOT: &str = "kestrel.catalog";

type Directory = ChainedHash<String, BlockId>;

/// Handle to the shared catalog.
#[derive(Clone)]
pub struct Catalog {
    engine: Engine,
    root: BlockId,
}

impl Catalog {
    /// Finds or creates the catalog. Later calls on the same engine reuse
    /// the first result.
    pub async fn open(engine: &Engine) -> Result<Self> {
        let root = *engine
            .catalog_root()
            .get_or_try_init(|| bootstrap(engine))
            .await?;
        Ok(Self {
            engine: engine.clone(),
            root,
        })
    }

    /// Block id of the catalog header.
    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Registers `name`. Fails with `AlreadyExists` if it is taken.
    pub async fn create(&self, txn: &mut Txn, name: &str, id: BlockId) -> Result<()> {
        let mut directory = Directory::open_for_writes(txn, self.root).await?;
        let key = name.to_string();
        if directory.contains(&*txn, &key).await? {
            return Err(KestrelError::AlreadyExists(name.to_string()));
        }
        directory.put(txn, key, id).await
    }

    /// Looks `name` up without taking locks.
    pub async fn get<S: BlockSource + ?Sized>(&self, src: &S, name: &str) -> Result<Option<BlockId>> {
        let directory = Directory::open(src, self.root).retrieved().await?;
        directory.get(src, &name.to_string()).await
    }

    /// Like [`Catalog::get`], but a missing name is `NotFound`.
    pub async fn require<S: BlockSource + ?Sized>(&self, src: &S, name: &str) -> Result<BlockId> {
        self.get(src, name)
            .await?
            .ok_or_else(|| KestrelError::NotFound(name.to_string()))
    }

    /// Unregisters `name`, returning the id it pointed to.
    pub async fn remove(&self, txn: &mut Txn, name: &str) -> Result<Option<BlockId>> {
        let mut directory = Directory::open_for_writes(txn, self.root).await?;
        directory.delete(txn, &name.to_string()).await
    }

    /// Every registered name, sorted.
    pub async fn names<S: BlockSource + ?Sized>(&self, src: &S) -> Result<Vec<String>> {
        let directory = Directory::open(src, self.root).retrieved().await?;
        let mut names: Vec<String> = directory
            .cursor(src)
            .collect()
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }
}

async fn bootstrap(engine: &Engine) -> Result<BlockId> {
    engine
        .transactionally(|txn| {
            Box::pin(async move {
                let store = std::sync::Arc::clone(txn.engine().store());
                let root = store.get_root(CATALOG_ROOT, txn.store_txn()).await?;
                if store.is_root_created(root, txn.store_txn()).await? {
                    let mut directory: Directory = persist::load_for_writes(txn, Some(root)).await?;
                    persist::upsert(&mut directory, txn).await?;
                    info!(root = %root, node = %txn.engine().node_id(), "catalog created");
                } else {
                    info!(root = %root, node = %txn.engine().node_id(), "catalog discovered");
                }
                Ok(root)
            })
        })
        .await
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").field("root", &self.root).finish()
    }
}
