//! Persistence base shared by every page-resident structure.
//!
//! A structure implements [`Persistent`] with an explicit body schema. The
//! free functions here add the common envelope around it:
//!
//! ```text
//! page image = seal( [kind tag: u8] [body ...] )
//! ```
//!
//! and tie loading and writing to the read path ([`BlockSource`]) or to a
//! transaction ([`Txn`]).

use std::marker::PhantomData;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kestrel_common::page::{self, PAGE_BUDGET};
use kestrel_common::{
    BlockId, IMAGE_HEADER_SIZE, KestrelError, Result, StorageConfig, StructureKind,
};
use kestrel_txn::{BlockSource, Fetch, Txn};

use crate::codec;

/// Identity and size bookkeeping embedded in every structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Meta {
    id: Option<BlockId>,
    size: usize,
}

impl Meta {
    /// Block id, unset until the structure is first written.
    pub fn id(&self) -> Option<BlockId> {
        self.id
    }

    pub fn assign(&mut self, id: BlockId) {
        self.id = Some(id);
    }

    /// Estimated uncompressed image size in bytes, framing included.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub fn grow(&mut self, bytes: usize) {
        self.size += bytes;
    }

    pub fn shrink(&mut self, bytes: usize) {
        self.size = self.size.saturating_sub(bytes);
    }
}

/// Two structures are the same iff both have an id and the ids match.
impl PartialEq for Meta {
    fn eq(&self, other: &Self) -> bool {
        matches!((self.id, other.id), (Some(a), Some(b)) if a == b)
    }
}

/// A structure stored as one page image.
pub trait Persistent: Sized + Send + 'static {
    /// Tag written in front of the body.
    const KIND: StructureKind;

    fn meta(&self) -> &Meta;

    fn meta_mut(&mut self) -> &mut Meta;

    /// Writes the body (everything after the kind tag).
    fn encode_body(&self, buf: &mut BytesMut);

    /// Reads a body written by `encode_body`.
    fn decode_body(buf: &mut &[u8]) -> Result<Self>;

    /// The empty structure a zero-length image stands for.
    fn vacant() -> Self;

    /// Block id, if assigned.
    fn id(&self) -> Option<BlockId> {
        self.meta().id()
    }
}

/// Encodes `item` as a page image, enforcing [`PAGE_BUDGET`].
pub fn encode<T: Persistent>(item: &T, config: &StorageConfig) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(item.meta().size() + 1);
    body.put_u8(T::KIND as u8);
    item.encode_body(&mut body);

    let image = page::seal(&body, config.compression, config.zstd_level)?;
    if image.len() > PAGE_BUDGET {
        return Err(KestrelError::PageBudgetExceeded {
            kind: T::KIND.to_string(),
            estimated: item.meta().size(),
            actual: image.len(),
            budget: PAGE_BUDGET,
        });
    }
    Ok(image)
}

/// Decodes the image of block `id`. An empty image yields [`Persistent::vacant`].
pub fn decode<T: Persistent>(id: BlockId, image: &[u8]) -> Result<T> {
    let mut item = if image.is_empty() {
        T::vacant()
    } else {
        let payload = page::open(id, image)?;
        let mut buf = &payload[..];
        let kind = StructureKind::try_from(codec::get_u8(&mut buf, "kind tag")?)?;
        if kind != T::KIND {
            return Err(KestrelError::KindMismatch {
                expected: T::KIND.to_string(),
                actual: kind.to_string(),
            });
        }
        let mut item = T::decode_body(&mut buf)?;
        if !buf.is_empty() {
            return Err(KestrelError::BlockCorrupted {
                block_id: id,
                reason: format!("{} trailing bytes after {}", buf.len(), T::KIND),
            });
        }
        if item.meta().size() == 0 {
            item.meta_mut().set_size(payload.len() + IMAGE_HEADER_SIZE);
        }
        item
    };
    item.meta_mut().assign(id);
    Ok(item)
}

/// A structure load that has been started but not yet waited on.
#[must_use = "a load does nothing useful until retrieved"]
pub struct Loading<T> {
    id: BlockId,
    fetch: Fetch,
    bound: Duration,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Persistent> Loading<T> {
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Waits for the load to finish. Fails with `Timeout` past the load bound.
    pub async fn retrieved(self) -> Result<T> {
        let image = self.fetch.resolve(self.id, self.bound).await?;
        decode(self.id, &image)
    }
}

/// Starts loading `id` without taking any lock.
///
/// The read may race concurrent writers and observe a stale image.
pub fn load_for_reads<T, S>(src: &S, id: BlockId) -> Loading<T>
where
    T: Persistent,
    S: BlockSource + ?Sized,
{
    Loading {
        id,
        fetch: src.fetch(id),
        bound: src.load_timeout(),
        _kind: PhantomData,
    }
}

/// Loads `id` for modification under `txn`, taking its block lock.
///
/// `None` yields a fresh structure that gets an id on its first upsert.
pub async fn load_for_writes<T: Persistent>(txn: &mut Txn, id: Option<BlockId>) -> Result<T> {
    match id {
        None => Ok(T::vacant()),
        Some(id) => {
            let image = txn.read_for_update(id).await?;
            decode(id, &image)
        }
    }
}

/// Creates the block for `item` if it has none, else stages an overwrite.
pub async fn upsert<T: Persistent>(item: &mut T, txn: &mut Txn) -> Result<BlockId> {
    let image = encode(item, txn.config())?;
    match item.meta().id() {
        Some(id) => {
            txn.stage(id, image)?;
            Ok(id)
        }
        None => {
            let id = txn.create(image).await?;
            item.meta_mut().assign(id);
            Ok(id)
        }
    }
}

/// Marks the block of `item` for deletion. Unwritten structures are ignored.
pub fn delete<T: Persistent>(item: &T, txn: &mut Txn) -> Result<()> {
    match item.meta().id() {
        Some(id) => txn.delete(id),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use kestrel_common::CompressionType;
    use kestrel_store::MemoryStore;
    use kestrel_txn::Engine;
    use std::sync::Arc;

    /// Minimal structure: one counter.
    #[derive(Debug, Default)]
    struct Counter {
        meta: Meta,
        value: u64,
    }

    impl Persistent for Counter {
        const KIND: StructureKind = StructureKind::Block;

        fn meta(&self) -> &Meta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut Meta {
            &mut self.meta
        }
        fn encode_body(&self, buf: &mut BytesMut) {
            self.value.encode(buf);
        }
        fn decode_body(buf: &mut &[u8]) -> Result<Self> {
            Ok(Self {
                meta: Meta::default(),
                value: u64::decode(buf)?,
            })
        }
        fn vacant() -> Self {
            Self::default()
        }
    }

    /// Structure whose body ignores any budget.
    struct Blob {
        meta: Meta,
        payload: Vec<u8>,
    }

    impl Persistent for Blob {
        const KIND: StructureKind = StructureKind::TempTable;

        fn meta(&self) -> &Meta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut Meta {
            &mut self.meta
        }
        fn encode_body(&self, buf: &mut BytesMut) {
            buf.put_slice(&self.payload);
        }
        fn decode_body(_buf: &mut &[u8]) -> Result<Self> {
            Err(KestrelError::Internal("write-only".into()))
        }
        fn vacant() -> Self {
            Self {
                meta: Meta::default(),
                payload: Vec::new(),
            }
        }
    }

    fn engine() -> Engine {
        Engine::new(Arc::new(MemoryStore::standalone()), StorageConfig::default()).unwrap()
    }

    #[test]
    fn test_meta_equality_needs_assigned_ids() {
        let mut a = Meta::default();
        let mut b = Meta::default();
        assert_ne!(a, b);
        a.assign(BlockId(3));
        assert_ne!(a, b);
        b.assign(BlockId(3));
        assert_eq!(a, b);
        b.assign(BlockId(4));
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_image_decodes_to_vacant() {
        let counter: Counter = decode(BlockId(8), &[]).unwrap();
        assert_eq!(counter.value, 0);
        assert_eq!(counter.id(), Some(BlockId(8)));
    }

    #[test]
    fn test_decode_rejects_other_kind() {
        let config = StorageConfig::default();
        let mut blob = Blob::vacant();
        blob.payload = vec![1, 2, 3];
        let image = encode(&blob, &config).unwrap();

        let err = decode::<Counter>(BlockId(1), &image).unwrap_err();
        assert!(matches!(err, KestrelError::KindMismatch { .. }));
    }

    #[test]
    fn test_encode_enforces_page_budget() {
        let config = StorageConfig {
            compression: CompressionType::None,
            ..StorageConfig::default()
        };
        let mut blob = Blob::vacant();
        blob.payload = vec![0xAB; PAGE_BUDGET];
        blob.meta.set_size(PAGE_BUDGET);

        match encode(&blob, &config).unwrap_err() {
            KestrelError::PageBudgetExceeded {
                kind,
                estimated,
                actual,
                budget,
            } => {
                assert_eq!(kind, "TEMP_TABLE");
                assert_eq!(estimated, PAGE_BUDGET);
                assert!(actual > budget);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_compression_lets_repetitive_bodies_fit() {
        let config = StorageConfig::default();
        let mut blob = Blob::vacant();
        blob.payload = vec![0xAB; PAGE_BUDGET * 2];
        assert!(encode(&blob, &config).is_ok());
    }

    #[tokio::test]
    async fn test_upsert_assigns_id_then_overwrites() {
        let engine = engine();
        let mut txn = engine.begin().await.unwrap();

        let mut counter = Counter::vacant();
        let id = upsert(&mut counter, &mut txn).await.unwrap();
        assert_eq!(counter.id(), Some(id));

        counter.value = 41;
        assert_eq!(upsert(&mut counter, &mut txn).await.unwrap(), id);
        txn.commit().await.unwrap();

        let reloaded: Counter = load_for_reads(&engine, id).retrieved().await.unwrap();
        assert_eq!(reloaded.value, 41);
        assert_eq!(reloaded.meta, counter.meta);
    }

    #[tokio::test]
    async fn test_load_for_writes_locks_block() {
        let engine = engine();
        let mut txn = engine.begin().await.unwrap();
        let mut counter = Counter::vacant();
        let id = upsert(&mut counter, &mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = engine.begin().await.unwrap();
        let mut loaded: Counter = load_for_writes(&mut txn, Some(id)).await.unwrap();
        assert!(engine.locks().is_locked(id));
        loaded.value = 5;
        upsert(&mut loaded, &mut txn).await.unwrap();

        // Reads through the transaction see the staged image.
        let own: Counter = load_for_reads(&txn, id).retrieved().await.unwrap();
        assert_eq!(own.value, 5);
        let committed: Counter = load_for_reads(&engine, id).retrieved().await.unwrap();
        assert_eq!(committed.value, 0);

        txn.commit().await.unwrap();
        assert!(!engine.locks().is_locked(id));
    }

    #[tokio::test]
    async fn test_load_for_writes_without_id_is_vacant() {
        let engine = engine();
        let mut txn = engine.begin().await.unwrap();
        let counter: Counter = load_for_writes(&mut txn, None).await.unwrap();
        assert_eq!(counter.id(), None);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_block_at_commit() {
        let engine = engine();
        let mut txn = engine.begin().await.unwrap();
        let mut counter = Counter::vacant();
        let id = upsert(&mut counter, &mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = engine.begin().await.unwrap();
        delete(&counter, &mut txn).unwrap();
        txn.commit().await.unwrap();

        let err = load_for_reads::<Counter, _>(&engine, id)
            .retrieved()
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::BlockNotFound { .. }));
    }
}
