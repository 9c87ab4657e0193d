//! Chained hash table of blocks.
//!
//! The table header is a fixed-length array of optional block ids. A key
//! lives in bucket `xxh3(encoded key) % bucket_count`; each bucket is a
//! [`Block`] created on first use. When a bucket cannot take a new pair
//! within the page budget, the table grows by its expansion factor and every
//! live pair is rehashed into fresh buckets. The old buckets are deleted.
//!
//! Header body layout:
//! ```text
//! [expansion: u32] [len: u64] [bucket_count: u32] [bucket: u64] * bucket_count
//! ```
//! A bucket id of 0 marks an empty bucket. The uncompressed header must fit
//! one page, which caps the bucket count at [`MAX_BUCKETS`].

use std::collections::VecDeque;
use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use kestrel_common::{
    BlockId, ErrorCategory, IMAGE_HEADER_SIZE, KestrelError, PAGE_BUDGET, Result, StorageConfig,
    StructureKind,
};
use kestrel_txn::{BlockSource, Txn};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::block::Block;
use crate::codec::{self, Codec};
use crate::persist::{self, Loading, Meta, Persistent};

/// Kind tag, expansion, len and bucket count.
const HEADER_FIXED: usize = 1 + 4 + 8 + 4;

/// Largest bucket count whose header fits a page uncompressed.
pub const MAX_BUCKETS: usize = (PAGE_BUDGET - IMAGE_HEADER_SIZE - HEADER_FIXED) / 8;

fn header_size(buckets: usize) -> usize {
    IMAGE_HEADER_SIZE + HEADER_FIXED + 8 * buckets
}

/// Hash table of (key, value) pairs spread over bucket blocks.
pub struct ChainedHash<K, V> {
    meta: Meta,
    buckets: Vec<Option<BlockId>>,
    len: u64,
    expansion: u32,
    _pairs: PhantomData<fn() -> (K, V)>,
}

impl<K, V> ChainedHash<K, V>
where
    K: Codec + Eq + Clone,
    V: Codec + Clone,
{
    /// Creates an empty, unwritten table sized from `config`.
    pub fn new(config: &StorageConfig) -> Self {
        let mut table = Self::vacant();
        table.initialize(config);
        table
    }

    /// Loads a table for reads.
    pub fn open<S: BlockSource + ?Sized>(src: &S, id: BlockId) -> Loading<Self> {
        persist::load_for_reads(src, id)
    }

    /// Loads a table for writes under `txn`.
    pub async fn open_for_writes(txn: &mut Txn, id: BlockId) -> Result<Self> {
        persist::load_for_writes(txn, Some(id)).await
    }

    /// Number of live pairs.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Inserts or overwrites `key`, growing the table if its bucket is full.
    ///
    /// A pair too large for an empty page, or a bucket that is still full
    /// at [`MAX_BUCKETS`], fails with `PageBudgetExceeded` and leaves the
    /// table unchanged.
    pub async fn put(&mut self, txn: &mut Txn, key: K, value: V) -> Result<()> {
        Block::check_fits_alone(&key, &value)?;
        if self.buckets.is_empty() {
            self.initialize(txn.config());
        }

        loop {
            let index = self.bucket_of(&key);
            let Some(bucket) = self.buckets[index] else {
                let mut block = Block::new();
                block.put(key, value)?;
                let id = persist::upsert(&mut block, txn).await?;
                self.buckets[index] = Some(id);
                self.len += 1;
                persist::upsert(self, txn).await?;
                return Ok(());
            };

            let mut block: Block<K, V> = persist::load_for_writes(txn, Some(bucket)).await?;
            let existed = block.contains(&key);
            if block.put_if_possible(&key, &value) {
                persist::upsert(&mut block, txn).await?;
                if !existed {
                    self.len += 1;
                    persist::upsert(self, txn).await?;
                }
                return Ok(());
            }
            self.resize(txn).await?;
        }
    }

    /// Looks `key` up without taking locks.
    pub async fn get<S: BlockSource + ?Sized>(&self, src: &S, key: &K) -> Result<Option<V>> {
        let Some(bucket) = self.bucket_id(key) else {
            return Ok(None);
        };
        let block: Block<K, V> = persist::load_for_reads(src, bucket).retrieved().await?;
        Ok(block.get(key).cloned())
    }

    pub async fn contains<S: BlockSource + ?Sized>(&self, src: &S, key: &K) -> Result<bool> {
        Ok(self.get(src, key).await?.is_some())
    }

    /// Removes `key`, returning its value. An emptied bucket block is deleted.
    pub async fn delete(&mut self, txn: &mut Txn, key: &K) -> Result<Option<V>> {
        let Some(bucket) = self.bucket_id(key) else {
            return Ok(None);
        };
        let mut block: Block<K, V> = persist::load_for_writes(txn, Some(bucket)).await?;
        let Some(value) = block.delete(key) else {
            return Ok(None);
        };

        if block.is_empty() {
            persist::delete(&block, txn)?;
            let index = self.bucket_of(key);
            self.buckets[index] = None;
        } else {
            persist::upsert(&mut block, txn).await?;
        }
        self.len -= 1;
        persist::upsert(self, txn).await?;
        Ok(Some(value))
    }

    /// Lazy, single-pass iteration over every pair: buckets in index order,
    /// then each bucket newest-first.
    pub fn cursor<'s, S: BlockSource + ?Sized>(&self, src: &'s S) -> HashCursor<'s, S, K, V> {
        HashCursor {
            src,
            pending: self.buckets.iter().flatten().copied().collect(),
            next: None,
            current: VecDeque::new(),
        }
    }

    /// Deletes every bucket block and the header.
    pub fn destroy(self, txn: &mut Txn) -> Result<()> {
        for bucket in self.buckets.iter().flatten() {
            txn.delete(*bucket)?;
        }
        persist::delete(&self, txn)
    }

    fn initialize(&mut self, config: &StorageConfig) {
        self.buckets = vec![None; config.hash_initial_buckets.clamp(1, MAX_BUCKETS)];
        self.expansion = config.hash_expansion_factor as u32;
    }

    fn bucket_of(&self, key: &K) -> usize {
        (xxh3_64(&key.to_bytes()) % self.buckets.len() as u64) as usize
    }

    fn bucket_id(&self, key: &K) -> Option<BlockId> {
        if self.buckets.is_empty() {
            return None;
        }
        self.buckets[self.bucket_of(key)]
    }

    /// Next bucket count after `count`, clamped to [`MAX_BUCKETS`].
    fn grown(&self, count: usize) -> Result<usize> {
        if count >= MAX_BUCKETS {
            return Err(KestrelError::PageBudgetExceeded {
                kind: StructureKind::ChainedHash.to_string(),
                estimated: header_size(count),
                actual: header_size(count.saturating_mul(self.expansion as usize)),
                budget: PAGE_BUDGET,
            });
        }
        Ok(count
            .saturating_mul(self.expansion as usize)
            .min(MAX_BUCKETS))
    }

    /// Grows the bucket array and rehashes every live pair into new blocks.
    async fn resize(&mut self, txn: &mut Txn) -> Result<()> {
        let old_count = self.buckets.len();
        let mut new_count = self.grown(old_count)?;

        let mut pairs = Vec::new();
        for bucket in self.buckets.iter().flatten() {
            let block: Block<K, V> = persist::load_for_reads(&*txn, *bucket).retrieved().await?;
            pairs.extend(block.into_entries());
        }

        let fresh = loop {
            match rehash(&pairs, new_count) {
                Ok(blocks) => break blocks,
                Err(e) if e.category() == ErrorCategory::Capacity => {
                    new_count = self.grown(new_count)?;
                }
                Err(e) => return Err(e),
            }
        };

        for bucket in self.buckets.iter().flatten() {
            txn.delete(*bucket)?;
        }
        let mut buckets = vec![None; new_count];
        for (index, mut block) in fresh {
            buckets[index] = Some(persist::upsert(&mut block, txn).await?);
        }
        self.buckets = buckets;
        persist::upsert(self, txn).await?;

        debug!(
            table = ?self.meta.id(),
            old_buckets = old_count,
            new_buckets = new_count,
            pairs = pairs.len(),
            "hash table resized"
        );
        Ok(())
    }
}

/// Distributes `pairs` over `count` in-memory blocks.
fn rehash<K, V>(pairs: &[(K, V)], count: usize) -> Result<Vec<(usize, Block<K, V>)>>
where
    K: Codec + Eq + Clone,
    V: Codec + Clone,
{
    let mut blocks: Vec<Option<Block<K, V>>> = (0..count).map(|_| None).collect();
    for (key, value) in pairs {
        let index = (xxh3_64(&key.to_bytes()) % count as u64) as usize;
        blocks[index]
            .get_or_insert_with(Block::new)
            .put(key.clone(), value.clone())?;
    }
    Ok(blocks
        .into_iter()
        .enumerate()
        .filter_map(|(i, b)| b.map(|b| (i, b)))
        .collect())
}

impl<K, V> Persistent for ChainedHash<K, V>
where
    K: Codec + Eq + Clone,
    V: Codec + Clone,
{
    const KIND: StructureKind = StructureKind::ChainedHash;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.expansion);
        buf.put_u64_le(self.len);
        buf.put_u32_le(self.buckets.len() as u32);
        for bucket in &self.buckets {
            buf.put_u64_le(bucket.map_or(0, |id| id.0));
        }
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        let expansion = codec::get_u32(buf, "hash expansion")?;
        let len = codec::get_u64(buf, "hash length")?;
        let count = codec::get_u32(buf, "bucket count")? as usize;
        if count > MAX_BUCKETS {
            return Err(KestrelError::Codec(format!(
                "bucket count {count} exceeds {MAX_BUCKETS}"
            )));
        }
        codec::need(buf, count * 8, "bucket array")?;
        let mut buckets = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = codec::get_u64(buf, "bucket")?;
            buckets.push((raw != 0).then_some(BlockId(raw)));
        }
        if count > 0 && expansion < 2 {
            return Err(KestrelError::Codec(format!(
                "hash table expansion factor {expansion} is below 2"
            )));
        }
        Ok(Self {
            meta: Meta::default(),
            buckets,
            len,
            expansion,
            _pairs: PhantomData,
        })
    }

    fn vacant() -> Self {
        Self {
            meta: Meta::default(),
            buckets: Vec::new(),
            len: 0,
            expansion: 0,
            _pairs: PhantomData,
        }
    }
}

/// Single-pass cursor over a [`ChainedHash`].
///
/// The next bucket is fetched while the current one is being consumed.
pub struct HashCursor<'s, S: ?Sized, K, V> {
    src: &'s S,
    pending: VecDeque<BlockId>,
    next: Option<Loading<Block<K, V>>>,
    current: VecDeque<(K, V)>,
}

impl<S, K, V> HashCursor<'_, S, K, V>
where
    S: BlockSource + ?Sized,
    K: Codec + Eq + Clone,
    V: Codec + Clone,
{
    /// Returns the next pair, or None once every bucket has been read.
    pub async fn next(&mut self) -> Result<Option<(K, V)>> {
        loop {
            if let Some(pair) = self.current.pop_front() {
                return Ok(Some(pair));
            }
            let loading = match self.next.take() {
                Some(loading) => loading,
                None => match self.pending.pop_front() {
                    Some(id) => persist::load_for_reads(self.src, id),
                    None => return Ok(None),
                },
            };
            self.next = self
                .pending
                .pop_front()
                .map(|id| persist::load_for_reads(self.src, id));
            let block = loading.retrieved().await?;
            self.current = block.into_entries().collect();
        }
    }

    /// Drains the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        while let Some(pair) = self.next().await? {
            out.push(pair);
        }
        Ok(out)
    }
}
