//! Page-resident B-tree with linked leaves.
//!
//! ```text
//!                 [root: internal, height 2]
//!                /                          \
//!        [internal]                        [internal]
//!       /     |    \                      /     |    \
//!  [leaf] → [leaf] → [leaf]    →    [leaf] → [leaf] → [leaf] → None
//! ```
//!
//! The tree header holds the root node id, the height (0 when the root is a
//! leaf), the node capacity and the live-entry count. Every node is one page.
//! A node that reaches capacity splits its upper half into a new sibling; the
//! sibling's first key is inserted into the parent as a separator. A split of
//! the root grows a new root above both halves.
//!
//! Deletes write tombstones. Space is never reclaimed and nodes never merge.
//!
//! Header body layout:
//! ```text
//! [capacity: u32] [height: u32] [len: u64] [root: Option<BlockId>]
//! ```

mod cursor;
mod node;

use std::collections::VecDeque;
use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use kestrel_common::{BlockId, KestrelError, Result, StorageConfig, StructureKind};
use kestrel_txn::{BlockSource, Txn};
use tracing::debug;

use crate::codec::{self, Codec};
use crate::persist::{self, Loading, Meta, Persistent};

pub use cursor::RangeCursor;
use node::{LiveDelta, Node};

/// Result of splitting one node: its new left half starts at `left_first`,
/// the new right sibling at `separator`.
struct Split<K> {
    left_first: K,
    separator: K,
    sibling: BlockId,
}

/// Ordered map from `K` to `V` stored as a tree of pages.
pub struct BTree<K, V> {
    meta: Meta,
    root: Option<BlockId>,
    height: u32,
    capacity: u32,
    len: u64,
    _pairs: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BTree<K, V>
where
    K: Codec + Ord + Clone,
    V: Codec + Clone,
{
    /// Creates an empty, unwritten tree with the configured node capacity.
    pub fn new(config: &StorageConfig) -> Self {
        Self::empty(config.btree_node_capacity as u32)
    }

    /// Creates an empty tree whose nodes split at `capacity` entries.
    pub fn with_node_capacity(capacity: usize) -> Result<Self> {
        if capacity < 4 || capacity % 2 != 0 {
            return Err(KestrelError::InvalidParameter {
                name: "btree_node_capacity".into(),
                value: capacity.to_string(),
            });
        }
        Ok(Self::empty(capacity as u32))
    }

    /// Loads a tree header for reads.
    pub fn open<S: BlockSource + ?Sized>(src: &S, id: BlockId) -> Loading<Self> {
        persist::load_for_reads(src, id)
    }

    /// Loads a tree header for writes under `txn`.
    pub async fn open_for_writes(txn: &mut Txn, id: BlockId) -> Result<Self> {
        persist::load_for_writes(txn, Some(id)).await
    }

    /// Levels above the leaves; 0 when the root is a leaf.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of live (non-tombstoned) entries.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node_capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Inserts or overwrites `key`.
    pub async fn put(&mut self, txn: &mut Txn, key: K, value: V) -> Result<()> {
        self.write(txn, key, Some(value)).await.map(|_| ())
    }

    /// Tombstones `key`. Returns whether a live entry was removed.
    pub async fn delete(&mut self, txn: &mut Txn, key: &K) -> Result<bool> {
        if self.root.is_none() {
            return Ok(false);
        }
        let delta = self.write(txn, key.clone(), None).await?;
        Ok(delta == LiveDelta::Removed)
    }

    /// Exact-match lookup without taking locks.
    pub async fn get<S: BlockSource + ?Sized>(&self, src: &S, key: &K) -> Result<Option<V>> {
        let Some(mut id) = self.root else {
            return Ok(None);
        };
        for _ in 0..self.height {
            let node: Node<K, V> = persist::load_for_reads(src, id).retrieved().await?;
            id = node.child_at(node.child_slot(key)?)?;
        }
        let leaf: Node<K, V> = persist::load_for_reads(src, id).retrieved().await?;
        Ok(leaf.lookup(key)?.flatten().cloned())
    }

    /// Every live entry in key order.
    pub fn iter<'s, S: BlockSource + ?Sized>(&self, src: &'s S) -> RangeCursor<'s, S, K, V> {
        RangeCursor::new(src, self.root, self.height, None, None)
    }

    /// Live entries with `from <= key < to`, in key order.
    pub fn range<'s, S: BlockSource + ?Sized>(
        &self,
        src: &'s S,
        from: K,
        to: K,
    ) -> RangeCursor<'s, S, K, V> {
        RangeCursor::new(src, self.root, self.height, Some(from), Some(to))
    }

    /// Deletes every node and the header.
    pub async fn destroy(self, txn: &mut Txn) -> Result<()> {
        let mut pending: VecDeque<BlockId> = self.root.into_iter().collect();
        while let Some(id) = pending.pop_front() {
            let node: Node<K, V> = persist::load_for_reads(&*txn, id).retrieved().await?;
            pending.extend(node.children());
            txn.delete(id)?;
        }
        persist::delete(&self, txn)
    }

    fn empty(capacity: u32) -> Self {
        Self {
            meta: Meta::default(),
            root: None,
            height: 0,
            capacity,
            len: 0,
            _pairs: PhantomData,
        }
    }

    /// Writes `value` (or a tombstone) at `key`, splitting nodes on the way
    /// back up as they fill.
    async fn write(&mut self, txn: &mut Txn, key: K, value: Option<V>) -> Result<LiveDelta> {
        let Some(root) = self.root else {
            if value.is_none() {
                return Ok(LiveDelta::Unchanged);
            }
            let mut leaf = Node::leaf(vec![(key, value)], None);
            self.root = Some(persist::upsert(&mut leaf, txn).await?);
            self.len = 1;
            persist::upsert(self, txn).await?;
            return Ok(LiveDelta::Added);
        };

        let mut path: Vec<(Node<K, V>, usize)> = Vec::with_capacity(self.height as usize);
        let mut node: Node<K, V> = persist::load_for_writes(txn, Some(root)).await?;
        for _ in 0..self.height {
            let slot = node.child_slot(&key)?;
            let child = node.child_at(slot)?;
            path.push((node, slot));
            node = persist::load_for_writes(txn, Some(child)).await?;
        }

        let delta = node.leaf_put(key, value)?;
        let mut carry = self.split_if_full(txn, &mut node).await?;
        persist::upsert(&mut node, txn).await?;

        while let Some(split) = carry.take() {
            let Some((mut parent, slot)) = path.pop() else {
                self.grow_root(txn, root, split).await?;
                break;
            };
            parent.internal_insert(slot + 1, split.separator, split.sibling)?;
            carry = self.split_if_full(txn, &mut parent).await?;
            persist::upsert(&mut parent, txn).await?;
        }

        match delta {
            LiveDelta::Added => self.len += 1,
            LiveDelta::Removed => self.len -= 1,
            LiveDelta::Unchanged => {}
        }
        persist::upsert(self, txn).await?;
        Ok(delta)
    }

    /// Splits `node` if it has reached capacity. The new sibling is written
    /// immediately; `node` is left for the caller to write.
    async fn split_if_full(&self, txn: &mut Txn, node: &mut Node<K, V>) -> Result<Option<Split<K>>> {
        if node.len() < self.capacity as usize {
            return Ok(None);
        }
        let mut sibling = node.split_off_upper();
        let sibling_id = persist::upsert(&mut sibling, txn).await?;
        if node.is_leaf() {
            node.set_next_leaf(Some(sibling_id));
        }
        let (Some(left_first), Some(separator)) = (node.first_key(), sibling.first_key()) else {
            return Err(KestrelError::Internal("split produced an empty node".into()));
        };
        Ok(Some(Split {
            left_first: left_first.clone(),
            separator: separator.clone(),
            sibling: sibling_id,
        }))
    }

    async fn grow_root(&mut self, txn: &mut Txn, old_root: BlockId, split: Split<K>) -> Result<()> {
        let mut root = Node::<K, V>::internal(vec![
            (split.left_first, old_root),
            (split.separator, split.sibling),
        ]);
        self.root = Some(persist::upsert(&mut root, txn).await?);
        self.height += 1;
        debug!(tree = ?self.meta.id(), height = self.height, "B-tree root split");
        Ok(())
    }
}

impl<K, V> Persistent for BTree<K, V>
where
    K: Codec + Ord + Clone,
    V: Codec + Clone,
{
    const KIND: StructureKind = StructureKind::BTree;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.capacity);
        buf.put_u32_le(self.height);
        buf.put_u64_le(self.len);
        self.root.encode(buf);
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        let capacity = codec::get_u32(buf, "node capacity")?;
        let height = codec::get_u32(buf, "tree height")?;
        let len = codec::get_u64(buf, "tree length")?;
        let root = Option::<BlockId>::decode(buf)?;
        if capacity < 4 || capacity % 2 != 0 {
            return Err(KestrelError::Codec(format!(
                "B-tree node capacity {capacity} is not an even number of at least 4"
            )));
        }
        Ok(Self {
            meta: Meta::default(),
            root,
            height,
            capacity,
            len,
            _pairs: PhantomData,
        })
    }

    fn vacant() -> Self {
        Self::empty(StorageConfig::default().btree_node_capacity as u32)
    }
}
