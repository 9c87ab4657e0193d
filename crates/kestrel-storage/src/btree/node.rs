//! B-tree node pages.
//!
//! Body layout:
//! ```text
//! leaf:     [0u8] [count: u32] [key, Option<value>] * count [next: Option<BlockId>]
//! internal: [1u8] [count: u32] [key, child: BlockId] * count
//! ```

use bytes::{BufMut, BytesMut};
use kestrel_common::{BlockId, KestrelError, Result, StructureKind};

use crate::codec::{self, Codec};
use crate::persist::{Meta, Persistent};

const LEAF: u8 = 0;
const INTERNAL: u8 = 1;

#[derive(Debug, Clone)]
pub(crate) enum Entries<K, V> {
    /// Values of deleted keys are `None` (tombstones).
    Leaf {
        entries: Vec<(K, Option<V>)>,
        next: Option<BlockId>,
    },
    /// Each child holds keys from its entry's key up to the next entry's key.
    Internal { entries: Vec<(K, BlockId)> },
}

/// Change in live-entry count caused by a leaf write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiveDelta {
    Added,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone)]
pub(crate) struct Node<K, V> {
    meta: Meta,
    pub(crate) body: Entries<K, V>,
}

impl<K, V> Node<K, V>
where
    K: Codec + Ord + Clone,
    V: Codec + Clone,
{
    pub(crate) fn leaf(entries: Vec<(K, Option<V>)>, next: Option<BlockId>) -> Self {
        Self {
            meta: Meta::default(),
            body: Entries::Leaf { entries, next },
        }
    }

    pub(crate) fn internal(entries: Vec<(K, BlockId)>) -> Self {
        Self {
            meta: Meta::default(),
            body: Entries::Internal { entries },
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.body {
            Entries::Leaf { entries, .. } => entries.len(),
            Entries::Internal { entries } => entries.len(),
        }
    }

    pub(crate) fn first_key(&self) -> Option<&K> {
        match &self.body {
            Entries::Leaf { entries, .. } => entries.first().map(|(k, _)| k),
            Entries::Internal { entries } => entries.first().map(|(k, _)| k),
        }
    }

    pub(crate) fn next_leaf(&self) -> Option<BlockId> {
        match &self.body {
            Entries::Leaf { next, .. } => *next,
            Entries::Internal { .. } => None,
        }
    }

    /// Slot of the child to descend into for `key`: the last `j` such that
    /// `j` is the final slot or `key < entries[j + 1].key`.
    pub(crate) fn child_slot(&self, key: &K) -> Result<usize> {
        let Entries::Internal { entries } = &self.body else {
            return Err(self.shape_error("internal"));
        };
        if entries.is_empty() {
            return Err(self.shape_error("non-empty internal"));
        }
        Ok((0..entries.len())
            .find(|&j| j + 1 == entries.len() || key < &entries[j + 1].0)
            .unwrap_or(entries.len() - 1))
    }

    pub(crate) fn child_at(&self, slot: usize) -> Result<BlockId> {
        match &self.body {
            Entries::Internal { entries } => entries
                .get(slot)
                .map(|(_, child)| *child)
                .ok_or_else(|| self.shape_error("child slot in range")),
            Entries::Leaf { .. } => Err(self.shape_error("internal")),
        }
    }

    /// Leftmost child of an internal node.
    pub(crate) fn first_child(&self) -> Result<BlockId> {
        self.child_at(0)
    }

    /// Exact-match lookup in a leaf. `Some(None)` is a tombstone.
    pub(crate) fn lookup(&self, key: &K) -> Result<Option<Option<&V>>> {
        let Entries::Leaf { entries, .. } = &self.body else {
            return Err(self.shape_error("leaf"));
        };
        Ok(entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| entries[i].1.as_ref()))
    }

    /// Writes `value` for `key` in a leaf, shifting larger keys right.
    ///
    /// A tombstone for a key the leaf has never seen is not stored.
    pub(crate) fn leaf_put(&mut self, key: K, value: Option<V>) -> Result<LiveDelta> {
        let Entries::Leaf { entries, .. } = &mut self.body else {
            return Err(KestrelError::Internal("leaf write on internal node".into()));
        };
        match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(i) => {
                let delta = match (entries[i].1.is_some(), value.is_some()) {
                    (false, true) => LiveDelta::Added,
                    (true, false) => LiveDelta::Removed,
                    _ => LiveDelta::Unchanged,
                };
                entries[i].1 = value;
                Ok(delta)
            }
            Err(_) if value.is_none() => Ok(LiveDelta::Unchanged),
            Err(i) => {
                entries.insert(i, (key, value));
                Ok(LiveDelta::Added)
            }
        }
    }

    /// Inserts a separator at `slot` of an internal node.
    pub(crate) fn internal_insert(&mut self, slot: usize, key: K, child: BlockId) -> Result<()> {
        let Entries::Internal { entries } = &mut self.body else {
            return Err(KestrelError::Internal("separator insert on leaf".into()));
        };
        entries.insert(slot, (key, child));
        Ok(())
    }

    /// Moves the upper half of the entries into a new, unwritten sibling.
    ///
    /// Leaf chaining is left to the caller, which must first give the
    /// sibling an id.
    pub(crate) fn split_off_upper(&mut self) -> Self {
        let half = self.len() / 2;
        match &mut self.body {
            Entries::Leaf { entries, next } => Self::leaf(entries.split_off(half), *next),
            Entries::Internal { entries } => Self::internal(entries.split_off(half)),
        }
    }

    pub(crate) fn set_next_leaf(&mut self, id: Option<BlockId>) {
        if let Entries::Leaf { next, .. } = &mut self.body {
            *next = id;
        }
    }

    pub(crate) fn into_leaf_entries(self) -> Result<Vec<(K, Option<V>)>> {
        match self.body {
            Entries::Leaf { entries, .. } => Ok(entries),
            Entries::Internal { .. } => Err(KestrelError::Internal(
                "leaf entries requested from internal node".into(),
            )),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self.body, Entries::Leaf { .. })
    }

    /// Child ids of an internal node, empty for a leaf.
    pub(crate) fn children(&self) -> Vec<BlockId> {
        match &self.body {
            Entries::Internal { entries } => entries.iter().map(|(_, c)| *c).collect(),
            Entries::Leaf { .. } => Vec::new(),
        }
    }

    fn shape_error(&self, expected: &str) -> KestrelError {
        let reason = format!("expected {expected} B-tree node");
        match self.meta.id() {
            Some(block_id) => KestrelError::BlockCorrupted { block_id, reason },
            None => KestrelError::Internal(reason),
        }
    }
}

impl<K, V> Persistent for Node<K, V>
where
    K: Codec + Ord + Clone,
    V: Codec + Clone,
{
    const KIND: StructureKind = StructureKind::BTreeNode;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match &self.body {
            Entries::Leaf { entries, next } => {
                buf.put_u8(LEAF);
                buf.put_u32_le(entries.len() as u32);
                for (k, v) in entries {
                    k.encode(buf);
                    v.encode(buf);
                }
                next.encode(buf);
            }
            Entries::Internal { entries } => {
                buf.put_u8(INTERNAL);
                buf.put_u32_le(entries.len() as u32);
                for (k, child) in entries {
                    k.encode(buf);
                    child.encode(buf);
                }
            }
        }
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        let shape = codec::get_u8(buf, "node shape")?;
        let count = codec::get_u32(buf, "node entry count")? as usize;
        match shape {
            LEAF => {
                // every leaf entry carries at least its one-byte value tag
                let mut entries = Vec::with_capacity(count.min(buf.len()));
                for _ in 0..count {
                    entries.push((K::decode(buf)?, Option::<V>::decode(buf)?));
                }
                let next = Option::<BlockId>::decode(buf)?;
                Ok(Self::leaf(entries, next))
            }
            INTERNAL => {
                let mut entries = Vec::with_capacity(count.min(buf.len() / 8));
                for _ in 0..count {
                    entries.push((K::decode(buf)?, BlockId::decode(buf)?));
                }
                Ok(Self::internal(entries))
            }
            other => Err(KestrelError::Codec(format!("unknown node shape {other}"))),
        }
    }

    fn vacant() -> Self {
        Self::leaf(Vec::new(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{decode, encode};
    use kestrel_common::StorageConfig;

    fn internal(keys: &[i64]) -> Node<i64, i64> {
        Node::internal(
            keys.iter()
                .enumerate()
                .map(|(i, k)| (*k, BlockId(i as u64 + 10)))
                .collect(),
        )
    }

    #[test]
    fn test_child_slot_picks_last_smaller_separator() {
        let node = internal(&[0, 10, 20]);
        assert_eq!(node.child_slot(&-5).unwrap(), 0);
        assert_eq!(node.child_slot(&0).unwrap(), 0);
        assert_eq!(node.child_slot(&9).unwrap(), 0);
        assert_eq!(node.child_slot(&10).unwrap(), 1);
        assert_eq!(node.child_slot(&19).unwrap(), 1);
        assert_eq!(node.child_slot(&20).unwrap(), 2);
        assert_eq!(node.child_slot(&1000).unwrap(), 2);
    }

    #[test]
    fn test_leaf_put_keeps_keys_sorted() {
        let mut leaf: Node<i64, String> = Node::vacant();
        for k in [5, 1, 3, 4, 2] {
            assert_eq!(leaf.leaf_put(k, Some(k.to_string())).unwrap(), LiveDelta::Added);
        }
        let keys: Vec<_> = leaf
            .clone()
            .into_leaf_entries()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_leaf_put_tracks_live_changes() {
        let mut leaf: Node<i64, i64> = Node::vacant();
        assert_eq!(leaf.leaf_put(1, Some(1)).unwrap(), LiveDelta::Added);
        assert_eq!(leaf.leaf_put(1, Some(2)).unwrap(), LiveDelta::Unchanged);
        assert_eq!(leaf.leaf_put(1, None).unwrap(), LiveDelta::Removed);
        assert_eq!(leaf.lookup(&1).unwrap(), Some(None));
        assert_eq!(leaf.leaf_put(1, Some(3)).unwrap(), LiveDelta::Added);
        assert_eq!(leaf.leaf_put(9, None).unwrap(), LiveDelta::Unchanged);
        assert_eq!(leaf.len(), 1);
    }

    #[test]
    fn test_split_moves_upper_half() {
        let mut leaf: Node<i64, i64> = Node::leaf(
            (0..8).map(|k| (k, Some(k))).collect(),
            Some(BlockId(99)),
        );
        let sibling = leaf.split_off_upper();
        assert_eq!(leaf.len(), 4);
        assert_eq!(sibling.len(), 4);
        assert_eq!(sibling.first_key(), Some(&4));
        assert_eq!(sibling.next_leaf(), Some(BlockId(99)));
    }

    #[test]
    fn test_inflated_entry_count_fails_cleanly() {
        for shape in [LEAF, INTERNAL] {
            let mut body = BytesMut::new();
            body.put_u8(shape);
            body.put_u32_le(u32::MAX);
            body.put_u64_le(7);
            let err = Node::<i64, i64>::decode_body(&mut &body[..]).err().unwrap();
            assert!(matches!(err, KestrelError::Codec(_)), "{err:?}");
        }
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let leaf: Node<i64, i64> = Node::vacant();
        assert!(leaf.child_slot(&1).is_err());
        let node = internal(&[1]);
        assert!(node.lookup(&1).is_err());
    }

    #[test]
    fn test_image_roundtrip_for_both_shapes() {
        let config = StorageConfig::default();

        let leaf: Node<String, i64> = Node::leaf(
            vec![("a".into(), Some(1)), ("b".into(), None)],
            Some(BlockId(4)),
        );
        let restored: Node<String, i64> = decode(BlockId(1), &encode(&leaf, &config).unwrap()).unwrap();
        assert_eq!(restored.lookup(&"a".to_string()).unwrap(), Some(Some(&1)));
        assert_eq!(restored.lookup(&"b".to_string()).unwrap(), Some(None));
        assert_eq!(restored.next_leaf(), Some(BlockId(4)));

        let node = internal(&[3, 6]);
        let restored: Node<i64, i64> = decode(BlockId(2), &encode(&node, &config).unwrap()).unwrap();
        assert!(!restored.is_leaf());
        assert_eq!(restored.children(), vec![BlockId(10), BlockId(11)]);
    }
}
