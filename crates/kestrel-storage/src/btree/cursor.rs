use kestrel_common::{BlockId, Result};
use kestrel_txn::BlockSource;

use super::node::Node;
use crate::codec::Codec;
use crate::persist::{self, Loading};

/// Ordered, single-pass cursor over a key range of a [`BTree`](super::BTree).
///
/// The first call to `next` descends to the leaf holding the lower bound.
/// From there the cursor walks the leaf chain, always fetching the following
/// leaf while the current one is consumed.
pub struct RangeCursor<'s, S: ?Sized, K, V> {
    src: &'s S,
    from: Option<K>,
    to: Option<K>,
    start: Option<(BlockId, u32)>,
    next: Option<Loading<Node<K, V>>>,
    current: std::vec::IntoIter<(K, Option<V>)>,
    done: bool,
}

impl<'s, S, K, V> RangeCursor<'s, S, K, V>
where
    S: BlockSource + ?Sized,
    K: Codec + Ord + Clone,
    V: Codec + Clone,
{
    pub(super) fn new(
        src: &'s S,
        root: Option<BlockId>,
        height: u32,
        from: Option<K>,
        to: Option<K>,
    ) -> Self {
        let empty = matches!((&from, &to), (Some(f), Some(t)) if f >= t);
        Self {
            src,
            from,
            to,
            start: root.map(|id| (id, height)),
            next: None,
            current: Vec::new().into_iter(),
            done: empty,
        }
    }

    /// Returns the next live entry, or None past the end of the range.
    pub async fn next(&mut self) -> Result<Option<(K, V)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some((root, height)) = self.start.take() {
                let leaf = self.descend(root, height).await?;
                self.next = Some(persist::load_for_reads(self.src, leaf));
            }

            for (key, value) in self.current.by_ref() {
                if self.from.as_ref().is_some_and(|from| &key < from) {
                    continue;
                }
                if self.to.as_ref().is_some_and(|to| &key >= to) {
                    self.done = true;
                    return Ok(None);
                }
                if let Some(value) = value {
                    return Ok(Some((key, value)));
                }
            }

            let Some(loading) = self.next.take() else {
                self.done = true;
                return Ok(None);
            };
            let leaf = loading.retrieved().await?;
            self.next = leaf
                .next_leaf()
                .map(|id| persist::load_for_reads(self.src, id));
            self.current = leaf.into_leaf_entries()?.into_iter();
        }
    }

    /// Drains the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Walks internal levels to the leaf where the range starts.
    async fn descend(&self, mut id: BlockId, height: u32) -> Result<BlockId> {
        for _ in 0..height {
            let node: Node<K, V> = persist::load_for_reads(self.src, id).retrieved().await?;
            id = match &self.from {
                Some(from) => node.child_at(node.child_slot(from)?)?,
                None => node.first_child()?,
            };
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use crate::btree::BTree;
    use kestrel_common::StorageConfig;
    use kestrel_store::MemoryStore;
    use kestrel_txn::Engine;
    use std::sync::Arc;

    async fn filled(engine: &Engine, keys: impl Iterator<Item = i64>) -> BTree<i64, String> {
        let mut txn = engine.begin().await.unwrap();
        let mut tree = BTree::with_node_capacity(4).unwrap();
        for k in keys {
            tree.put(&mut txn, k, format!("v{k}")).await.unwrap();
        }
        txn.commit().await.unwrap();
        tree
    }

    fn engine() -> Engine {
        Engine::new(Arc::new(MemoryStore::standalone()), StorageConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let engine = engine();
        let tree = filled(&engine, 0..30).await;

        let keys: Vec<_> = tree
            .range(&engine, 7, 19)
            .collect()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, (7..19).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_range_bounds_between_keys() {
        let engine = engine();
        let tree = filled(&engine, (0..40).map(|k| k * 10)).await;

        let entries = tree.range(&engine, 95, 131).collect().await.unwrap();
        assert_eq!(
            entries,
            vec![
                (100, "v100".to_string()),
                (110, "v110".to_string()),
                (120, "v120".to_string()),
                (130, "v130".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_and_inverted_ranges() {
        let engine = engine();
        let tree = filled(&engine, 0..10).await;
        assert!(tree.range(&engine, 5, 5).collect().await.unwrap().is_empty());
        assert!(tree.range(&engine, 8, 2).collect().await.unwrap().is_empty());
        assert!(tree.range(&engine, 100, 200).collect().await.unwrap().is_empty());

        let empty: BTree<i64, String> = BTree::new(&StorageConfig::default());
        assert!(empty.iter(&engine).collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_iter_crosses_leaf_chain() {
        let engine = engine();
        let tree = filled(&engine, (0..25).rev()).await;
        assert!(tree.height() > 0);

        let mut cursor = tree.iter(&engine);
        let mut seen = Vec::new();
        while let Some((k, v)) = cursor.next().await.unwrap() {
            assert_eq!(v, format!("v{k}"));
            seen.push(k);
        }
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
        assert!(cursor.next().await.unwrap().is_none());
    }
}
