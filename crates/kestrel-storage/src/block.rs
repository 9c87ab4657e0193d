//! Size-bounded associative list stored in one page.
//!
//! Entries are kept newest-first: a new key goes to the head, an existing key
//! is overwritten in place. Lookups scan linearly. The encoded size is tracked
//! incrementally so callers can test for room before writing.
//!
//! Body layout:
//! ```text
//! [count: u32] [key, value] * count
//! ```

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use kestrel_common::{IMAGE_HEADER_SIZE, KestrelError, PAGE_BUDGET, Result, StructureKind};

use crate::codec::{self, Codec};
use crate::persist::{Meta, Persistent};

/// Bytes every block spends before its first entry: kind tag, count, framing.
pub const BLOCK_OVERHEAD: usize = 1 + 4 + IMAGE_HEADER_SIZE;

/// A page holding (key, value) pairs.
#[derive(Debug, Clone)]
pub struct Block<K, V> {
    meta: Meta,
    entries: VecDeque<(K, V)>,
}

impl<K, V> Block<K, V>
where
    K: Codec + Eq + Clone,
    V: Codec + Clone,
{
    /// Creates an empty, unwritten block.
    pub fn new() -> Self {
        let mut meta = Meta::default();
        meta.set_size(BLOCK_OVERHEAD);
        Self {
            meta,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated image size including framing.
    pub fn estimated_size(&self) -> usize {
        self.meta.size()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or overwrites `key`. Fails with `PageBudgetExceeded` if the
    /// block would outgrow the page budget.
    pub fn put(&mut self, key: K, value: V) -> Result<()> {
        let projected = self.projected_size(&key, &value);
        if projected > PAGE_BUDGET {
            return Err(KestrelError::PageBudgetExceeded {
                kind: StructureKind::Block.to_string(),
                estimated: self.meta.size(),
                actual: projected,
                budget: PAGE_BUDGET,
            });
        }
        self.write(key, value, projected);
        Ok(())
    }

    /// Fails with `PageBudgetExceeded` if the pair would not fit even in an
    /// empty block.
    pub fn check_fits_alone(key: &K, value: &V) -> Result<()> {
        let alone = BLOCK_OVERHEAD + key.encoded_len() + value.encoded_len();
        if alone > PAGE_BUDGET {
            return Err(KestrelError::PageBudgetExceeded {
                kind: StructureKind::Block.to_string(),
                estimated: BLOCK_OVERHEAD,
                actual: alone,
                budget: PAGE_BUDGET,
            });
        }
        Ok(())
    }

    /// Like [`Block::put`], but reports a full block by returning false.
    pub fn put_if_possible(&mut self, key: &K, value: &V) -> bool {
        let projected = self.projected_size(key, value);
        if projected > PAGE_BUDGET {
            return false;
        }
        self.write(key.clone(), value.clone(), projected);
        true
    }

    /// Removes `key`, returning its value.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let (k, v) = self.entries.remove(pos)?;
        self.meta.shrink(k.encoded_len() + v.encoded_len());
        Some(v)
    }

    /// Entries newest-first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn into_entries(self) -> impl Iterator<Item = (K, V)> {
        self.entries.into_iter()
    }

    fn projected_size(&self, key: &K, value: &V) -> usize {
        let added = key.encoded_len() + value.encoded_len();
        match self.entries.iter().find(|(k, _)| k == key) {
            Some((_, old)) => self.meta.size() + value.encoded_len() - old.encoded_len(),
            None => self.meta.size() + added,
        }
    }

    fn write(&mut self, key: K, value: V, projected: usize) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push_front((key, value)),
        }
        self.meta.set_size(projected);
    }
}

impl<K, V> Default for Block<K, V>
where
    K: Codec + Eq + Clone,
    V: Codec + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Persistent for Block<K, V>
where
    K: Codec + Eq + Clone,
    V: Codec + Clone,
{
    const KIND: StructureKind = StructureKind::Block;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.entries.len() as u32);
        for (k, v) in &self.entries {
            k.encode(buf);
            v.encode(buf);
        }
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        let count = codec::get_u32(buf, "block entry count")? as usize;
        let mut block = Self::new();
        for _ in 0..count {
            let k = K::decode(buf)?;
            let v = V::decode(buf)?;
            block.meta.grow(k.encoded_len() + v.encoded_len());
            block.entries.push_back((k, v));
        }
        Ok(block)
    }

    fn vacant() -> Self {
        Self::new()
    }
}
