//! Unique secondary index: a [`BTree`] from key row to row id.
//!
//! The key row is projected out of a table row by column position. The
//! header records the key columns, their positions in the table row, and the
//! tree's header block:
//!
//! ```text
//! header body: [column count: u16] [column] * count [position: u16] * count [tree: BlockId]
//! ```

use bytes::{BufMut, BytesMut};
use kestrel_common::{BlockId, KestrelError, Result, RowId, StructureKind};
use kestrel_txn::{BlockSource, Txn};

use crate::btree::BTree;
use crate::codec::{self, Codec};
use crate::persist::{self, Loading, Meta, Persistent};
use crate::row::{self, Column, Row};

type KeyTree = BTree<Row, RowId>;

#[derive(Debug)]
pub struct Index {
    meta: Meta,
    columns: Vec<Column>,
    positions: Vec<u16>,
    tree: BlockId,
}

impl Index {
    /// Creates an empty index over the table columns at `positions`.
    /// `columns[i]` describes the key column taken from `positions[i]`.
    pub async fn create(txn: &mut Txn, columns: Vec<Column>, positions: Vec<usize>) -> Result<Self> {
        if columns.is_empty() || columns.len() != positions.len() {
            return Err(KestrelError::InvalidInput(format!(
                "index needs one position per key column, got {} columns and {} positions",
                columns.len(),
                positions.len()
            )));
        }
        row::check_column_count(columns.len())?;
        let positions = positions
            .into_iter()
            .map(|p| {
                u16::try_from(p).map_err(|_| {
                    KestrelError::InvalidInput(format!("column position {p} out of range"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tree = KeyTree::new(txn.config());
        let tree = persist::upsert(&mut tree, txn).await?;
        let mut index = Self {
            meta: Meta::default(),
            columns,
            positions,
            tree,
        };
        persist::upsert(&mut index, txn).await?;
        Ok(index)
    }

    pub fn open_for_reads<S: BlockSource + ?Sized>(src: &S, id: BlockId) -> Loading<Self> {
        persist::load_for_reads(src, id)
    }

    pub async fn open_for_writes(txn: &mut Txn, id: BlockId) -> Result<Self> {
        persist::load_for_writes(txn, Some(id)).await
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Projects the indexed columns out of a table row.
    pub fn key_of(&self, row: &Row) -> Result<Row> {
        let positions: Vec<usize> = self.positions.iter().map(|&p| p as usize).collect();
        row.project(&positions)
    }

    /// Indexes `row` under `id`. A key already mapped to another row id is
    /// rejected with `AlreadyExists`.
    pub async fn insert(&self, txn: &mut Txn, row: &Row, id: RowId) -> Result<()> {
        let key = self.key_of(row)?;
        self.check_key(&key)?;
        let mut tree = KeyTree::open_for_writes(txn, self.tree).await?;
        match tree.get(&*txn, &key).await? {
            Some(existing) if existing != id => Err(KestrelError::AlreadyExists(format!(
                "index key {key:?} already maps to row {existing}"
            ))),
            Some(_) => Ok(()),
            None => tree.put(txn, key, id).await,
        }
    }

    /// Row id stored under the key row `key`.
    pub async fn lookup<S: BlockSource + ?Sized>(&self, src: &S, key: &Row) -> Result<Option<RowId>> {
        KeyTree::open(src, self.tree).retrieved().await?.get(src, key).await
    }

    /// Removes `key`. Returns whether it was present.
    pub async fn remove(&self, txn: &mut Txn, key: &Row) -> Result<bool> {
        let mut tree = KeyTree::open_for_writes(txn, self.tree).await?;
        tree.delete(txn, key).await
    }

    /// Row ids whose keys lie in `[from, to)`, in key order.
    pub async fn range<S: BlockSource + ?Sized>(
        &self,
        src: &S,
        from: Row,
        to: Row,
    ) -> Result<Vec<RowId>> {
        let tree = KeyTree::open(src, self.tree).retrieved().await?;
        let entries = tree.range(src, from, to).collect().await?;
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    /// Number of live keys.
    pub async fn len<S: BlockSource + ?Sized>(&self, src: &S) -> Result<u64> {
        Ok(KeyTree::open(src, self.tree).retrieved().await?.len())
    }

    /// Deletes the tree and the header.
    pub async fn destroy(self, txn: &mut Txn) -> Result<()> {
        let tree = KeyTree::open_for_writes(txn, self.tree).await?;
        tree.destroy(txn).await?;
        persist::delete(&self, txn)
    }

    fn check_key(&self, key: &Row) -> Result<()> {
        self.columns
            .iter()
            .zip(key.values())
            .try_for_each(|(column, value)| column.admits(value))
    }
}

impl Persistent for Index {
    const KIND: StructureKind = StructureKind::Index;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        row::encode_columns(&self.columns, buf);
        for position in &self.positions {
            buf.put_u16_le(*position);
        }
        self.tree.encode(buf);
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        let columns = row::decode_columns(buf)?;
        let positions = (0..columns.len())
            .map(|_| codec::get_u16(buf, "index position"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            meta: Meta::default(),
            columns,
            positions,
            tree: BlockId::decode(buf)?,
        })
    }

    fn vacant() -> Self {
        Self {
            meta: Meta::default(),
            columns: Vec::new(),
            positions: Vec::new(),
            tree: BlockId(0),
        }
    }
}
