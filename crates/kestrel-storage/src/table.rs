//! Tables and temporary tables.
//!
//! Both keep their column metadata in a small header page and their rows in
//! a [`ChainedHash`] of row id to row:
//!
//! ```text
//! header body: [column count: u16] [column] * count [rows: BlockId]
//! ```
//!
//! A [`Table`] header never changes after creation. A [`TempTable`] holds
//! intermediate results and may have its whole contents replaced, which
//! repoints its header at a fresh row hash.

use bytes::BytesMut;
use kestrel_common::{BlockId, KestrelError, Result, RowId, StructureKind};
use kestrel_txn::{BlockSource, Txn};

use crate::codec::Codec;
use crate::hash::{ChainedHash, HashCursor};
use crate::persist::{self, Loading, Meta, Persistent};
use crate::row::{self, Column, Row};

type RowMap = ChainedHash<RowId, Row>;

/// Fails unless `row` fits `columns` in arity, types and nullability.
fn check_row(columns: &[Column], row: &Row) -> Result<()> {
    if row.len() != columns.len() {
        return Err(KestrelError::InvalidInput(format!(
            "row has {} values, table has {} columns",
            row.len(),
            columns.len()
        )));
    }
    columns
        .iter()
        .zip(row.values())
        .try_for_each(|(column, value)| column.admits(value))
}

fn check_columns(columns: &[Column]) -> Result<()> {
    if columns.is_empty() {
        return Err(KestrelError::InvalidInput("a table needs at least one column".into()));
    }
    row::check_column_count(columns.len())
}

/// Creates and writes an empty row hash, returning its id.
async fn create_rows(txn: &mut Txn) -> Result<BlockId> {
    let mut rows = RowMap::new(txn.config());
    persist::upsert(&mut rows, txn).await
}

/// Copies rows out of the hash; callers never see stored state directly.
async fn get_row<S: BlockSource + ?Sized>(src: &S, rows: BlockId, id: RowId) -> Result<Option<Row>> {
    RowMap::open(src, rows).retrieved().await?.get(src, &id).await
}

async fn scan_rows<'s, S: BlockSource + ?Sized>(
    src: &'s S,
    rows: BlockId,
) -> Result<HashCursor<'s, S, RowId, Row>> {
    let map = RowMap::open(src, rows).retrieved().await?;
    Ok(map.cursor(src))
}

/// A persistent table of rows keyed by row id.
#[derive(Debug)]
pub struct Table {
    meta: Meta,
    columns: Vec<Column>,
    rows: BlockId,
}

impl Table {
    /// Creates an empty table under `txn`.
    pub async fn create(txn: &mut Txn, columns: Vec<Column>) -> Result<Self> {
        check_columns(&columns)?;
        let rows = create_rows(txn).await?;
        let mut table = Self {
            meta: Meta::default(),
            columns,
            rows,
        };
        persist::upsert(&mut table, txn).await?;
        Ok(table)
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

    /// Validates and stores `row` under a fresh row id.
    pub async fn insert(&self, txn: &mut Txn, row: Row) -> Result<RowId> {
        check_row(&self.columns, &row)?;
        let id = txn.next_row_id()?;
        let mut rows = RowMap::open_for_writes(txn, self.rows).await?;
        rows.put(txn, id, row).await?;
        Ok(id)
    }

    /// Returns a copy of the row stored under `id`.
    pub async fn get<S: BlockSource + ?Sized>(&self, src: &S, id: RowId) -> Result<Option<Row>> {
        get_row(src, self.rows, id).await
    }

    /// Replaces the row under `id`. Returns false if there is none.
    pub async fn update(&self, txn: &mut Txn, id: RowId, row: Row) -> Result<bool> {
        check_row(&self.columns, &row)?;
        let mut rows = RowMap::open_for_writes(txn, self.rows).await?;
        if !rows.contains(&*txn, &id).await? {
            return Ok(false);
        }
        rows.put(txn, id, row).await?;
        Ok(true)
    }

    /// Removes the row under `id`. Returns false if there is none.
    pub async fn delete(&self, txn: &mut Txn, id: RowId) -> Result<bool> {
        let mut rows = RowMap::open_for_writes(txn, self.rows).await?;
        Ok(rows.delete(txn, &id).await?.is_some())
    }

    /// Cursor over every (row id, row) pair, in no particular order.
    pub async fn scan<'s, S: BlockSource + ?Sized>(
        &self,
        src: &'s S,
    ) -> Result<HashCursor<'s, S, RowId, Row>> {
        scan_rows(src, self.rows).await
    }

    /// Number of rows.
    pub async fn len<S: BlockSource + ?Sized>(&self, src: &S) -> Result<u64> {
        Ok(RowMap::open(src, self.rows).retrieved().await?.len())
    }
}

impl Persistent for Table {
    const KIND: StructureKind = StructureKind::Table;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        row::encode_columns(&self.columns, buf);
        self.rows.encode(buf);
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            meta: Meta::default(),
            columns: row::decode_columns(buf)?,
            rows: BlockId::decode(buf)?,
        })
    }

    fn vacant() -> Self {
        Self {
            meta: Meta::default(),
            columns: Vec::new(),
            rows: BlockId(0),
        }
    }
}

/// A disposable table for intermediate results.
#[derive(Debug)]
pub struct TempTable {
    meta: Meta,
    columns: Vec<Column>,
    rows: BlockId,
}

impl TempTable {
    pub async fn create(txn: &mut Txn, columns: Vec<Column>) -> Result<Self> {
        check_columns(&columns)?;
        let rows = create_rows(txn).await?;
        let mut temp = Self {
            meta: Meta::default(),
            columns,
            rows,
        };
        persist::upsert(&mut temp, txn).await?;
        Ok(temp)
    }

    /// Copies every row of `table`, keeping row ids. Rows are read from `src`.
    pub async fn from_table<S: BlockSource + ?Sized>(
        txn: &mut Txn,
        src: &S,
        table: &Table,
    ) -> Result<Self> {
        let temp = Self::create(txn, table.columns().to_vec()).await?;
        let pairs = table.scan(src).await?.collect().await?;
        let mut rows = RowMap::open_for_writes(txn, temp.rows).await?;
        for (id, row) in pairs {
            rows.put(txn, id, row).await?;
        }
        Ok(temp)
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

    pub async fn insert(&self, txn: &mut Txn, row: Row) -> Result<RowId> {
        check_row(&self.columns, &row)?;
        let id = txn.next_row_id()?;
        let mut rows = RowMap::open_for_writes(txn, self.rows).await?;
        rows.put(txn, id, row).await?;
        Ok(id)
    }

    pub async fn get<S: BlockSource + ?Sized>(&self, src: &S, id: RowId) -> Result<Option<Row>> {
        get_row(src, self.rows, id).await
    }

    pub async fn scan<'s, S: BlockSource + ?Sized>(
        &self,
        src: &'s S,
    ) -> Result<HashCursor<'s, S, RowId, Row>> {
        scan_rows(src, self.rows).await
    }

    pub async fn len<S: BlockSource + ?Sized>(&self, src: &S) -> Result<u64> {
        Ok(RowMap::open(src, self.rows).retrieved().await?.len())
    }

    /// Replaces the contents with `rows`, each under a fresh row id.
    ///
    /// Every row is validated before anything is written.
    pub async fn overwrite(&mut self, txn: &mut Txn, rows: Vec<Row>) -> Result<Vec<RowId>> {
        for row in &rows {
            check_row(&self.columns, row)?;
        }
        let old = RowMap::open_for_writes(txn, self.rows).await?;
        old.destroy(txn)?;

        let mut fresh = RowMap::new(txn.config());
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = txn.next_row_id()?;
            fresh.put(txn, id, row).await?;
            ids.push(id);
        }
        self.rows = persist::upsert(&mut fresh, txn).await?;
        persist::upsert(self, txn).await?;
        Ok(ids)
    }

    /// Deletes the rows and the header.
    pub async fn dispose(self, txn: &mut Txn) -> Result<()> {
        let rows = RowMap::open_for_writes(txn, self.rows).await?;
        rows.destroy(txn)?;
        persist::delete(&self, txn)
    }
}

impl Persistent for TempTable {
    const KIND: StructureKind = StructureKind::TempTable;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        row::encode_columns(&self.columns, buf);
        self.rows.encode(buf);
    }

    fn decode_body(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            meta: Meta::default(),
            columns: row::decode_columns(buf)?,
            rows: BlockId::decode(buf)?,
        })
    }

    fn vacant() -> Self {
        Self {
            meta: Meta::default(),
            columns: Vec::new(),
            rows: BlockId(0),
        }
    }
}
