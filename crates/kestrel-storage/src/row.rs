//! Rows of self-describing column values.
//!
//! Every value is written as its [`TypeId`] tag followed by the payload, so a
//! row can hold mixed column types:
//!
//! ```text
//! row:   [count: u16] [value] * count
//! value: [type id: u8] [payload]
//! ```

use std::cmp::Ordering;

use bytes::{BufMut, Bytes, BytesMut};
use kestrel_common::{KestrelError, Result, TypeId};

use crate::codec::{self, Codec};

/// One column value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Binary(Bytes),
}

impl Value {
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Null => TypeId::Null,
            Value::Boolean(_) => TypeId::Boolean,
            Value::Int32(_) => TypeId::Int32,
            Value::Int64(_) => TypeId::Int64,
            Value::Float64(_) => TypeId::Float64,
            Value::Text(_) => TypeId::Text,
            Value::Binary(_) => TypeId::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Nulls sort after every other value. Values of different types order by
/// type tag. Floats use IEEE total order.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (a, b) => (a.type_id() as u8).cmp(&(b.type_id() as u8)),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Binary(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl Codec for Value {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_id() as u8);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.encode(buf),
            Value::Int32(v) => v.encode(buf),
            Value::Int64(v) => v.encode(buf),
            Value::Float64(v) => v.encode(buf),
            Value::Text(v) => v.encode(buf),
            Value::Binary(v) => v.encode(buf),
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let tag = TypeId::try_from(codec::get_u8(buf, "value type")?)?;
        Ok(match tag {
            TypeId::Null => Value::Null,
            TypeId::Boolean => Value::Boolean(bool::decode(buf)?),
            TypeId::Int32 => Value::Int32(i32::decode(buf)?),
            TypeId::Int64 => Value::Int64(i64::decode(buf)?),
            TypeId::Float64 => Value::Float64(f64::decode(buf)?),
            TypeId::Text => Value::Text(String::decode(buf)?),
            TypeId::Binary => Value::Binary(Bytes::decode(buf)?),
        })
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Value::Null => 0,
            Value::Boolean(v) => v.encoded_len(),
            Value::Int32(v) => v.encoded_len(),
            Value::Int64(v) => v.encoded_len(),
            Value::Float64(v) => v.encoded_len(),
            Value::Text(v) => v.encoded_len(),
            Value::Binary(v) => v.encoded_len(),
        }
    }
}

/// An immutable, fixed-arity tuple of values, ordered lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: usize) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy of this row with `column` replaced.
    pub fn with_value(&self, column: usize, value: Value) -> Result<Row> {
        if column >= self.values.len() {
            return Err(KestrelError::InvalidInput(format!(
                "column {column} out of range for row of {}",
                self.values.len()
            )));
        }
        let mut values = self.values.clone();
        values[column] = value;
        Ok(Row { values })
    }

    /// Row made of the given columns, in the given order.
    pub fn project(&self, columns: &[usize]) -> Result<Row> {
        columns
            .iter()
            .map(|&c| {
                self.values.get(c).cloned().ok_or_else(|| {
                    KestrelError::InvalidInput(format!(
                        "column {c} out of range for row of {}",
                        self.values.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Row::new)
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}

impl Codec for Row {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.values.len() as u16);
        for value in &self.values {
            value.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let count = codec::get_u16(buf, "row arity")? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(Value::decode(buf)?);
        }
        Ok(Row { values })
    }

    fn encoded_len(&self) -> usize {
        2 + self.values.iter().map(Codec::encoded_len).sum::<usize>()
    }
}

/// Column metadata carried by tables and indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_id: TypeId,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, type_id: TypeId, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_id,
            nullable,
        }
    }

    /// Checks that `value` may be stored in this column.
    pub fn admits(&self, value: &Value) -> Result<()> {
        match value {
            Value::Null if self.nullable => Ok(()),
            Value::Null => Err(KestrelError::InvalidInput(format!(
                "column {} is not nullable",
                self.name
            ))),
            v if v.type_id() == self.type_id => Ok(()),
            v => Err(KestrelError::InvalidInput(format!(
                "column {} holds {}, got {}",
                self.name,
                self.type_id,
                v.type_id()
            ))),
        }
    }
}

impl Codec for Column {
    fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
        buf.put_u8(self.type_id as u8);
        self.nullable.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        let name = String::decode(buf)?;
        let type_id = TypeId::try_from(codec::get_u8(buf, "column type")?)?;
        let nullable = bool::decode(buf)?;
        Ok(Self {
            name,
            type_id,
            nullable,
        })
    }

    fn encoded_len(&self) -> usize {
        self.name.encoded_len() + 1 + 1
    }
}

/// Most columns a table, index or row may carry; counts are stored as u16.
pub const MAX_COLUMNS: usize = u16::MAX as usize;

/// Fails with `InvalidInput` past [`MAX_COLUMNS`].
pub(crate) fn check_column_count(count: usize) -> Result<()> {
    if count > MAX_COLUMNS {
        return Err(KestrelError::InvalidInput(format!(
            "{count} columns exceed the limit of {MAX_COLUMNS}"
        )));
    }
    Ok(())
}

/// Writes a u16 count followed by each column. Callers check the count
/// with [`check_column_count`] first.
pub(crate) fn encode_columns(columns: &[Column], buf: &mut BytesMut) {
    buf.put_u16_le(columns.len() as u16);
    for column in columns {
        column.encode(buf);
    }
}

pub(crate) fn decode_columns(buf: &mut &[u8]) -> Result<Vec<Column>> {
    let count = codec::get_u16(buf, "column count")? as usize;
    (0..count).map(|_| Column::decode(buf)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: Vec<Value>) -> Row {
        Row::new(values)
    }

    #[test]
    fn test_column_count_limit() {
        assert!(check_column_count(MAX_COLUMNS).is_ok());
        let err = check_column_count(MAX_COLUMNS + 1).unwrap_err();
        assert!(matches!(err, KestrelError::InvalidInput(_)));
    }

    #[test]
    fn test_nulls_sort_last() {
        let mut values = vec![Value::Null, Value::Int64(3), Value::Int64(-1)];
        values.sort();
        assert_eq!(values, vec![Value::Int64(-1), Value::Int64(3), Value::Null]);

        assert!(row(vec![1i64.into(), Value::Null]) > row(vec![1i64.into(), 9i64.into()]));
    }

    #[test]
    fn test_rows_compare_lexicographically() {
        let a = row(vec![1i64.into(), "b".into()]);
        let b = row(vec![1i64.into(), "c".into()]);
        let c = row(vec![2i64.into(), "a".into()]);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_float_total_order() {
        assert!(Value::Float64(-0.0) < Value::Float64(0.0));
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
    }

    #[test]
    fn test_mixed_row_roundtrip() {
        let original = row(vec![
            Value::Null,
            true.into(),
            7i32.into(),
            (-9i64).into(),
            1.5f64.into(),
            "kestrel".into(),
            Value::Binary(Bytes::from_static(b"\x00\x01")),
        ]);
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), original.encoded_len());
        let decoded = Row::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_with_value_leaves_original_untouched() {
        let original = row(vec![1i64.into(), "a".into()]);
        let changed = original.with_value(1, "b".into()).unwrap();
        assert_eq!(original.get(1), Some(&Value::from("a")));
        assert_eq!(changed.get(1), Some(&Value::from("b")));
        assert!(original.with_value(5, Value::Null).is_err());
    }

    #[test]
    fn test_project_picks_columns_in_order() {
        let original = row(vec![1i64.into(), "a".into(), true.into()]);
        let key = original.project(&[2, 0]).unwrap();
        assert_eq!(key, row(vec![true.into(), 1i64.into()]));
        assert!(original.project(&[3]).is_err());
    }

    #[test]
    fn test_column_admits_matching_values() {
        let column = Column::new("age", TypeId::Int32, false);
        assert!(column.admits(&Value::Int32(4)).is_ok());
        assert!(column.admits(&Value::Null).is_err());
        assert!(column.admits(&Value::Int64(4)).is_err());
        assert!(Column::new("note", TypeId::Text, true).admits(&Value::Null).is_ok());
    }

    #[test]
    fn test_unknown_value_tag_is_rejected() {
        let mut slice: &[u8] = &[200];
        assert!(Value::decode(&mut slice).is_err());
    }
}
