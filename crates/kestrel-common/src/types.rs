//! Type tags written into persisted images.

use serde::{Deserialize, Serialize};

use crate::error::KestrelError;

/// Tag byte identifying the concrete structure stored in a page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StructureKind {
    /// Size-bounded associative list.
    Block = 1,
    /// Chained hash table header (bucket array).
    ChainedHash = 2,
    /// B-tree header (root id, height).
    BTree = 3,
    /// One B-tree node, internal or leaf.
    BTreeNode = 4,
    /// Table header.
    Table = 5,
    /// Index header.
    Index = 6,
    /// Disposable table for intermediate results.
    TempTable = 7,
}

impl TryFrom<u8> for StructureKind {
    type Error = KestrelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StructureKind::Block),
            2 => Ok(StructureKind::ChainedHash),
            3 => Ok(StructureKind::BTree),
            4 => Ok(StructureKind::BTreeNode),
            5 => Ok(StructureKind::Table),
            6 => Ok(StructureKind::Index),
            7 => Ok(StructureKind::TempTable),
            other => Err(KestrelError::Codec(format!("unknown structure tag {other}"))),
        }
    }
}

impl std::fmt::Display for StructureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StructureKind::Block => "BLOCK",
            StructureKind::ChainedHash => "CHAINED_HASH",
            StructureKind::BTree => "BTREE",
            StructureKind::BTreeNode => "BTREE_NODE",
            StructureKind::Table => "TABLE",
            StructureKind::Index => "INDEX",
            StructureKind::TempTable => "TEMP_TABLE",
        };
        write!(f, "{name}")
    }
}

/// Identifier of a column value type.
///
/// Written in front of every self-describing value so a row can hold
/// mixed column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    // Null type
    Null = 0,

    // Boolean
    Boolean = 1,

    // Integer types
    Int32 = 12,
    Int64 = 13,

    // Floating point
    Float64 = 31,

    // String
    Text = 52,

    // Binary
    Binary = 62,
}

impl TypeId {
    /// Returns the fixed payload size for this type, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            TypeId::Null => Some(0),
            TypeId::Boolean => Some(1),
            TypeId::Int32 => Some(4),
            TypeId::Int64 | TypeId::Float64 => Some(8),
            TypeId::Text | TypeId::Binary => None,
        }
    }

    /// Returns true if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, TypeId::Int32 | TypeId::Int64 | TypeId::Float64)
    }
}

impl TryFrom<u8> for TypeId {
    type Error = KestrelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TypeId::Null),
            1 => Ok(TypeId::Boolean),
            12 => Ok(TypeId::Int32),
            13 => Ok(TypeId::Int64),
            31 => Ok(TypeId::Float64),
            52 => Ok(TypeId::Text),
            62 => Ok(TypeId::Binary),
            other => Err(KestrelError::Codec(format!("unknown type id {other}"))),
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeId::Null => "NULL",
            TypeId::Boolean => "BOOLEAN",
            TypeId::Int32 => "INT32",
            TypeId::Int64 => "INT64",
            TypeId::Float64 => "FLOAT64",
            TypeId::Text => "TEXT",
            TypeId::Binary => "BINARY",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_kind_tags_are_stable() {
        assert_eq!(StructureKind::Block as u8, 1);
        assert_eq!(StructureKind::ChainedHash as u8, 2);
        assert_eq!(StructureKind::BTree as u8, 3);
        assert_eq!(StructureKind::BTreeNode as u8, 4);
        assert_eq!(StructureKind::Table as u8, 5);
        assert_eq!(StructureKind::Index as u8, 6);
        assert_eq!(StructureKind::TempTable as u8, 7);
    }

    #[test]
    fn test_structure_kind_try_from() {
        for kind in [
            StructureKind::Block,
            StructureKind::ChainedHash,
            StructureKind::BTree,
            StructureKind::BTreeNode,
            StructureKind::Table,
            StructureKind::Index,
            StructureKind::TempTable,
        ] {
            assert_eq!(StructureKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(StructureKind::try_from(0).is_err());
        assert!(StructureKind::try_from(200).is_err());
    }

    #[test]
    fn test_structure_kind_display() {
        assert_eq!(StructureKind::ChainedHash.to_string(), "CHAINED_HASH");
        assert_eq!(StructureKind::TempTable.to_string(), "TEMP_TABLE");
    }

    #[test]
    fn test_type_id_fixed_size() {
        assert_eq!(TypeId::Null.fixed_size(), Some(0));
        assert_eq!(TypeId::Boolean.fixed_size(), Some(1));
        assert_eq!(TypeId::Int32.fixed_size(), Some(4));
        assert_eq!(TypeId::Int64.fixed_size(), Some(8));
        assert_eq!(TypeId::Float64.fixed_size(), Some(8));
        assert_eq!(TypeId::Text.fixed_size(), None);
        assert_eq!(TypeId::Binary.fixed_size(), None);
    }

    #[test]
    fn test_type_id_is_numeric() {
        assert!(TypeId::Int32.is_numeric());
        assert!(TypeId::Float64.is_numeric());
        assert!(!TypeId::Text.is_numeric());
        assert!(!TypeId::Null.is_numeric());
    }

    #[test]
    fn test_type_id_try_from() {
        assert_eq!(TypeId::try_from(52).unwrap(), TypeId::Text);
        assert_eq!(TypeId::try_from(0).unwrap(), TypeId::Null);
        assert!(TypeId::try_from(14).is_err());
    }

    #[test]
    fn test_type_id_display() {
        assert_eq!(TypeId::Int64.to_string(), "INT64");
        assert_eq!(TypeId::Binary.to_string(), "BINARY");
    }
}
