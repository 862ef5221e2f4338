//! Column type identifiers for KilnDB index keys.

use serde::{Deserialize, Serialize};

/// Identifier for the data types an index key column may hold.
///
/// Index keys are fixed-width composite byte strings; every column type has
/// a fixed on-disk width, with `Char` carrying an explicit declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    /// 32-bit signed integer.
    Int = 0,
    /// 64-bit IEEE-754 double. NaN is rejected before keys are built.
    Float = 1,
    /// Fixed-length byte string, compared lexicographically.
    Char = 2,
    /// 64-bit signed integer.
    BigInt = 3,
    /// Packed calendar timestamp, stored as an order-preserving u64.
    Datetime = 4,
}

impl ColumnType {
    /// Returns the fixed byte width for this type, or None for `Char`,
    /// whose width comes from the column declaration.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnType::Int => Some(4),
            ColumnType::Float => Some(8),
            ColumnType::BigInt => Some(8),
            ColumnType::Datetime => Some(8),
            ColumnType::Char => None,
        }
    }

    /// Returns true if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Int | ColumnType::Float | ColumnType::BigInt
        )
    }

    /// Decodes a type from its on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ColumnType::Int),
            1 => Some(ColumnType::Float),
            2 => Some(ColumnType::Char),
            3 => Some(ColumnType::BigInt),
            4 => Some(ColumnType::Datetime),
            _ => None,
        }
    }
}
