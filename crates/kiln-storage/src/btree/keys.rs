//! Composite index key schema and comparison.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use kiln_common::types::ColumnType;
use kiln_common::{KilnError, Result};

/// One column of an index key: its type and on-disk width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column type.
    pub ty: ColumnType,
    /// Width in bytes. For fixed-size types this equals the type width;
    /// for `Char` it is the declared length.
    pub len: u16,
}

impl ColumnSpec {
    /// A 32-bit signed integer column.
    pub fn int() -> Self {
        Self {
            ty: ColumnType::Int,
            len: 4,
        }
    }

    /// A 64-bit float column.
    pub fn float() -> Self {
        Self {
            ty: ColumnType::Float,
            len: 8,
        }
    }

    /// A fixed-length byte-string column.
    pub fn char(len: u16) -> Self {
        Self {
            ty: ColumnType::Char,
            len,
        }
    }

    /// A 64-bit signed integer column.
    pub fn big_int() -> Self {
        Self {
            ty: ColumnType::BigInt,
            len: 8,
        }
    }

    /// A packed timestamp column.
    pub fn datetime() -> Self {
        Self {
            ty: ColumnType::Datetime,
            len: 8,
        }
    }
}

/// The key schema of one index: an ordered list of columns, fixed at index
/// creation.
///
/// Keys are the concatenation of their column encodings, so every key of an
/// index has the same total length. All structural decisions in the tree
/// route through [`KeySchema::compare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    columns: Vec<ColumnSpec>,
    key_len: usize,
}

impl KeySchema {
    /// Builds a schema from column declarations.
    ///
    /// Rejects empty schemas, zero-length `Char` columns, and width
    /// mismatches on fixed-size types.
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self> {
        if columns.is_empty() {
            return Err(KilnError::InvalidParameter {
                name: "columns".to_string(),
                value: "empty".to_string(),
            });
        }
        for col in &columns {
            match col.ty.fixed_size() {
                Some(size) if size != col.len as usize => {
                    return Err(KilnError::InvalidParameter {
                        name: format!("{:?} column length", col.ty),
                        value: col.len.to_string(),
                    });
                }
                None if col.len == 0 => {
                    return Err(KilnError::InvalidParameter {
                        name: "Char column length".to_string(),
                        value: "0".to_string(),
                    });
                }
                _ => {}
            }
        }
        let key_len = columns.iter().map(|c| c.len as usize).sum();
        Ok(Self { columns, key_len })
    }

    /// Returns the column declarations.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Returns the total key length in bytes.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Compares two composite keys column by column in declaration order.
    ///
    /// Total and deterministic: integers compare as signed values, floats
    /// through `total_cmp` (NaN never reaches the index), byte strings
    /// lexicographically, timestamps as packed unsigned values.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        debug_assert_eq!(a.len(), self.key_len);
        debug_assert_eq!(b.len(), self.key_len);

        let mut off = 0;
        for col in &self.columns {
            let len = col.len as usize;
            let ca = &a[off..off + len];
            let cb = &b[off..off + len];

            let ord = match col.ty {
                ColumnType::Int => {
                    let va = i32::from_le_bytes([ca[0], ca[1], ca[2], ca[3]]);
                    let vb = i32::from_le_bytes([cb[0], cb[1], cb[2], cb[3]]);
                    va.cmp(&vb)
                }
                ColumnType::Float => {
                    let va =
                        f64::from_le_bytes([ca[0], ca[1], ca[2], ca[3], ca[4], ca[5], ca[6], ca[7]]);
                    let vb =
                        f64::from_le_bytes([cb[0], cb[1], cb[2], cb[3], cb[4], cb[5], cb[6], cb[7]]);
                    va.total_cmp(&vb)
                }
                ColumnType::Char => ca.cmp(cb),
                ColumnType::BigInt => {
                    let va =
                        i64::from_le_bytes([ca[0], ca[1], ca[2], ca[3], ca[4], ca[5], ca[6], ca[7]]);
                    let vb =
                        i64::from_le_bytes([cb[0], cb[1], cb[2], cb[3], cb[4], cb[5], cb[6], cb[7]]);
                    va.cmp(&vb)
                }
                ColumnType::Datetime => {
                    let va =
                        u64::from_le_bytes([ca[0], ca[1], ca[2], ca[3], ca[4], ca[5], ca[6], ca[7]]);
                    let vb =
                        u64::from_le_bytes([cb[0], cb[1], cb[2], cb[3], cb[4], cb[5], cb[6], cb[7]]);
                    va.cmp(&vb)
                }
            };

            if ord != Ordering::Equal {
                return ord;
            }
            off += len;
        }
        Ordering::Equal
    }
}
