//! Record and index-slot identifiers.

use serde::{Deserialize, Serialize};
use kiln_common::page::NO_PAGE;

/// Record identifier: the location of a heap tuple as (page, slot).
///
/// Inside internal B+ tree nodes the same 8-byte shape is reused to store a
/// child page number (the slot half is unused there).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    /// Heap page number.
    pub page_num: u32,
    /// Slot within the page.
    pub slot_num: u32,
}

impl Rid {
    /// Encoded size on disk: two little-endian u32s.
    pub const SIZE: usize = 8;

    /// Creates a new Rid.
    pub fn new(page_num: u32, slot_num: u32) -> Self {
        Self { page_num, slot_num }
    }

    /// Serializes the Rid to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_num.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot_num.to_le_bytes());
        buf
    }

    /// Deserializes a Rid from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            page_num: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            slot_num: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_num, self.slot_num)
    }
}

/// Index slot position: (leaf page, key slot).
///
/// Used by scan cursors to address a position between keys. Not stable
/// across structural modifications of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iid {
    /// Leaf page number.
    pub page_num: u32,
    /// Key slot within the leaf; may equal the key count for one-past-end.
    pub slot_num: u32,
}

impl Iid {
    /// Position in no leaf at all (empty tree).
    pub const INVALID: Iid = Iid {
        page_num: NO_PAGE,
        slot_num: 0,
    };

    /// Creates a new Iid.
    pub fn new(page_num: u32, slot_num: u32) -> Self {
        Self { page_num, slot_num }
    }
}

impl std::fmt::Display for Iid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_num, self.slot_num)
    }
}
