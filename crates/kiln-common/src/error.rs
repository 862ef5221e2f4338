//! Error types for KilnDB.

use thiserror::Error;

/// Result type alias using KilnError.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Errors that can occur in KilnDB storage operations.
#[derive(Debug, Error)]
pub enum KilnError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Buffer pool errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u64 },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    // B+ tree errors
    #[error("Bad slot {pos} in node with {num_keys} keys")]
    BadSlot { pos: usize, num_keys: usize },

    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
