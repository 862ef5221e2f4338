//! Buffer pool manager for KilnDB.
//!
//! Caches fixed-size pages in memory frames with pin counting, clock
//! replacement, and per-frame page latches for index concurrency control.

mod frame;
mod page_table;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, EvictedPage};
