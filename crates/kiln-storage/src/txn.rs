//! Per-operation transaction state consumed by the index.
//!
//! The index touches exactly two pieces of transaction state: the **latch
//! bag** of pages it still holds write-latched, and the **deferred-delete
//! bag** of pages that must not be deleted until their latches are
//! released. Both are drained in one pass when the operation finishes.

use parking_lot::Mutex;
use kiln_common::page::PageId;

/// Transaction handle passed into every index operation.
///
/// Higher layers hang locks, undo records, and the like off the same
/// object; the index only ever uses the two page bags below.
#[derive(Debug, Default)]
pub struct Transaction {
    /// Pages write-latched by the in-flight index operation, in
    /// acquisition order.
    index_latched_pages: Mutex<Vec<PageId>>,
    /// Pages emptied by a coalesce, awaiting deletion after unlatch.
    index_deleted_pages: Mutex<Vec<PageId>>,
}

impl Transaction {
    /// Creates a fresh transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a write-latched page into the latch bag.
    pub fn append_index_latched_page(&self, page_id: PageId) {
        self.index_latched_pages.lock().push(page_id);
    }

    /// Drains the latch bag, returning pages in acquisition order.
    pub fn take_index_latched_pages(&self) -> Vec<PageId> {
        std::mem::take(&mut *self.index_latched_pages.lock())
    }

    /// Returns how many pages the latch bag currently holds.
    pub fn index_latched_page_count(&self) -> usize {
        self.index_latched_pages.lock().len()
    }

    /// Pushes a page into the deferred-delete bag.
    pub fn append_index_deleted_page(&self, page_id: PageId) {
        self.index_deleted_pages.lock().push(page_id);
    }

    /// Drains the deferred-delete bag.
    pub fn take_index_deleted_pages(&self) -> Vec<PageId> {
        std::mem::take(&mut *self.index_deleted_pages.lock())
    }
}
