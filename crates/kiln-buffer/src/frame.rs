//! Buffer frame management.

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{RawRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kiln_common::page::{PageId, PAGE_SIZE};

/// Sentinel value indicating no page is loaded in the frame.
const NO_PAGE: u64 = u64::MAX;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the buffer pool holding a single page.
///
/// Each frame carries the page bytes plus two independent protection
/// mechanisms:
///
/// - a **pin count**, owned by the buffer pool, which keeps the frame from
///   being evicted while any caller still references it;
/// - a **page latch**, a short-term read/write lock taken by index
///   operations around their access to the page bytes.
///
/// Holding a latch without a pin is always a bug: the latch only protects
/// the bytes, the pin keeps the bytes in place.
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently stored in this frame (packed as u64, NO_PAGE = none).
    page_id: AtomicU64,
    /// Page data buffer. The pool itself goes through this lock (load,
    /// eviction copy); latch-holding callers go through `data_ptr`.
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    /// Page latch for index operations, held across call boundaries.
    latch: RawRwLock,
    /// Number of users currently referencing this frame.
    pin_count: AtomicU32,
    /// Whether the page has been modified since it was last written out.
    is_dirty: AtomicBool,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(NO_PAGE),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
            latch: RawRwLock::INIT,
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let packed = self.page_id.load(Ordering::Acquire);
        if packed == NO_PAGE {
            None
        } else {
            Some(PageId::from_u64(packed))
        }
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        let packed = page_id.map(|pid| pid.as_u64()).unwrap_or(NO_PAGE);
        self.page_id.store(packed, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count. Returns the previous count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count. Returns the new count.
    ///
    /// A decrement past zero clamps back to zero.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Marks this frame dirty or clean.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Returns true if this frame is empty (no page loaded).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_id.load(Ordering::Acquire) == NO_PAGE
    }

    /// Acquires the page latch in shared (read) mode, blocking.
    #[inline]
    pub fn latch_read(&self) {
        self.latch.lock_shared();
    }

    /// Tries to acquire the page latch in shared mode without blocking.
    /// Returns true on success.
    #[inline]
    pub fn try_latch_read(&self) -> bool {
        self.latch.try_lock_shared()
    }

    /// Releases a shared latch previously acquired with `latch_read` or a
    /// successful `try_latch_read`.
    ///
    /// The calling thread must currently hold the shared latch.
    #[inline]
    pub fn unlatch_read(&self) {
        unsafe { self.latch.unlock_shared() }
    }

    /// Acquires the page latch in exclusive (write) mode, blocking.
    #[inline]
    pub fn latch_write(&self) {
        self.latch.lock_exclusive();
    }

    /// Releases an exclusive latch previously acquired with `latch_write`.
    ///
    /// The calling thread must currently hold the exclusive latch.
    #[inline]
    pub fn unlatch_write(&self) {
        unsafe { self.latch.unlock_exclusive() }
    }

    /// Reads the page data through the pool-side lock.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Writes the page data through the pool-side lock.
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Copies data into the frame.
    #[inline]
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(PAGE_SIZE);
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Returns a raw pointer to the frame's backing buffer.
    ///
    /// # Safety
    ///
    /// The frame must stay pinned for the lifetime of every access through
    /// the returned pointer. Reads additionally require at least the shared
    /// page latch and writes require the exclusive page latch, so that no
    /// access races with another latch holder or with pool-side loads.
    #[inline]
    pub unsafe fn data_ptr(&self) -> *mut u8 {
        unsafe { (*self.data.data_ptr()).as_mut_ptr() }
    }

    /// Resets the frame to empty state.
    #[inline]
    pub fn reset(&self) {
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        let mut data = self.data.write();
        data.fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
