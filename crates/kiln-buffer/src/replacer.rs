//! Clock page replacement for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Clock (second-chance) replacement policy.
///
/// Reference bits are plain atomics so access recording never takes a lock;
/// only the clock hand itself is mutex-protected. Whether a frame is
/// evictable at all is decided by the caller through a predicate (the pool
/// checks the frame's pin count), so the replacer keeps no evictable set of
/// its own.
pub struct ClockReplacer {
    /// Number of frames.
    num_frames: usize,
    /// Reference bit per frame.
    reference_bits: Vec<AtomicBool>,
    /// Current clock hand position.
    clock_hand: Mutex<usize>,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        let reference_bits = (0..num_frames).map(|_| AtomicBool::new(false)).collect();

        Self {
            num_frames,
            reference_bits,
            clock_hand: Mutex::new(0),
        }
    }

    /// Returns the total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_frames
    }

    /// Records that the given frame was accessed, granting it a second
    /// chance on the next clock sweep.
    #[inline]
    pub fn record_access(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.reference_bits[idx].store(true, Ordering::Relaxed);
        }
    }

    /// Forgets a frame's access history (frame left the pool).
    #[inline]
    pub fn remove(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.reference_bits[idx].store(false, Ordering::Relaxed);
        }
    }

    /// Selects a victim frame for eviction.
    ///
    /// `can_evict` tells the replacer which frames are candidates at all
    /// (unpinned, holding a page). Sweeps at most two full rotations: the
    /// first clears reference bits, the second is guaranteed to find an
    /// unreferenced candidate if one exists.
    pub fn evict<F>(&self, can_evict: F) -> Option<FrameId>
    where
        F: Fn(FrameId) -> bool,
    {
        let mut hand = self.clock_hand.lock();

        for _ in 0..(2 * self.num_frames) {
            let idx = *hand;
            *hand = (idx + 1) % self.num_frames;

            let frame_id = FrameId(idx as u32);
            if !can_evict(frame_id) {
                continue;
            }

            if self.reference_bits[idx].swap(false, Ordering::Relaxed) {
                // Second chance: bit was set, cleared now
                continue;
            }
            return Some(frame_id);
        }

        // Concurrent accesses may keep re-setting bits; fall back to the
        // first candidate regardless of its reference bit.
        (0..self.num_frames)
            .map(|idx| FrameId(idx as u32))
            .find(|&fid| can_evict(fid))
    }
}
