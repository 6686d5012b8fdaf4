// SPDX-License-Identifier: MPL-2.0

use crate::{prelude::*, wait::relax};

/// The physical page allocator used by the fault engine.
///
/// Allocation may fail under memory pressure. The engine then drops its
/// locks and asks [`reclaimable`] whether waiting can help: if so it calls
/// [`wait_for_memory`] and retries the fault, otherwise it fails with
/// `ENOMEM`.
///
/// [`reclaimable`]: FrameAllocator::reclaimable
/// [`wait_for_memory`]: FrameAllocator::wait_for_memory
pub trait FrameAllocator: Send + Sync {
    /// Allocates a busy, unowned frame, zero-filled if `zeroed`.
    fn alloc(&self, zeroed: bool) -> Option<Frame>;

    /// Returns a frame to the allocator.
    ///
    /// The frame must be unmapped and dequeued.
    fn free(&self, frame: Frame);

    /// Finds the frame of a physical address.
    fn lookup(&self, paddr: Paddr) -> Option<Frame>;

    /// Returns whether waiting may make an allocation succeed.
    fn reclaimable(&self) -> bool;

    /// Blocks until memory pressure may have eased.
    fn wait_for_memory(&self);
}

/// The byte pattern of frames allocated without zeroing.
const POISON: u8 = 0x5a;

/// A frame allocator with a fixed number of frames.
///
/// It also lets tests inject transient allocation failures.
pub struct FramePool {
    capacity: usize,
    frames: SpinLock<BTreeMap<Paddr, Frame>>,
    next_paddr: AtomicUsize,
    fail_next: AtomicUsize,
    nr_waits: AtomicUsize,
}

impl FramePool {
    /// Creates a pool that holds up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: SpinLock::new(BTreeMap::new()),
            next_paddr: AtomicUsize::new(PAGE_SIZE),
            fail_next: AtomicUsize::new(0),
            nr_waits: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` allocations fail while memory still looks
    /// reclaimable.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.frames.lock().len()
    }

    /// Returns how many times a caller waited for memory.
    pub fn nr_waits(&self) -> usize {
        self.nr_waits.load(Ordering::Relaxed)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl FrameAllocator for FramePool {
    fn alloc(&self, zeroed: bool) -> Option<Frame> {
        if self.take_injected_failure() {
            trace!("frame pool: injected allocation failure");
            return None;
        }

        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return None;
        }
        let paddr = self.next_paddr.fetch_add(PAGE_SIZE, Ordering::Relaxed);
        let frame = Frame::new(paddr, if zeroed { 0 } else { POISON });
        frames.insert(paddr, frame.clone());
        Some(frame)
    }

    fn free(&self, frame: Frame) {
        debug_assert_eq!(frame.loan_count(), 0);
        frame.mark_free();
        self.frames.lock().remove(&frame.paddr());
    }

    fn lookup(&self, paddr: Paddr) -> Option<Frame> {
        self.frames.lock().get(&paddr).cloned()
    }

    fn reclaimable(&self) -> bool {
        self.in_use() < self.capacity
    }

    fn wait_for_memory(&self) {
        self.nr_waits.fetch_add(1, Ordering::Relaxed);
        relax();
    }
}
