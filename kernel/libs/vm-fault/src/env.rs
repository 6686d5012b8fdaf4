// SPDX-License-Identifier: MPL-2.0

//! The machine-wide context shared by every address space.

use crate::{
    advice::{Advice, AdviceWindow, DEFAULT_WINDOWS},
    anon::AnonPage,
    frame::FrameOwner,
    mmu::{AsId, Mmu},
    pool::FrameAllocator,
    prelude::*,
    queue::PageQueues,
    stats::{self, FaultStats},
    store::BackingStore,
    wait::relax,
};

/// The default number of relax rounds after a transient backing store failure.
const DEFAULT_BACKOFF_SPINS: usize = 64;

/// The collaborators and tunables of the fault engine.
///
/// Created with [`VmEnvOptions`] and shared by every [`AddressSpace`],
/// [`AnonLayer`] and [`VmObject`] built on it.
///
/// [`AddressSpace`]: crate::AddressSpace
/// [`AnonLayer`]: crate::AnonLayer
/// [`VmObject`]: crate::VmObject
pub struct VmEnv {
    allocator: Arc<dyn FrameAllocator>,
    mmu: Arc<dyn Mmu>,
    swap: Option<Arc<dyn BackingStore>>,
    queues: PageQueues,
    stats: FaultStats,
    windows: [AdviceWindow; 3],
    anon_limit: Option<usize>,
    backoff_spins: usize,
    live_anons: AtomicUsize,
    next_asid: AtomicUsize,
}

impl VmEnv {
    pub fn allocator(&self) -> &dyn FrameAllocator {
        &*self.allocator
    }

    pub fn mmu(&self) -> &dyn Mmu {
        &*self.mmu
    }

    pub fn queues(&self) -> &PageQueues {
        &self.queues
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    pub fn advice_window(&self, advice: Advice) -> AdviceWindow {
        self.windows[advice.index()]
    }

    /// Returns the number of private pages alive, spare ones included.
    pub fn live_anons(&self) -> usize {
        self.live_anons.load(Ordering::Relaxed)
    }

    pub(crate) fn alloc_asid(&self) -> AsId {
        self.next_asid.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates an empty private page holding one reference.
    pub(crate) fn alloc_anon(&self) -> Option<AnonPage> {
        let limit = self.anon_limit.unwrap_or(usize::MAX);
        self.live_anons
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        Some(AnonPage::new())
    }

    /// Frees a private page whose last reference is gone, with its frame and
    /// swap slot.
    pub(crate) fn free_anon(&self, mut anon: AnonPage) {
        debug_assert_eq!(anon.refs(), 0);
        if let Some(frame) = anon.take_page() {
            self.drop_anon_frame(frame);
        }
        if let Some(slot) = anon.take_swap_slot() {
            self.release_swap(slot);
        }
        self.live_anons.fetch_sub(1, Ordering::Relaxed);
    }

    /// Gives back a spare private page that a fault never used.
    pub(crate) fn release_spare_anon(&self, mut anon: AnonPage) {
        let refs = anon.drop_ref();
        assert_eq!(refs, 0, "a spare private page must not be referenced");
        self.free_anon(anon);
    }

    fn drop_anon_frame(&self, frame: Frame) {
        if frame.loan_count() > 0 {
            // The frame was borrowed from an object. It stays with the object,
            // unless the object already let go of it.
            let left = frame.drop_loan();
            if left > 0 || !matches!(frame.owner(), FrameOwner::None) {
                return;
            }
        }
        self.mmu.page_protect(&frame, VmPerms::empty());
        self.free_frame(frame);
    }

    /// Dequeues a frame and returns it to the allocator.
    pub(crate) fn free_frame(&self, frame: Frame) {
        self.queues.remove(&frame);
        self.allocator.free(frame);
    }

    /// Reads a swapped-out private page back into `frame`.
    pub(crate) fn swap_in(&self, slot: usize, frame: &Frame) -> Result<()> {
        let Some(swap) = &self.swap else {
            return_errno_with_message!(
                Errno::EIO,
                "the private page is swapped but there is no swap store"
            );
        };
        if slot == SWAP_SLOT_BAD {
            return_errno_with_message!(Errno::EIO, "the swap slot went bad");
        }
        swap.fetch(slot, frame)
    }

    pub(crate) fn mark_swap_bad(&self, slot: usize) {
        if slot == SWAP_SLOT_BAD {
            return;
        }
        if let Some(swap) = &self.swap {
            swap.mark_bad(slot);
        }
    }

    pub(crate) fn release_swap(&self, slot: usize) {
        if slot == SWAP_SLOT_BAD {
            return;
        }
        if let Some(swap) = &self.swap {
            swap.release(slot);
        }
    }

    /// Waits for memory after an allocation failed with every lock dropped.
    ///
    /// Fails with `ENOMEM` if the allocator has nothing left to reclaim.
    pub(crate) fn wait_for_memory(&self) -> Result<()> {
        if !self.allocator.reclaimable() {
            return_errno_with_message!(Errno::ENOMEM, "out of memory and nothing to reclaim");
        }
        stats::inc(&self.stats.no_ram);
        self.allocator.wait_for_memory();
        Ok(())
    }

    /// Backs off after a backing store reported a transient failure.
    pub(crate) fn backoff(&self) {
        for _ in 0..self.backoff_spins {
            relax();
        }
    }
}

/// The swap slot of a private page whose stored copy is lost.
pub(crate) const SWAP_SLOT_BAD: usize = usize::MAX;

/// Options for building a [`VmEnv`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use vm_fault::{Advice, FramePool, SoftMmu, VmEnvOptions};
///
/// let env = VmEnvOptions::new(Arc::new(FramePool::new(16)), Arc::new(SoftMmu::new()))
///     .advice_window(Advice::Normal, 1, 2)
///     .anon_limit(128)
///     .build()
///     .unwrap();
/// assert_eq!(env.advice_window(Advice::Normal).nforw, 2);
/// ```
pub struct VmEnvOptions {
    allocator: Arc<dyn FrameAllocator>,
    mmu: Arc<dyn Mmu>,
    swap: Option<Arc<dyn BackingStore>>,
    windows: [AdviceWindow; 3],
    anon_limit: Option<usize>,
    backoff_spins: usize,
}

impl VmEnvOptions {
    /// Creates default options around the two mandatory collaborators.
    pub fn new(allocator: Arc<dyn FrameAllocator>, mmu: Arc<dyn Mmu>) -> Self {
        Self {
            allocator,
            mmu,
            swap: None,
            windows: DEFAULT_WINDOWS,
            anon_limit: None,
            backoff_spins: DEFAULT_BACKOFF_SPINS,
        }
    }

    /// Sets the store that swapped-out private pages are read from.
    pub fn swap(mut self, swap: Arc<dyn BackingStore>) -> Self {
        self.swap = Some(swap);
        self
    }

    /// Sets the neighbor window of an access pattern.
    pub fn advice_window(mut self, advice: Advice, nback: usize, nforw: usize) -> Self {
        self.windows[advice.index()] = AdviceWindow::new(nback, nforw);
        self
    }

    /// Limits the number of private pages that may exist at once.
    pub fn anon_limit(mut self, limit: usize) -> Self {
        self.anon_limit = Some(limit);
        self
    }

    /// Sets how long a fault backs off after a transient store failure.
    pub fn backoff_spins(mut self, spins: usize) -> Self {
        self.backoff_spins = spins;
        self
    }

    pub fn build(self) -> Result<Arc<VmEnv>> {
        if !self.windows.iter().all(AdviceWindow::is_valid) {
            return_errno_with_message!(Errno::EINVAL, "a neighbor window exceeds the maximum");
        }

        Ok(Arc::new(VmEnv {
            allocator: self.allocator,
            mmu: self.mmu,
            swap: self.swap,
            queues: PageQueues::new(),
            stats: FaultStats::new(),
            windows: self.windows,
            anon_limit: self.anon_limit,
            backoff_spins: self.backoff_spins,
            live_anons: AtomicUsize::new(0),
            next_asid: AtomicUsize::new(1),
        }))
    }
}
