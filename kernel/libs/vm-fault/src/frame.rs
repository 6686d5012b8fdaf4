// SPDX-License-Identifier: MPL-2.0

//! Physical page frames.
//!
//! A [`Frame`] is a cheap handle to one physical page. Besides its contents,
//! a frame carries the bookkeeping the fault engine relies on: a busy state
//! machine that grants short-term exclusive ownership, the identity of its
//! owner, a loan count and a wire count.

use core::fmt;

use crate::{object::VmObject, prelude::*, wait::WaitQueue};

pub type Vaddr = usize;
pub type Paddr = usize;

/// The size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The state of a frame with respect to exclusive ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// The frame is back in the allocator.
    Free,
    /// A thread owns the frame exclusively, typically for I/O or for
    /// installing it. `waiters` counts the threads that asked to be woken up.
    Busy { waiters: u32 },
    /// The frame is resident and nobody holds it busy.
    Ready,
    /// The owner discarded the frame while it was busy. The busy holder must
    /// free it instead of making it ready.
    Released,
}

/// Who holds the contents of a frame.
#[derive(Debug, Clone, Default)]
pub enum FrameOwner {
    /// Nobody, or only borrowers of a loan whose lender dropped the page.
    #[default]
    None,
    /// A backing object, at page index `index`.
    Object {
        object: Weak<VmObject>,
        index: usize,
    },
    /// A private anonymous page.
    Anon,
}

/// The replacement queue a frame sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageQueue {
    #[default]
    None,
    Active,
    Inactive,
}

bitflags! {
    /// Per-frame attribute flags.
    pub struct FrameFlags: u8 {
        /// The page must never be mapped writable.
        const RDONLY = 1 << 0;
        /// The page may differ from the copy in its backing store.
        const DIRTY = 1 << 1;
    }
}

pub(crate) struct FrameMeta {
    pub(crate) state: FrameState,
    pub(crate) owner: FrameOwner,
    pub(crate) loan_count: u32,
    pub(crate) wire_count: u32,
    pub(crate) queue: PageQueue,
    pub(crate) flags: FrameFlags,
}

struct FrameInner {
    paddr: Paddr,
    meta: SpinLock<FrameMeta>,
    data: SpinLock<Box<[u8]>>,
    wait_queue: WaitQueue,
}

/// A handle to a physical page.
///
/// Cloning the handle does not copy the page.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    /// Creates a busy, unowned frame whose bytes are all `fill`.
    pub(crate) fn new(paddr: Paddr, fill: u8) -> Self {
        let meta = FrameMeta {
            state: FrameState::Busy { waiters: 0 },
            owner: FrameOwner::None,
            loan_count: 0,
            wire_count: 0,
            queue: PageQueue::None,
            flags: FrameFlags::empty(),
        };
        Self {
            inner: Arc::new(FrameInner {
                paddr,
                meta: SpinLock::new(meta),
                data: SpinLock::new(vec![fill; PAGE_SIZE].into_boxed_slice()),
                wait_queue: WaitQueue::new(),
            }),
        }
    }

    pub fn paddr(&self) -> Paddr {
        self.inner.paddr
    }

    pub(crate) fn meta(&self) -> SpinLockGuard<'_, FrameMeta> {
        self.inner.meta.lock()
    }

    pub fn state(&self) -> FrameState {
        self.meta().state
    }

    /// Returns whether some thread holds the frame exclusively.
    ///
    /// A released frame is still busy: its holder has not let it go yet.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.meta().state,
            FrameState::Busy { .. } | FrameState::Released
        )
    }

    pub fn is_released(&self) -> bool {
        self.meta().state == FrameState::Released
    }

    /// Takes the frame busy if it is ready.
    pub(crate) fn try_busy(&self) -> bool {
        let mut meta = self.meta();
        if meta.state != FrameState::Ready {
            return false;
        }
        meta.state = FrameState::Busy { waiters: 0 };
        true
    }

    /// Registers the caller as a waiter, returning whether the frame is busy.
    ///
    /// The caller must release its locks and call [`Self::wait_unbusy`] when
    /// this returns `true`.
    pub(crate) fn want(&self) -> bool {
        let mut meta = self.meta();
        match &mut meta.state {
            FrameState::Busy { waiters } => {
                *waiters += 1;
                true
            }
            FrameState::Released => true,
            FrameState::Ready | FrameState::Free => false,
        }
    }

    /// Blocks until the frame stops being busy.
    pub(crate) fn wait_unbusy(&self) {
        self.inner
            .wait_queue
            .wait_until(|| (!self.is_busy()).then_some(()));
    }

    /// Makes a busy frame ready and wakes up its waiters.
    ///
    /// # Panics
    ///
    /// Panics if the frame is not busy, or if it was released; a released
    /// frame must be freed instead.
    pub(crate) fn unbusy(&self) {
        let mut meta = self.meta();
        let FrameState::Busy { waiters } = meta.state else {
            panic!(
                "unbusying frame {:#x} in state {:?}",
                self.paddr(),
                meta.state
            );
        };
        meta.state = FrameState::Ready;
        drop(meta);
        if waiters > 0 {
            self.inner.wait_queue.wake_all();
        }
    }

    /// Marks a busy frame as discarded by its owner.
    ///
    /// Returns `false` if the frame is not busy, in which case the owner
    /// should free it directly.
    pub(crate) fn release(&self) -> bool {
        let mut meta = self.meta();
        if !matches!(meta.state, FrameState::Busy { .. }) {
            return false;
        }
        meta.state = FrameState::Released;
        true
    }

    /// Makes a released frame ready again and leaves it to its borrowers.
    ///
    /// The owner already let go of the frame, so it is left unowned.
    pub(crate) fn orphan(&self) {
        let mut meta = self.meta();
        debug_assert_eq!(meta.state, FrameState::Released);
        debug_assert!(meta.loan_count > 0);
        meta.state = FrameState::Ready;
        meta.owner = FrameOwner::None;
        drop(meta);
        self.inner.wait_queue.wake_all();
    }

    /// Returns the frame to the free state. Called by the allocator.
    pub(crate) fn mark_free(&self) {
        let mut meta = self.meta();
        meta.state = FrameState::Free;
        meta.owner = FrameOwner::None;
        meta.queue = PageQueue::None;
        meta.wire_count = 0;
        drop(meta);
        self.inner.wait_queue.wake_all();
    }

    pub fn owner(&self) -> FrameOwner {
        self.meta().owner.clone()
    }

    pub(crate) fn set_owner(&self, owner: FrameOwner) {
        self.meta().owner = owner;
    }

    /// Returns the object that owns the frame, if it is still alive.
    pub fn owner_object(&self) -> Option<Arc<VmObject>> {
        match &self.meta().owner {
            FrameOwner::Object { object, .. } => object.upgrade(),
            _ => None,
        }
    }

    /// Returns the index of the frame in its owning object.
    pub fn object_index(&self) -> Option<usize> {
        match &self.meta().owner {
            FrameOwner::Object { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_owned_by_anon(&self) -> bool {
        matches!(self.meta().owner, FrameOwner::Anon)
    }

    /// Returns how many private pages borrow this frame.
    pub fn loan_count(&self) -> u32 {
        self.meta().loan_count
    }

    pub(crate) fn add_loan(&self) {
        self.meta().loan_count += 1;
    }

    /// Drops one loan and returns the remaining count.
    pub(crate) fn drop_loan(&self) -> u32 {
        let mut meta = self.meta();
        debug_assert!(meta.loan_count > 0);
        meta.loan_count = meta.loan_count.saturating_sub(1);
        meta.loan_count
    }

    pub fn wire_count(&self) -> u32 {
        self.meta().wire_count
    }

    pub fn queue(&self) -> PageQueue {
        self.meta().queue
    }

    pub fn is_read_only(&self) -> bool {
        self.meta().flags.contains(FrameFlags::RDONLY)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.meta().flags.set(FrameFlags::RDONLY, read_only);
    }

    pub fn is_dirty(&self) -> bool {
        self.meta().flags.contains(FrameFlags::DIRTY)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.meta().flags.set(FrameFlags::DIRTY, dirty);
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the page.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let data = self.inner.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copies `buf` into the page at `offset`.
    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        let mut data = self.inner.data.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    pub fn fill(&self, byte: u8) {
        self.inner.data.lock().fill(byte);
    }

    /// Copies the whole contents of `src` into this frame.
    pub fn copy_from(&self, src: &Frame) {
        if self == src {
            return;
        }
        // Lock in address order so that two opposite copies cannot deadlock.
        let (mut dst_data, src_data) = if self.paddr() < src.paddr() {
            let dst = self.inner.data.lock();
            (dst, src.inner.data.lock())
        } else {
            let src = src.inner.data.lock();
            (self.inner.data.lock(), src)
        };
        dst_data.copy_from_slice(&src_data);
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta();
        f.debug_struct("Frame")
            .field("paddr", &format_args!("{:#x}", self.paddr()))
            .field("state", &meta.state)
            .field("loan_count", &meta.loan_count)
            .field("wire_count", &meta.wire_count)
            .finish()
    }
}
