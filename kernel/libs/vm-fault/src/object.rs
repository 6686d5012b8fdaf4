// SPDX-License-Identifier: MPL-2.0

//! Backing objects.

use smallvec::SmallVec;

use crate::{
    advice::MAX_WINDOW,
    env::VmEnv,
    frame::{FrameOwner, FrameState},
    prelude::*,
    stats::inc,
    store::{BackingStore, ZeroStore},
};

bitflags! {
    /// Attributes of a [`VmObject`].
    pub struct ObjectFlags: u32 {
        /// Write faults must reach the object before its pages may be mapped
        /// writable, e.g. to track dirty pages.
        const NEEDS_WRITEFAULT = 1 << 0;
        /// The object holds anonymous memory; its backing store is swap.
        const ANONYMOUS        = 1 << 1;
    }
}

/// A shared provider of pages, such as a file or a shared anonymous segment.
///
/// Resident pages are kept in a table indexed by page index. Missing pages
/// are read from the object's [`BackingStore`], which may block.
///
/// A page of an object may be lent to private pages of anonymous layers
/// (see [`loan_to_anon`]). A lent page stays in the object's table until the
/// loan is broken or the object discards it.
///
/// [`loan_to_anon`]: crate::loan_to_anon
pub struct VmObject {
    pages: SpinLock<BTreeMap<usize, Frame>>,
    store: Arc<dyn BackingStore>,
    flags: ObjectFlags,
    /// Whether a write fault reached the object since it was last cleaned.
    written: AtomicBool,
    env: Arc<VmEnv>,
    weak_self: Weak<VmObject>,
}

impl VmObject {
    pub fn new(env: &Arc<VmEnv>, store: Arc<dyn BackingStore>, flags: ObjectFlags) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            pages: SpinLock::new(BTreeMap::new()),
            store,
            flags,
            written: AtomicBool::new(false),
            env: env.clone(),
            weak_self: weak_self.clone(),
        })
    }

    /// Creates an anonymous object whose pages start zero-filled.
    pub fn new_anonymous(env: &Arc<VmEnv>) -> Arc<Self> {
        Self::new(env, Arc::new(ZeroStore), ObjectFlags::ANONYMOUS)
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub(crate) fn lock(&self) -> ObjectGuard<'_> {
        ObjectGuard {
            object: self,
            pages: self.pages.lock(),
        }
    }

    /// Returns whether the lock of the object is held.
    pub fn is_locked(&self) -> bool {
        self.pages.is_locked()
    }

    /// Returns the resident page at `index`.
    pub fn resident_page(&self, index: usize) -> Option<Frame> {
        self.pages.lock().get(&index).cloned()
    }

    pub fn nr_resident(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns whether mapping a page writable requires a write fault first.
    pub fn needs_write_fault(&self) -> bool {
        self.flags.contains(ObjectFlags::NEEDS_WRITEFAULT) && !self.written.load(Ordering::Relaxed)
    }

    /// Records that a write fault reached the object.
    pub(crate) fn mark_written(&self) {
        self.written.store(true, Ordering::Relaxed);
    }

    /// Records that the resident pages match the backing store again, and
    /// makes them read-only so that the next write to any of them faults.
    pub fn mark_clean(&self) {
        let pages = self.pages.lock();
        self.written.store(false, Ordering::Relaxed);
        for frame in pages.values() {
            self.env
                .mmu()
                .page_protect(frame, VmPerms::READ | VmPerms::EXEC);
            frame.set_dirty(false);
        }
    }

    /// Drops the page at `index` from the object.
    ///
    /// Every mapping of the page is removed. A busy page is marked released
    /// and its holder frees it; a page lent to private pages is left to them.
    pub fn discard(&self, index: usize) {
        let mut pages = self.pages.lock();
        let Some(frame) = pages.remove(&index) else {
            return;
        };
        self.env.mmu().page_protect(&frame, VmPerms::empty());
        if frame.release() {
            debug!("object page {} discarded while busy", index);
            return;
        }
        if frame.loan_count() > 0 {
            frame.set_owner(FrameOwner::None);
            return;
        }
        drop(pages);
        self.env.free_frame(frame);
    }

    /// Returns the page at `index`, reading it from the backing store if it
    /// is not resident. The page is returned busy.
    ///
    /// This may block, so the caller must not hold any lock.
    pub(crate) fn fetch_page(&self, index: usize) -> Result<Frame> {
        let env = &self.env;
        loop {
            let mut pages = self.pages.lock();
            if let Some(frame) = pages.get(&index).cloned() {
                if frame.try_busy() {
                    return Ok(frame);
                }
                drop(pages);
                if frame.want() {
                    inc(&env.stats().page_waits);
                    frame.wait_unbusy();
                }
                continue;
            }

            let Some(frame) = env.allocator().alloc(false) else {
                drop(pages);
                env.wait_for_memory()?;
                continue;
            };
            frame.set_owner(FrameOwner::Object {
                object: self.weak_self.clone(),
                index,
            });
            pages.insert(index, frame.clone());
            drop(pages);

            inc(&env.stats().pager_gets);
            if let Err(err) = self.store.fetch(index, &frame) {
                let mut pages = self.pages.lock();
                if pages.get(&index) == Some(&frame) {
                    pages.remove(&index);
                }
                drop(pages);
                env.free_frame(frame);
                return Err(err);
            }
            return Ok(frame);
        }
    }

    /// Tells an anonymous object that the page at `index` no longer needs
    /// its stored copy.
    pub(crate) fn drop_swap(&self, index: usize) {
        if self.flags.contains(ObjectFlags::ANONYMOUS) {
            self.store.release(index);
        }
    }

    pub(crate) fn env(&self) -> &Arc<VmEnv> {
        &self.env
    }
}

impl Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("flags", &self.flags)
            .field("written", &self.written.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let pages = core::mem::take(self.pages.get_mut());
        for frame in pages.into_values() {
            if frame.loan_count() > 0 {
                frame.set_owner(FrameOwner::None);
                continue;
            }
            self.env.mmu().page_protect(&frame, VmPerms::empty());
            self.env.free_frame(frame);
        }
    }
}

/// The locked page table of a [`VmObject`].
pub(crate) struct ObjectGuard<'a> {
    object: &'a VmObject,
    pages: SpinLockGuard<'a, BTreeMap<usize, Frame>>,
}

impl<'a> ObjectGuard<'a> {
    pub(crate) fn object(&self) -> &'a VmObject {
        self.object
    }

    pub(crate) fn page(&self, index: usize) -> Option<&Frame> {
        self.pages.get(&index)
    }

    /// Collects the resident pages of a window without blocking.
    ///
    /// Entries flagged in `skip` are not looked up. The page at `center` is
    /// returned only if it can be taken busy, and is returned busy. Other
    /// pages are returned only if they are ready, and are not taken busy.
    pub(crate) fn get_resident(
        &self,
        start: usize,
        skip: &[bool],
        center: usize,
    ) -> SmallVec<[Option<Frame>; MAX_WINDOW]> {
        skip.iter()
            .enumerate()
            .map(|(i, &skip)| {
                if skip {
                    return None;
                }
                let frame = self.pages.get(&(start + i))?;
                if i == center {
                    return frame.try_busy().then(|| frame.clone());
                }
                (frame.state() == FrameState::Ready).then(|| frame.clone())
            })
            .collect()
    }

    /// Moves the idle pages of a range to the inactive queue.
    pub(crate) fn deactivate_range(&self, start: usize, count: usize) {
        let queues = self.object.env.queues();
        for (_, frame) in self.pages.range(start..start + count) {
            if frame.state() == FrameState::Ready && frame.loan_count() == 0 {
                queues.deactivate(frame);
            }
        }
    }

    /// Lets go of a page this thread took busy.
    ///
    /// If the object discarded the page in the meantime, the page is freed,
    /// or left to its borrowers if it is lent.
    pub(crate) fn release_busy(&mut self, frame: Frame) {
        if !frame.is_released() {
            frame.unbusy();
            return;
        }
        inc(&self.object.env.stats().released_pages);
        if frame.loan_count() > 0 {
            frame.orphan();
            return;
        }
        self.object.env.free_frame(frame);
    }

    /// Replaces a busy page that is lent to private pages with a busy copy,
    /// so that the object can be written without the borrowers seeing it.
    ///
    /// The borrowers keep the old page, which the object no longer owns.
    /// Returns `None` if no frame could be allocated.
    pub(crate) fn break_loan(&mut self, frame: Frame) -> Option<Frame> {
        let env = &self.object.env;
        let index = frame.object_index()?;
        let copy = env.allocator().alloc(false)?;
        copy.copy_from(&frame);
        copy.set_dirty(frame.is_dirty());
        copy.set_owner(FrameOwner::Object {
            object: self.object.weak_self.clone(),
            index,
        });
        env.mmu().page_protect(&frame, VmPerms::empty());
        self.pages.insert(index, copy.clone());

        frame.set_owner(FrameOwner::None);
        frame.unbusy();
        env.queues().activate(&copy);
        inc(&env.stats().loan_breaks);
        trace!("object page {} copied away from its borrowers", index);
        Some(copy)
    }

    /// Gives up a lent page. The borrower becomes its owner.
    pub(crate) fn surrender(&mut self, frame: &Frame) {
        let Some(index) = frame.object_index() else {
            return;
        };
        if self.pages.get(&index) == Some(frame) {
            self.pages.remove(&index);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{VmEnvOptions, mmu::SoftMmu, pool::FramePool};

    fn env() -> Arc<VmEnv> {
        VmEnvOptions::new(Arc::new(FramePool::new(8)), Arc::new(SoftMmu::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn fetch_then_lookup() {
        let env = env();
        let object = VmObject::new_anonymous(&env);

        let frame = object.fetch_page(3).unwrap();
        assert!(frame.is_busy());
        assert_eq!(frame.object_index(), Some(3));
        assert!(Arc::ptr_eq(&frame.owner_object().unwrap(), &object));

        {
            let guard = object.lock();
            let found = guard.get_resident(2, &[false, false, false], 1);
            assert!(found.iter().all(Option::is_none));
        }

        frame.unbusy();
        let guard = object.lock();
        let found = guard.get_resident(2, &[false, false, true], 0);
        assert_eq!(found.as_slice(), &[None, Some(frame.clone()), None]);
        let found = guard.get_resident(3, &[false], 0);
        assert_eq!(found[0], Some(frame.clone()));
        assert!(frame.is_busy());
    }

    #[test]
    fn discard_idle_and_busy_pages() {
        let env = env();
        let object = VmObject::new_anonymous(&env);

        let idle = object.fetch_page(0).unwrap();
        idle.unbusy();
        object.discard(0);
        assert_eq!(idle.state(), FrameState::Free);

        let busy = object.fetch_page(1).unwrap();
        object.discard(1);
        assert!(busy.is_released());
        assert!(object.resident_page(1).is_none());

        object.lock().release_busy(busy.clone());
        assert_eq!(busy.state(), FrameState::Free);
        assert_eq!(env.stats().snapshot().released_pages, 1);
    }

    #[test]
    fn break_loan_keeps_borrowed_page() {
        let env = env();
        let object = VmObject::new_anonymous(&env);
        let frame = object.fetch_page(0).unwrap();
        frame.write_bytes(0, b"lent");
        frame.add_loan();

        let copy = object.lock().break_loan(frame.clone()).unwrap();
        assert!(copy.is_busy());
        assert_eq!(object.resident_page(0), Some(copy.clone()));
        assert!(matches!(frame.owner(), FrameOwner::None));
        assert!(!frame.is_busy());

        let mut buf = [0u8; 4];
        copy.read_bytes(0, &mut buf);
        assert_eq!(&buf, b"lent");
    }

    #[test]
    fn write_fault_interception() {
        let env = env();
        let object = VmObject::new(&env, Arc::new(ZeroStore), ObjectFlags::NEEDS_WRITEFAULT);
        assert!(object.needs_write_fault());
        object.mark_written();
        assert!(!object.needs_write_fault());
        object.mark_clean();
        assert!(object.needs_write_fault());
    }
}
