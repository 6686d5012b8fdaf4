// SPDX-License-Identifier: MPL-2.0

//! The hardware mapping layer.

use crate::prelude::*;

/// Identifies the page table of one address space.
pub type AsId = usize;

bitflags! {
    /// Options of [`Mmu::enter`].
    pub struct MapFlags: u32 {
        /// The translation must not be dropped behind the owner's back.
        const WIRED    = 1 << 0;
        /// The call may fail for lack of memory instead of blocking.
        const CAN_FAIL = 1 << 1;
    }
}

/// A hardware translation as seen by [`Mmu::query`].
#[derive(Debug, Clone)]
pub struct MappingInfo {
    pub frame: Frame,
    pub prot: VmPerms,
    pub wired: bool,
    /// Whether the page has been written through this translation.
    pub dirty: bool,
}

/// Installs and removes virtual-to-physical translations.
///
/// Every method may be called while the caller holds the address space,
/// anonymous-layer and object locks, so implementations must never block on
/// any of them.
pub trait Mmu: Send + Sync {
    /// Maps `vaddr` to `frame` with protection `prot`, replacing any previous
    /// translation. `access` is the access that caused the call.
    fn enter(
        &self,
        asid: AsId,
        vaddr: Vaddr,
        frame: &Frame,
        prot: VmPerms,
        access: VmPerms,
        flags: MapFlags,
    ) -> Result<()>;

    /// Returns the physical address `vaddr` translates to.
    fn extract(&self, asid: AsId, vaddr: Vaddr) -> Option<Paddr>;

    fn query(&self, asid: AsId, vaddr: Vaddr) -> Option<MappingInfo>;

    /// Removes the translations in `range`.
    fn remove(&self, asid: AsId, range: Range<Vaddr>);

    /// Restricts the translations in `range` to `prot`.
    fn protect(&self, asid: AsId, range: Range<Vaddr>, prot: VmPerms);

    /// Clears the wired attribute of a translation.
    fn unwire(&self, asid: AsId, vaddr: Vaddr);

    /// Restricts every translation of `frame`, in every address space, to
    /// `prot`. An empty `prot` removes them.
    fn page_protect(&self, frame: &Frame, prot: VmPerms);
}

/// A software page table shared by all address spaces.
pub struct SoftMmu {
    entries: SpinLock<BTreeMap<(AsId, Vaddr), MappingInfo>>,
    fail_enters: AtomicUsize,
    nr_enters: AtomicUsize,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
            fail_enters: AtomicUsize::new(0),
            nr_enters: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` fallible calls to [`Mmu::enter`] fail with
    /// `ENOMEM`.
    pub fn fail_next_enters(&self, count: usize) {
        self.fail_enters.store(count, Ordering::Relaxed);
    }

    /// Returns the number of successful [`Mmu::enter`] calls.
    pub fn nr_enters(&self) -> usize {
        self.nr_enters.load(Ordering::Relaxed)
    }

    /// Returns the number of translations in one address space.
    pub fn nr_mappings(&self, asid: AsId) -> usize {
        self.entries
            .lock()
            .range((asid, 0)..=(asid, Vaddr::MAX))
            .count()
    }

    /// Returns the number of translations of `frame` across all address spaces.
    pub fn mappings_of(&self, frame: &Frame) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|info| info.frame == *frame)
            .count()
    }
}

impl Default for SoftMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu for SoftMmu {
    fn enter(
        &self,
        asid: AsId,
        vaddr: Vaddr,
        frame: &Frame,
        prot: VmPerms,
        access: VmPerms,
        flags: MapFlags,
    ) -> Result<()> {
        if flags.contains(MapFlags::CAN_FAIL)
            && self
                .fail_enters
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
        {
            return_errno_with_message!(Errno::ENOMEM, "no memory for page table pages");
        }

        let mut entries = self.entries.lock();
        let was_dirty = entries
            .get(&(asid, vaddr))
            .is_some_and(|old| old.frame == *frame && old.dirty);
        entries.insert(
            (asid, vaddr),
            MappingInfo {
                frame: frame.clone(),
                prot,
                wired: flags.contains(MapFlags::WIRED),
                dirty: was_dirty
                    || (access.contains(VmPerms::WRITE) && prot.contains(VmPerms::WRITE)),
            },
        );
        self.nr_enters.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn extract(&self, asid: AsId, vaddr: Vaddr) -> Option<Paddr> {
        self.entries
            .lock()
            .get(&(asid, vaddr))
            .map(|info| info.frame.paddr())
    }

    fn query(&self, asid: AsId, vaddr: Vaddr) -> Option<MappingInfo> {
        self.entries.lock().get(&(asid, vaddr)).cloned()
    }

    fn remove(&self, asid: AsId, range: Range<Vaddr>) {
        if range.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        let keys: Vec<_> = entries
            .range((asid, range.start)..(asid, range.end))
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            entries.remove(&key);
        }
    }

    fn protect(&self, asid: AsId, range: Range<Vaddr>, prot: VmPerms) {
        if range.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        for (_, info) in entries.range_mut((asid, range.start)..(asid, range.end)) {
            info.prot &= prot;
        }
    }

    fn unwire(&self, asid: AsId, vaddr: Vaddr) {
        if let Some(info) = self.entries.lock().get_mut(&(asid, vaddr)) {
            info.wired = false;
        }
    }

    fn page_protect(&self, frame: &Frame, prot: VmPerms) {
        let mut entries = self.entries.lock();
        if prot.is_empty() {
            entries.retain(|_, info| info.frame != *frame);
            return;
        }
        for info in entries.values_mut().filter(|info| info.frame == *frame) {
            info.prot &= prot;
        }
    }
}
