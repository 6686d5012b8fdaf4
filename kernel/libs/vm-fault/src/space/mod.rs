// SPDX-License-Identifier: MPL-2.0

//! Address spaces and their regions.

mod access;
mod region;

pub(crate) use self::region::Region;
pub use self::region::{Inherit, MapOptions, RegionFlags, RegionInfo};
use crate::{
    env::VmEnv,
    mmu::{AsId, MappingInfo},
    prelude::*,
};

/// The regions of an address space, keyed by start address.
pub(crate) struct RegionMap {
    regions: BTreeMap<Vaddr, Region>,
}

impl RegionMap {
    const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Returns the region that contains `vaddr`.
    pub(crate) fn find(&self, vaddr: Vaddr) -> Option<&Region> {
        let (_, region) = self.regions.range(..=vaddr).next_back()?;
        region.range().contains(&vaddr).then_some(region)
    }

    pub(crate) fn find_mut(&mut self, vaddr: Vaddr) -> Option<&mut Region> {
        let (_, region) = self.regions.range_mut(..=vaddr).next_back()?;
        region.range().contains(&vaddr).then_some(region)
    }

    /// Iterates, in address order, over the regions that overlap `range`.
    pub(crate) fn overlapping(&self, range: Range<Vaddr>) -> impl Iterator<Item = &Region> + '_ {
        let first = self.find(range.start).map_or(range.start, |r| r.range().start);
        self.regions
            .range(first..range.end.max(first))
            .map(|(_, region)| region)
    }

    fn overlapping_mut(&mut self, range: Range<Vaddr>) -> impl Iterator<Item = &mut Region> + '_ {
        let first = self.find(range.start).map_or(range.start, |r| r.range().start);
        self.regions
            .range_mut(first..range.end.max(first))
            .map(|(_, region)| region)
    }

    fn insert(&mut self, region: Region) {
        self.regions.insert(region.range().start, region);
    }
}

/// A virtual address space: a set of non-overlapping regions and the page
/// table that maps them.
///
/// The region set is guarded by a readers-writer lock. Faults hold it for
/// reading; changes to the regions take it for writing, which bumps a
/// timestamp. A fault that dropped the lock to block compares timestamps
/// after relocking to learn whether the regions changed under it.
pub struct AddressSpace {
    asid: AsId,
    env: Arc<VmEnv>,
    regions: RwLock<RegionMap>,
    timestamp: AtomicU64,
}

impl AddressSpace {
    pub fn new(env: &Arc<VmEnv>) -> Arc<Self> {
        Arc::new(Self {
            asid: env.alloc_asid(),
            env: env.clone(),
            regions: RwLock::new(RegionMap::new()),
            timestamp: AtomicU64::new(0),
        })
    }

    pub fn asid(&self) -> AsId {
        self.asid
    }

    pub fn env(&self) -> &Arc<VmEnv> {
        &self.env
    }

    /// Maps a new region.
    ///
    /// The range must be page-aligned, non-empty and free; the permissions
    /// must not exceed the maximum permissions.
    pub fn map(&self, options: MapOptions) -> Result<()> {
        let range = options.range();
        if !is_page_aligned(range.start) || !is_page_aligned(range.end) || range.is_empty() {
            return_errno_with_message!(Errno::EINVAL, "the mapping range is not page-aligned");
        }
        let (perms, max_perms) = options.perms();
        if !max_perms.contains(perms) {
            return_errno_with_message!(
                Errno::EACCES,
                "the permissions exceed the maximum permissions"
            );
        }

        let mut regions = self.write_regions();
        if regions.overlapping(range.clone()).next().is_some() {
            return_errno_with_message!(Errno::EEXIST, "the mapping range is already in use");
        }
        regions.insert(Region::new(options));
        trace!("asid {}: mapped {:#x?}", self.asid, range);
        Ok(())
    }

    /// Unmaps every region in `range`.
    ///
    /// Regions cannot be split, so a region that only partly overlaps the
    /// range is an error.
    pub fn unmap(&self, range: Range<Vaddr>) -> Result<()> {
        let mut regions = self.write_regions();
        let starts: Vec<_> = regions
            .overlapping(range.clone())
            .map(|region| region.range().clone())
            .collect();
        if starts
            .iter()
            .any(|r| r.start < range.start || r.end > range.end)
        {
            return_errno_with_message!(Errno::EINVAL, "unmapping part of a region");
        }
        for region_range in starts {
            if let Some(region) = regions.regions.remove(&region_range.start) {
                self.teardown(region);
            }
        }
        Ok(())
    }

    /// Removes the translations of a region and unpins the pages its wired
    /// translations held.
    fn teardown(&self, region: Region) {
        let mmu = self.env.mmu();
        let range = region.range().clone();
        for vaddr in range.clone().step_by(PAGE_SIZE) {
            let Some(mapping) = mmu.query(self.asid, vaddr) else {
                continue;
            };
            if mapping.wired && mapping.frame.wire_count() > 0 {
                self.env.queues().unwire(&mapping.frame);
            }
        }
        mmu.remove(self.asid, range);
    }

    /// Creates a child address space according to the inheritance of each
    /// region.
    ///
    /// Copied regions become copy-on-write on both sides: they share their
    /// anonymous layer until either side writes. The parent loses write
    /// access to its resident pages so that its next write faults. Wiring is
    /// not inherited.
    pub fn fork(&self) -> Result<Arc<Self>> {
        let child = Self::new(&self.env);
        let mut regions = self.write_regions();
        let mut child_regions = child.write_regions();

        for region in regions.regions.values_mut() {
            match region.inherit() {
                Inherit::None => {}
                Inherit::Share => {
                    if region.needs_copy() {
                        region.amap_copy(&self.env);
                    }
                    if let Some(amap) = region.amap() {
                        amap.set_shared();
                    }
                    child_regions.insert(region.share());
                }
                Inherit::Copy if !region.is_copy_on_write() => {
                    child_regions.insert(region.share());
                }
                Inherit::Copy => {
                    let mut copy = region.share();
                    copy.flags |= RegionFlags::NEEDS_COPY;
                    if region.amap().is_some_and(|amap| amap.is_shared()) {
                        // The parent keeps writing to the shared layer, so the
                        // child takes its copy right away.
                        copy.amap_copy(&self.env);
                    } else {
                        region.flags |= RegionFlags::NEEDS_COPY;
                    }
                    self.env.mmu().protect(
                        self.asid,
                        region.range().clone(),
                        region.prot().without_write(),
                    );
                    child_regions.insert(copy);
                }
            }
        }
        drop(child_regions);
        debug!("asid {}: forked into asid {}", self.asid, child.asid);
        Ok(child)
    }

    /// Returns a snapshot of the region that contains `vaddr`.
    pub fn region_at(&self, vaddr: Vaddr) -> Option<RegionInfo> {
        self.read_regions().find(vaddr).map(Region::info)
    }

    /// Returns whether the region set is locked, for reading or writing.
    pub fn is_locked(&self) -> bool {
        self.regions.reader_count() > 0 || self.regions.writer_count() > 0
    }

    /// Returns the hardware translation of the page that contains `vaddr`.
    pub fn query(&self, vaddr: Vaddr) -> Option<MappingInfo> {
        self.env.mmu().query(self.asid, page_align_down(vaddr))
    }

    pub(crate) fn read_regions(&self) -> RwLockReadGuard<'_, RegionMap> {
        self.regions.read()
    }

    /// Locks the regions for writing. Faults that are blocked see the
    /// change once they relock.
    pub(crate) fn write_regions(&self) -> RwLockWriteGuard<'_, RegionMap> {
        let guard = self.regions.write();
        self.timestamp.fetch_add(1, Ordering::Release);
        guard
    }

    pub(crate) fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Adjusts the logical wiring of every region in `range`.
    ///
    /// Fails with `EFAULT`, changing nothing, unless regions cover the whole
    /// range.
    pub(crate) fn adjust_wiring(&self, range: Range<Vaddr>, wire: bool) -> Result<()> {
        let mut regions = self.write_regions();
        let mut next = range.start;
        for region in regions.overlapping(range.clone()) {
            if region.range().start > next {
                break;
            }
            next = region.range().end;
        }
        if next < range.end {
            return_errno_with_message!(Errno::EFAULT, "the range has unmapped holes");
        }
        for region in regions.overlapping_mut(range) {
            if wire {
                region.wired_count += 1;
            } else {
                region.wired_count = region.wired_count.saturating_sub(1);
            }
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let regions = core::mem::replace(self.regions.get_mut(), RegionMap::new());
        for region in regions.regions.into_values() {
            self.teardown(region);
        }
    }
}

impl Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("asid", &self.asid)
            .field("timestamp", &self.timestamp())
            .finish_non_exhaustive()
    }
}
