// SPDX-License-Identifier: MPL-2.0

use crate::{
    advice::Advice,
    anon::{AnonInfo, AnonLayer},
    env::VmEnv,
    object::VmObject,
    prelude::*,
};

bitflags! {
    /// Copy-on-write state of a region.
    pub struct RegionFlags: u32 {
        /// Writes must not reach the backing object; they go to private pages.
        const COPY_ON_WRITE = 1 << 0;
        /// The anonymous layer is still shared with the region it was
        /// inherited from, or does not exist yet. A private one must be made
        /// before the region can receive new private pages.
        const NEEDS_COPY    = 1 << 1;
    }
}

/// What a child address space gets from a region on fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Inherit {
    /// A copy-on-write copy.
    #[default]
    Copy,
    /// The same pages, shared for writing.
    Share,
    /// Nothing.
    None,
}

/// A contiguous range of an address space with uniform protection and
/// backing.
pub(crate) struct Region {
    range: Range<Vaddr>,
    prot: VmPerms,
    max_prot: VmPerms,
    advice: Advice,
    inherit: Inherit,
    pub(super) flags: RegionFlags,
    /// The number of outstanding requests to keep the region wired.
    pub(super) wired_count: u32,
    amap: Option<Arc<AnonLayer>>,
    /// The slot of the anonymous layer that backs the first page.
    amap_offset: usize,
    object: Option<Arc<VmObject>>,
    /// The page index of the object that backs the first page.
    object_offset: usize,
}

impl Region {
    pub(super) fn new(options: MapOptions) -> Self {
        let MapOptions {
            start,
            size,
            perms,
            max_perms,
            advice,
            inherit,
            object,
            copy_on_write,
        } = options;

        let (object, object_offset) = match object {
            Some((object, offset)) => (Some(object), offset),
            None => (None, 0),
        };
        let mut flags = RegionFlags::empty();
        if object.is_none() || copy_on_write {
            flags |= RegionFlags::COPY_ON_WRITE | RegionFlags::NEEDS_COPY;
        }

        Self {
            range: start..start + size,
            prot: perms,
            max_prot: max_perms.unwrap_or(perms),
            advice,
            inherit,
            flags,
            wired_count: 0,
            amap: None,
            amap_offset: 0,
            object,
            object_offset,
        }
    }

    pub(crate) fn range(&self) -> &Range<Vaddr> {
        &self.range
    }

    pub(crate) fn prot(&self) -> VmPerms {
        self.prot
    }

    pub(crate) fn inherit(&self) -> Inherit {
        self.inherit
    }

    pub(crate) fn amap(&self) -> Option<&Arc<AnonLayer>> {
        self.amap.as_ref()
    }

    pub(crate) fn object(&self) -> Option<&Arc<VmObject>> {
        self.object.as_ref()
    }

    pub(crate) fn is_copy_on_write(&self) -> bool {
        self.flags.contains(RegionFlags::COPY_ON_WRITE)
    }

    pub(crate) fn needs_copy(&self) -> bool {
        self.flags.contains(RegionFlags::NEEDS_COPY)
    }

    pub(crate) fn is_wired(&self) -> bool {
        self.wired_count > 0
    }

    fn npages(&self) -> usize {
        self.range.len() / PAGE_SIZE
    }

    /// Gives the region an anonymous layer of its own.
    ///
    /// A region without a layer gets an empty one. A layer referenced by
    /// this region alone is kept. Otherwise the region switches to a copy
    /// that shares every private page with the original.
    pub(crate) fn amap_copy(&mut self, env: &Arc<VmEnv>) {
        match &self.amap {
            None => {
                self.amap = Some(AnonLayer::new(env));
                self.amap_offset = 0;
            }
            Some(amap) if amap.region_refs() == 1 => {}
            Some(amap) => {
                let copy = amap.copy(self.amap_offset, self.npages());
                amap.remove_region_ref();
                self.amap = Some(copy);
                self.amap_offset = 0;
            }
        }
        self.flags.remove(RegionFlags::NEEDS_COPY);
    }

    /// Creates a region over the same range and backing, for another
    /// address space. The copy is not wired.
    pub(crate) fn share(&self) -> Self {
        if let Some(amap) = &self.amap {
            amap.add_region_ref();
        }
        Self {
            range: self.range.clone(),
            prot: self.prot,
            max_prot: self.max_prot,
            advice: self.advice,
            inherit: self.inherit,
            flags: self.flags,
            wired_count: 0,
            amap: self.amap.clone(),
            amap_offset: self.amap_offset,
            object: self.object.clone(),
            object_offset: self.object_offset,
        }
    }

    pub(crate) fn info(&self) -> RegionInfo {
        RegionInfo {
            range: self.range.clone(),
            prot: self.prot,
            max_prot: self.max_prot,
            advice: self.advice,
            flags: self.flags,
            wired: self.is_wired(),
            amap: self.amap.clone(),
            amap_offset: self.amap_offset,
            object: self.object.clone(),
            object_offset: self.object_offset,
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(amap) = &self.amap {
            amap.remove_region_ref();
        }
    }
}

/// A snapshot of a region.
///
/// It holds its own references to the layer and object of the region, so
/// it stays usable after the address space lock is dropped. Whether the
/// region itself is still there must be checked again after relocking.
#[derive(Debug, Clone)]
pub struct RegionInfo {
    range: Range<Vaddr>,
    prot: VmPerms,
    max_prot: VmPerms,
    advice: Advice,
    flags: RegionFlags,
    wired: bool,
    amap: Option<Arc<AnonLayer>>,
    amap_offset: usize,
    object: Option<Arc<VmObject>>,
    object_offset: usize,
}

impl RegionInfo {
    pub fn range(&self) -> Range<Vaddr> {
        self.range.clone()
    }

    pub fn prot(&self) -> VmPerms {
        self.prot
    }

    pub fn max_prot(&self) -> VmPerms {
        self.max_prot
    }

    pub fn advice(&self) -> Advice {
        self.advice
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn is_wired(&self) -> bool {
        self.wired
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.flags.contains(RegionFlags::COPY_ON_WRITE)
    }

    pub fn needs_copy(&self) -> bool {
        self.flags.contains(RegionFlags::NEEDS_COPY)
    }

    pub fn amap(&self) -> Option<&Arc<AnonLayer>> {
        self.amap.as_ref()
    }

    pub fn object(&self) -> Option<&Arc<VmObject>> {
        self.object.as_ref()
    }

    /// Returns the anonymous layer slot of a page of the region.
    pub fn amap_slot(&self, vaddr: Vaddr) -> usize {
        debug_assert!(self.range.contains(&vaddr));
        self.amap_offset + (vaddr - self.range.start) / PAGE_SIZE
    }

    /// Returns the object page index of a page of the region.
    pub fn object_index(&self, vaddr: Vaddr) -> usize {
        debug_assert!(self.range.contains(&vaddr));
        self.object_offset + (vaddr - self.range.start) / PAGE_SIZE
    }

    /// Returns the private page backing `vaddr`.
    pub fn anon_at(&self, vaddr: Vaddr) -> Option<AnonInfo> {
        self.amap.as_ref()?.anon_at(self.amap_slot(vaddr))
    }
}

/// Options for mapping a region into an [`AddressSpace`].
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use vm_fault::*;
/// # let env = VmEnvOptions::new(Arc::new(FramePool::new(8)), Arc::new(SoftMmu::new()))
/// #     .build()
/// #     .unwrap();
/// let object = VmObject::new_anonymous(&env);
/// let options = MapOptions::new(0x20000, 2 * PAGE_SIZE, VmPerms::READ)
///     .max_perms(VmPerms::READ | VmPerms::WRITE)
///     .advice(Advice::Sequential)
///     .object(object, 4)
///     .copy_on_write();
/// let space = AddressSpace::new(&env);
/// space.map(options).unwrap();
/// assert!(space.region_at(0x21000).unwrap().needs_copy());
/// ```
///
/// [`AddressSpace`]: super::AddressSpace
pub struct MapOptions {
    start: Vaddr,
    size: usize,
    perms: VmPerms,
    max_perms: Option<VmPerms>,
    advice: Advice,
    inherit: Inherit,
    object: Option<(Arc<VmObject>, usize)>,
    copy_on_write: bool,
}

impl MapOptions {
    /// Creates options for an anonymous, zero-filled mapping of `size` bytes
    /// at `start`.
    pub fn new(start: Vaddr, size: usize, perms: VmPerms) -> Self {
        Self {
            start,
            size,
            perms,
            max_perms: None,
            advice: Advice::Normal,
            inherit: Inherit::Copy,
            object: None,
            copy_on_write: false,
        }
    }

    /// Sets the maximum permissions. They default to the permissions.
    pub fn max_perms(mut self, max_perms: VmPerms) -> Self {
        self.max_perms = Some(max_perms);
        self
    }

    pub fn advice(mut self, advice: Advice) -> Self {
        self.advice = advice;
        self
    }

    pub fn inherit(mut self, inherit: Inherit) -> Self {
        self.inherit = inherit;
        self
    }

    /// Backs the mapping with `object`, starting at page index `offset`.
    pub fn object(mut self, object: Arc<VmObject>, offset: usize) -> Self {
        self.object = Some((object, offset));
        self
    }

    /// Makes writes go to private copies instead of the object.
    ///
    /// Mappings without an object are always copy-on-write.
    pub fn copy_on_write(mut self) -> Self {
        self.copy_on_write = true;
        self
    }

    pub(super) fn range(&self) -> Range<Vaddr> {
        self.start..self.start.saturating_add(self.size)
    }

    pub(super) fn perms(&self) -> (VmPerms, VmPerms) {
        (self.perms, self.max_perms.unwrap_or(self.perms))
    }
}
