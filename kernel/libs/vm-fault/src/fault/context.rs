// SPDX-License-Identifier: MPL-2.0

use super::FaultFlags;
use crate::{
    anon::{AnonGuard, AnonPage},
    env::VmEnv,
    object::ObjectGuard,
    prelude::*,
    space::{AddressSpace, RegionInfo, RegionMap},
};

/// What a fault attempt knows about the faulting address.
///
/// The region is a snapshot taken under the address space lock. It keeps
/// the layer and the object alive, so they can be relocked after every lock
/// was dropped; the timestamp tells whether the snapshot is still valid.
pub(crate) struct FaultInfo<'a> {
    pub(crate) space: &'a AddressSpace,
    pub(crate) env: &'a VmEnv,
    pub(crate) vaddr: Vaddr,
    pub(crate) region: RegionInfo,
    timestamp: u64,
}

impl<'a> FaultInfo<'a> {
    /// Finds the region of `vaddr`, returning it with the region set locked.
    pub(crate) fn lookup(
        space: &'a AddressSpace,
        vaddr: Vaddr,
    ) -> Result<(Self, RwLockReadGuard<'a, RegionMap>)> {
        let map = space.read_regions();
        let Some(region) = map.find(vaddr).map(|region| region.info()) else {
            return_errno_with_message!(Errno::EFAULT, "no region maps the address");
        };
        let info = Self {
            space,
            env: space.env(),
            vaddr,
            region,
            timestamp: space.timestamp(),
        };
        Ok((info, map))
    }

    /// Locks the region set again. Returns `None` if the regions changed
    /// since the snapshot was taken.
    pub(crate) fn relock(&self) -> Option<RwLockReadGuard<'a, RegionMap>> {
        let map = self.space.read_regions();
        (self.space.timestamp() == self.timestamp).then_some(map)
    }

    pub(crate) fn lock_amap(&self) -> Option<AnonGuard<'_>> {
        self.region.amap().map(|amap| amap.lock())
    }

    pub(crate) fn lock_object(&self) -> Option<ObjectGuard<'_>> {
        self.region.object().map(|object| object.lock())
    }
}

/// The locks a fault attempt holds.
///
/// Phases that may block take the locks by value and hand them back, so a
/// phase that dropped them cannot use them by mistake.
pub(super) struct FaultLocks<'f> {
    pub(super) object: Option<ObjectGuard<'f>>,
    pub(super) amap: Option<AnonGuard<'f>>,
    pub(super) map: Option<RwLockReadGuard<'f, RegionMap>>,
}

impl<'f> FaultLocks<'f> {
    /// Drops every lock, innermost first.
    pub(super) fn unlock_all(self) {
        let Self { object, amap, map } = self;
        drop(object);
        drop(amap);
        drop(map);
    }

    /// Returns the anonymous layer guard.
    ///
    /// # Panics
    ///
    /// Panics if the layer is not locked. Phases only call this once the
    /// region is known to have a layer.
    pub(super) fn amap(&mut self) -> &mut AnonGuard<'f> {
        let Some(amap) = self.amap.as_mut() else {
            panic!("the fault does not hold an anonymous layer");
        };
        amap
    }

    /// Returns the object guard.
    ///
    /// # Panics
    ///
    /// Panics if the object is not locked.
    pub(super) fn object(&mut self) -> &mut ObjectGuard<'f> {
        let Some(object) = self.object.as_mut() else {
            panic!("the fault does not hold an object");
        };
        object
    }
}

/// The pages examined by a fault attempt.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct FaultWindow {
    pub(super) start: Vaddr,
    pub(super) npages: usize,
    /// The position of the faulting page in the window.
    pub(super) center: usize,
}

impl FaultWindow {
    pub(super) fn vaddr(&self, i: usize) -> Vaddr {
        self.start + i * PAGE_SIZE
    }
}

/// The state of a fault that outlives its attempts.
pub(super) struct FaultContext {
    flags: FaultFlags,
    orig_access: VmPerms,
    /// The access the mapping is entered for.
    pub(super) access_type: VmPerms,
    /// The protection the mapping is entered with.
    pub(super) enter_prot: VmPerms,
    /// Whether the mapping is entered wired.
    pub(super) wire_mapping: bool,
    /// Whether to look at the faulting page only.
    pub(super) narrow: bool,
    /// Whether copy-on-write must be resolved now.
    pub(super) cow_now: bool,
    /// Whether the page goes to a new private page.
    pub(super) promote: bool,
    pub(super) window: FaultWindow,
    /// A private page allocated by an earlier attempt and not used yet.
    pub(super) anon_spare: Option<AnonPage>,
}

impl FaultContext {
    pub(super) fn new(access: VmPerms, flags: FaultFlags) -> Self {
        let wire_paging = flags.contains(FaultFlags::WIRE);
        Self {
            flags,
            orig_access: access,
            access_type: access,
            enter_prot: VmPerms::empty(),
            wire_mapping: wire_paging,
            narrow: wire_paging,
            cow_now: false,
            promote: false,
            window: FaultWindow::default(),
            anon_spare: None,
        }
    }

    /// Resets what an attempt computes.
    pub(super) fn begin_attempt(&mut self) {
        self.access_type = self.orig_access;
        self.enter_prot = VmPerms::empty();
        self.wire_mapping = self.wire_paging();
        self.cow_now = false;
        self.promote = false;
    }

    /// Returns whether the page is to be wired.
    pub(super) fn wire_paging(&self) -> bool {
        self.flags.contains(FaultFlags::WIRE)
    }

    pub(super) fn use_max_prot(&self) -> bool {
        self.flags.contains(FaultFlags::MAX_PROT)
    }
}
