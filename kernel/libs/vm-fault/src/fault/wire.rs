// SPDX-License-Identifier: MPL-2.0

//! Wiring: faulting pages in and pinning them against replacement.

use super::{FaultFlags, resolve_fault};
use crate::{
    anon::AnonGuard,
    object::ObjectGuard,
    prelude::*,
    space::{AddressSpace, Region},
};

/// Faults in and wires every page in `start..end`.
///
/// Each page is faulted with its full protection: the current protection
/// of its region, or the maximum protection if `max_prot` is set. `access`
/// must be allowed by that protection.
///
/// If a page fails, the pages wired so far by this call are unwired and
/// the error is returned.
pub fn wire_range(
    space: &AddressSpace,
    start: Vaddr,
    end: Vaddr,
    access: VmPerms,
    max_prot: bool,
) -> Result<()> {
    if start > end {
        return_errno_with_message!(Errno::EFAULT, "the wiring range is inverted");
    }
    let start = page_align_down(start);
    let end = page_align_up(end);
    let mut flags = FaultFlags::WIRE;
    if max_prot {
        flags |= FaultFlags::MAX_PROT;
    }

    for vaddr in (start..end).step_by(PAGE_SIZE) {
        if let Err(err) = resolve_fault(space, vaddr, access, flags) {
            debug!("wiring {:#x} failed: {}", vaddr, err);
            unwire_range(space, start, vaddr);
            return Err(err);
        }
    }
    Ok(())
}

/// The locks of the region an unwiring walk is in.
struct RegionLocks<'m> {
    region: &'m Region,
    _object: Option<ObjectGuard<'m>>,
    _amap: Option<AnonGuard<'m>>,
}

impl<'m> RegionLocks<'m> {
    fn lock(region: &'m Region) -> Self {
        let amap = region.amap().map(|amap| amap.lock());
        let object = region.object().map(|object| object.lock());
        Self {
            region,
            _object: object,
            _amap: amap,
        }
    }
}

/// Unwires the mapped pages in `start..end`.
///
/// Every mapped page loses one pin. Its mapping loses the wired attribute
/// unless its region is still wired. Regions are locked one at a time, in
/// address order.
pub fn unwire_range(space: &AddressSpace, start: Vaddr, end: Vaddr) {
    let start = page_align_down(start);
    let end = page_align_up(end);
    if start >= end {
        return;
    }

    let env = space.env();
    let mmu = env.mmu();
    let asid = space.asid();
    let map = space.read_regions();
    let mut regions = map.overlapping(start..end);
    let mut current: Option<RegionLocks<'_>> = None;

    for vaddr in (start..end).step_by(PAGE_SIZE) {
        let Some(paddr) = mmu.extract(asid, vaddr) else {
            continue;
        };
        if !current
            .as_ref()
            .is_some_and(|locks| locks.region.range().contains(&vaddr))
        {
            // Unlock the previous region before locking the next one.
            drop(current.take());
            current = regions
                .by_ref()
                .find(|region| region.range().contains(&vaddr))
                .map(RegionLocks::lock);
        }
        let Some(locks) = &current else {
            continue;
        };

        if !locks.region.is_wired() {
            mmu.unwire(asid, vaddr);
        }
        if let Some(frame) = env.allocator().lookup(paddr) {
            if frame.wire_count() > 0 {
                env.queues().unwire(&frame);
            }
        }
    }
}

/// Makes the pages of `range` pageable again, or wires them.
///
/// The regions covering `range` record the request, so that later faults on
/// them keep their mappings wired. Wiring faults with the maximum
/// protection of each region. If it fails, the request is withdrawn and
/// the error is returned.
pub fn map_pageable(space: &AddressSpace, range: Range<Vaddr>, wire: bool) -> Result<()> {
    let start = page_align_down(range.start);
    let end = page_align_up(range.end);
    space.adjust_wiring(start..end, wire)?;
    if !wire {
        unwire_range(space, start, end);
        return Ok(());
    }

    if let Err(err) = wire_range(space, start, end, VmPerms::empty(), true) {
        if let Err(revert) = space.adjust_wiring(start..end, false) {
            warn!("cannot withdraw the wiring of {:#x?}: {}", start..end, revert);
        }
        clear_wired_attr(space, start, end);
        return Err(err);
    }
    Ok(())
}

/// Clears the wired attribute of the mappings in regions that are no
/// longer wired.
fn clear_wired_attr(space: &AddressSpace, start: Vaddr, end: Vaddr) {
    let mmu = space.env().mmu();
    let map = space.read_regions();
    for region in map.overlapping(start..end) {
        if region.is_wired() {
            continue;
        }
        let range = region.range();
        for vaddr in (range.start.max(start)..range.end.min(end)).step_by(PAGE_SIZE) {
            mmu.unwire(space.asid(), vaddr);
        }
    }
}
