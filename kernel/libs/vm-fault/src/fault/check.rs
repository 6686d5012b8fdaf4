// SPDX-License-Identifier: MPL-2.0

use smallvec::{SmallVec, smallvec};

use super::{
    FaultError, FaultResult,
    context::{FaultContext, FaultInfo, FaultLocks, FaultWindow},
};
use crate::{
    advice::{Advice, AdviceWindow, MAX_WINDOW},
    anon::{AnonGuard, AnonId},
    prelude::*,
    space::{AddressSpace, RegionMap},
    stats::inc,
};

/// The private pages of a fault window, by position in the window.
pub(super) type AnonWindow = SmallVec<[Option<AnonId>; MAX_WINDOW]>;

/// Checks the access, settles pending private copies, and collects the
/// private pages of the window.
///
/// On success the region set and the anonymous layer, if any, are locked.
pub(super) fn check<'f>(
    info: &'f FaultInfo<'_>,
    map: RwLockReadGuard<'f, RegionMap>,
    ctx: &mut FaultContext,
) -> FaultResult<(FaultLocks<'f>, AnonWindow)> {
    let region = &info.region;
    let check_prot = if ctx.use_max_prot() {
        region.max_prot()
    } else {
        region.prot()
    };
    if !check_prot.contains(ctx.access_type) {
        return Err(
            Error::with_message(Errno::EACCES, "access exceeds the region protection").into(),
        );
    }

    ctx.enter_prot = region.prot();
    ctx.wire_mapping |= region.is_wired();
    if ctx.wire_mapping {
        // Wired pages are fully resolved up front, so later accesses never
        // fault on them.
        ctx.access_type = check_prot;
        ctx.cow_now = check_prot.contains(VmPerms::WRITE);
    } else {
        ctx.cow_now = ctx.access_type.contains(VmPerms::WRITE);
    }

    if region.needs_copy() {
        if ctx.cow_now || region.object().is_none() {
            drop(map);
            copy_private_layer(info.space, info.vaddr);
            inc(&info.env.stats().amap_copies);
            trace!("fault at {:#x}: made a private layer", info.vaddr);
            return Err(FaultError::Restart);
        }
        // The layer is not ours yet; a later write faults again.
        ctx.enter_prot -= VmPerms::WRITE;
    }

    if region.amap().is_none() && region.object().is_none() {
        return Err(Error::with_message(Errno::EFAULT, "the region has no backing").into());
    }

    let window = if ctx.narrow {
        AdviceWindow::new(0, 0)
    } else {
        info.env.advice_window(region.advice())
    };
    let range = region.range();
    let nback = window.nback.min((info.vaddr - range.start) / PAGE_SIZE);
    let nforw = window.nforw.min((range.end - info.vaddr) / PAGE_SIZE - 1);
    ctx.window = FaultWindow {
        start: info.vaddr - nback * PAGE_SIZE,
        npages: nback + nforw + 1,
        center: nback,
    };
    ctx.narrow = true;

    let amap = info.lock_amap();
    let mut anons: AnonWindow = match &amap {
        Some(amap) => amap.lookups(region.amap_slot(ctx.window.start), ctx.window.npages),
        None => smallvec![None; ctx.window.npages],
    };

    if region.advice() == Advice::Sequential && nback > 0 {
        deactivate_behind(info, amap.as_ref(), &anons[..nback], ctx.window.start);
        anons.drain(..nback);
        ctx.window.start = info.vaddr;
        ctx.window.npages -= nback;
        ctx.window.center = 0;
    }

    let locks = FaultLocks {
        object: None,
        amap,
        map: Some(map),
    };
    Ok((locks, anons))
}

/// Moves the idle pages behind a sequential fault to the inactive queue.
fn deactivate_behind(
    info: &FaultInfo<'_>,
    amap: Option<&AnonGuard<'_>>,
    behind: &[Option<AnonId>],
    start: Vaddr,
) {
    let queues = info.env.queues();
    if let Some(amap) = amap {
        for id in behind.iter().flatten() {
            let Some(frame) = amap.anon(*id).page() else {
                continue;
            };
            if frame.loan_count() == 0 && !frame.is_busy() && frame.wire_count() == 0 {
                queues.deactivate(frame);
            }
        }
    }
    if let Some(object) = info.lock_object() {
        object.deactivate_range(info.region.object_index(start), behind.len());
    }
}

/// Gives the region at `vaddr` its own anonymous layer.
///
/// Takes the region set for writing, so faults that dropped their locks
/// restart.
pub(crate) fn copy_private_layer(space: &AddressSpace, vaddr: Vaddr) {
    let mut map = space.write_regions();
    let Some(region) = map.find_mut(vaddr) else {
        return;
    };
    if region.needs_copy() {
        region.amap_copy(space.env());
    }
}
