// SPDX-License-Identifier: MPL-2.0

//! Faults resolved by the backing object, or by a new zero-filled page.

use super::{
    FaultError, FaultResult,
    context::{FaultContext, FaultInfo, FaultLocks},
    enter::{PromoteSource, install, map_neighbor, promote},
};
use crate::{anon::AnonId, object::VmObject, prelude::*, stats::inc};

/// Resolves a fault that no private page backs.
///
/// `covered` flags the pages of the window that the object must not be
/// asked for.
pub(super) fn fault<'f>(
    info: &'f FaultInfo<'_>,
    mut locks: FaultLocks<'f>,
    ctx: &mut FaultContext,
    covered: &[bool],
) -> FaultResult {
    let region = &info.region;
    let object = region.object();

    let mut center = None;
    if let Some(object) = object {
        locks.object = Some(object.lock());
        center = lookup(info, &mut locks, ctx, covered);
    }

    ctx.promote = object.is_none() || (ctx.cow_now && region.is_copy_on_write());
    trace!(
        "fault at {:#x}: lower, resident {}, promote {}",
        info.vaddr,
        center.is_some(),
        ctx.promote
    );

    if center.is_none() {
        if let Some(object) = object {
            let (relocked, page) = fetch(info, locks, object)?;
            locks = relocked;
            center = Some(page);
        }
    }

    match center {
        Some(page) if !ctx.promote => direct(info, locks, ctx, page),
        page => promote_page(info, locks, ctx, page),
    }
}

/// Maps the resident object neighbors of the faulting page.
///
/// Returns the faulting page, busy, if it is resident and was not busy.
fn lookup(
    info: &FaultInfo<'_>,
    locks: &mut FaultLocks<'_>,
    ctx: &FaultContext,
    covered: &[bool],
) -> Option<Frame> {
    let region = &info.region;
    let guard = locks.object();
    let object = guard.object();
    let pages = guard.get_resident(
        region.object_index(ctx.window.start),
        covered,
        ctx.window.center,
    );

    let mut center = None;
    for (i, page) in pages.into_iter().enumerate() {
        let Some(page) = page else {
            continue;
        };
        if i == ctx.window.center {
            center = Some(page);
            continue;
        }
        let read_only =
            page.is_read_only() || page.loan_count() > 0 || object.needs_write_fault();
        let prot = if read_only || region.is_copy_on_write() {
            ctx.enter_prot.without_write()
        } else {
            ctx.enter_prot
        };
        map_neighbor(info, ctx.window.vaddr(i), &page, prot);
        inc(&info.env.stats().object_neighbors);
    }
    center
}

/// Reads the faulting page from the object with every lock dropped.
///
/// Returns the page busy, with the locks taken again. Restarts if the
/// regions changed, the object let go of the page, or a private page
/// appeared for the address in the meantime.
fn fetch<'f>(
    info: &'f FaultInfo<'_>,
    locks: FaultLocks<'f>,
    object: &'f VmObject,
) -> FaultResult<(FaultLocks<'f>, Frame)> {
    let env = info.env;
    locks.unlock_all();

    let frame = match object.fetch_page(info.region.object_index(info.vaddr)) {
        Ok(frame) => frame,
        Err(err) if err.error() == Errno::EAGAIN => {
            inc(&env.stats().pager_retries);
            debug!("fault at {:#x}: backing store busy", info.vaddr);
            env.backoff();
            return Err(FaultError::Restart);
        }
        Err(err) => {
            warn!("fault at {:#x}: backing store failed: {}", info.vaddr, err);
            return Err(err.into());
        }
    };

    let map = info.relock();
    let amap = if map.is_some() {
        info.lock_amap()
    } else {
        None
    };
    let mut guard = object.lock();

    let shadowed = amap
        .as_ref()
        .is_some_and(|amap| amap.lookup(info.region.amap_slot(info.vaddr)).is_some());
    if map.is_none() || frame.is_released() || shadowed {
        debug!("fault at {:#x}: state changed during the read", info.vaddr);
        guard.release_busy(frame);
        return Err(FaultError::Restart);
    }

    env.queues().activate(&frame);
    let locks = FaultLocks {
        object: Some(guard),
        amap,
        map,
    };
    Ok((locks, frame))
}

/// Maps the busy object page `page` itself.
fn direct(
    info: &FaultInfo<'_>,
    mut locks: FaultLocks<'_>,
    ctx: &mut FaultContext,
    page: Frame,
) -> FaultResult {
    let env = info.env;
    inc(&env.stats().object_direct);
    let mut page = page;
    if page.loan_count() > 0 {
        if !ctx.cow_now {
            // Borrowers must not see writes to the object.
            ctx.enter_prot -= VmPerms::WRITE;
        } else {
            match locks.object().break_loan(page.clone()) {
                Some(copy) => page = copy,
                None => {
                    locks.object().release_busy(page);
                    locks.unlock_all();
                    env.wait_for_memory()?;
                    return Err(FaultError::Restart);
                }
            }
        }
    }
    if ctx.cow_now {
        // The write reaches the object, which backs the page for writing
        // from now on.
        locks.object().object().mark_written();
        page.set_read_only(false);
    }
    if info.region.is_copy_on_write() || locks.object().object().needs_write_fault() {
        ctx.enter_prot -= VmPerms::WRITE;
    }
    enter(info, locks, ctx, None, page)
}

/// Puts a new private page, copied from the busy object page `page` or
/// zero-filled, in front of the object.
fn promote_page(
    info: &FaultInfo<'_>,
    locks: FaultLocks<'_>,
    ctx: &mut FaultContext,
    page: Option<Frame>,
) -> FaultResult {
    let env = info.env;
    let source = match &page {
        Some(page) => {
            inc(&env.stats().object_copy);
            PromoteSource::Object(page)
        }
        None => {
            inc(&env.stats().zero_fill);
            PromoteSource::Zero
        }
    };
    let slot = info.region.amap_slot(info.vaddr);
    let (mut locks, id, frame) = promote(info, locks, ctx, slot, source)?;

    if let Some(page) = page {
        if locks.amap().layer().is_shared() {
            // Other regions share the layer and may still map the object
            // page. They must fault again to find the new private page.
            env.mmu().page_protect(&page, VmPerms::empty());
        }
        locks.object().release_busy(page);
    }
    enter(info, locks, ctx, Some(id), frame)
}

/// Maps the faulting page and queues or wires it.
///
/// `anon` is the new private page that holds `frame`, or `None` if `frame`
/// is the object's page.
fn enter(
    info: &FaultInfo<'_>,
    mut locks: FaultLocks<'_>,
    ctx: &FaultContext,
    anon: Option<AnonId>,
    frame: Frame,
) -> FaultResult {
    let env = info.env;
    let prot = if frame.is_read_only() {
        ctx.enter_prot.without_write()
    } else {
        ctx.enter_prot
    };

    if let Err(err) = install(info, ctx, &frame, prot) {
        env.queues().enqueue(&frame);
        settle(&mut locks, anon, frame);
        locks.unlock_all();
        debug!("fault at {:#x}: mapping failed: {}", info.vaddr, err);
        env.wait_for_memory()?;
        return Err(FaultError::Restart);
    }

    if ctx.wire_paging() {
        env.queues().wire(&frame);
    } else {
        env.queues().activate(&frame);
    }
    let object = locks.object.as_ref().map(|guard| guard.object());
    settle(&mut locks, anon, frame);
    locks.unlock_all();

    if ctx.wire_paging() && anon.is_none() {
        // A wired page never goes to swap again.
        if let Some(object) = object {
            object.drop_swap(info.region.object_index(info.vaddr));
        }
    }
    trace!("fault at {:#x}: mapped with {:?}", info.vaddr, prot);
    Ok(())
}

/// Lets go of the busy faulting page.
fn settle(locks: &mut FaultLocks<'_>, anon: Option<AnonId>, frame: Frame) {
    match anon {
        Some(_) => frame.unbusy(),
        None => locks.object().release_busy(frame),
    }
}
