// SPDX-License-Identifier: MPL-2.0

//! Faults resolved by a private page of the anonymous layer.

use smallvec::{SmallVec, smallvec};

use super::{
    FaultError, FaultResult,
    context::{FaultContext, FaultInfo, FaultLocks},
    enter::{PromoteSource, install, map_neighbor, promote},
};
use crate::{
    advice::MAX_WINDOW,
    anon::AnonId,
    env::SWAP_SLOT_BAD,
    frame::FrameOwner,
    prelude::*,
    stats::inc,
};

/// Which pages of the window the lower fault must leave alone.
pub(super) type Covered = SmallVec<[bool; MAX_WINDOW]>;

/// Maps the resident private neighbors of the faulting page.
///
/// Returns the pages of the window that are already mapped or backed by a
/// private page, and the private page of the faulting page, if it has one.
pub(super) fn lookup(
    info: &FaultInfo<'_>,
    locks: &mut FaultLocks<'_>,
    ctx: &FaultContext,
    anons: &[Option<AnonId>],
) -> (Covered, Option<AnonId>) {
    let mmu = info.env.mmu();
    let asid = info.space.asid();
    let mut covered: Covered = smallvec![false; anons.len()];
    let mut center = None;

    for (i, slot) in anons.iter().enumerate() {
        let vaddr = ctx.window.vaddr(i);
        if i == ctx.window.center {
            if let Some(id) = slot {
                covered[i] = true;
                center = Some(*id);
            }
            continue;
        }
        if mmu.extract(asid, vaddr).is_some() {
            covered[i] = true;
            continue;
        }
        let Some(id) = slot else {
            continue;
        };
        covered[i] = true;

        let anon = locks.amap().anon(*id);
        let Some(frame) = anon.page() else {
            continue;
        };
        if frame.loan_count() > 0 || frame.is_busy() {
            continue;
        }
        let prot = if anon.refs() > 1 {
            ctx.enter_prot.without_write()
        } else {
            ctx.enter_prot
        };
        map_neighbor(info, vaddr, frame, prot);
        inc(&info.env.stats().anon_neighbors);
    }

    (covered, center)
}

/// Resolves the fault with the private page `id` of the faulting page.
pub(super) fn fault<'f>(
    info: &'f FaultInfo<'_>,
    locks: FaultLocks<'f>,
    ctx: &mut FaultContext,
    id: AnonId,
) -> FaultResult {
    let slot = info.region.amap_slot(info.vaddr);
    inc(&info.env.stats().anon_gets);
    let mut locks = anon_get(info, locks, slot, id)?;

    let Some(mut frame) = locks.amap().anon(id).page().cloned() else {
        panic!("private page {} is not resident after it was paged in", id);
    };

    if frame.loan_count() > 0 {
        if !ctx.cow_now {
            // The object still owns the page; do not let writes reach it.
            ctx.enter_prot -= VmPerms::WRITE;
        } else if locks.amap().anon(id).refs() == 1 {
            let (relocked, owned) = break_anon_loan(info, locks, id, frame)?;
            locks = relocked;
            frame = owned;
        }
    }

    if ctx.cow_now && locks.amap().anon(id).refs() > 1 {
        inc(&info.env.stats().anon_cow);
        let (mut locks, new_id, new_frame) =
            promote(info, locks, ctx, slot, PromoteSource::Anon(&frame))?;
        // The slot now holds the copy. Other slots still hold the original.
        let left = locks.amap().anon_mut(id).drop_ref();
        debug_assert!(left > 0);
        trace!("fault at {:#x}: copied shared private page", info.vaddr);
        return enter(info, locks, ctx, new_id, new_frame, true);
    }

    inc(&info.env.stats().anon_direct);
    if locks.amap().anon(id).refs() > 1 {
        ctx.enter_prot -= VmPerms::WRITE;
    }
    enter(info, locks, ctx, id, frame, false)
}

/// Makes the private page `id` resident and not busy.
///
/// Drops every lock to wait for a busy page or to read the page from swap.
/// Restarts if the page left its slot in the meantime.
fn anon_get<'f>(
    info: &'f FaultInfo<'_>,
    mut locks: FaultLocks<'f>,
    slot: usize,
    id: AnonId,
) -> FaultResult<FaultLocks<'f>> {
    let env = info.env;
    loop {
        let anon = locks.amap().anon(id);
        let page = anon.page().cloned();
        let swap_slot = anon.swap_slot().unwrap_or(SWAP_SLOT_BAD);

        if let Some(frame) = page {
            if !frame.is_busy() {
                return Ok(locks);
            }
            if !frame.want() {
                continue;
            }
            locks.unlock_all();
            inc(&env.stats().page_waits);
            trace!("fault at {:#x}: waiting for a busy private page", info.vaddr);
            frame.wait_unbusy();

            locks = relock_slot(info, slot, id)?;
            continue;
        }

        let Some(frame) = env.allocator().alloc(false) else {
            locks.unlock_all();
            env.wait_for_memory()?;
            return Err(FaultError::Restart);
        };
        frame.set_owner(FrameOwner::Anon);
        locks.amap().anon_mut(id).set_page(frame.clone());
        locks.unlock_all();

        inc(&env.stats().swap_ins);
        let result = env.swap_in(swap_slot, &frame);

        let map = info.relock();
        let Some(mut amap) = info.lock_amap() else {
            panic!("a region lost its anonymous layer");
        };
        if frame.is_released() {
            // The last reference went away during the read.
            amap.release(id);
            inc(&env.stats().released_pages);
            return Err(FaultError::Restart);
        }

        if let Err(err) = result {
            let transient = err.error() == Errno::EAGAIN;
            let anon = amap.anon_mut(id);
            anon.take_page();
            if !transient {
                anon.set_swap_slot(SWAP_SLOT_BAD);
            }
            drop(amap);
            drop(map);
            env.free_frame(frame);
            if transient {
                inc(&env.stats().pager_retries);
                env.backoff();
                return Err(FaultError::Restart);
            }
            warn!("swap slot {:#x} failed: {}", swap_slot, err);
            env.mark_swap_bad(swap_slot);
            return Err(err.into());
        }

        env.queues().activate(&frame);
        frame.unbusy();
        if map.is_none() || amap.lookup(slot) != Some(id) {
            return Err(FaultError::Restart);
        }
        locks = FaultLocks {
            object: None,
            amap: Some(amap),
            map,
        };
    }
}

/// Locks the region set and the anonymous layer again, and checks that
/// `slot` still holds the private page `id`.
fn relock_slot<'f>(
    info: &'f FaultInfo<'_>,
    slot: usize,
    id: AnonId,
) -> FaultResult<FaultLocks<'f>> {
    let Some(map) = info.relock() else {
        return Err(FaultError::Restart);
    };
    let amap = info.lock_amap();
    if amap.as_ref().and_then(|amap| amap.lookup(slot)) != Some(id) {
        return Err(FaultError::Restart);
    }
    Ok(FaultLocks {
        object: None,
        amap,
        map: Some(map),
    })
}

/// Gives the private page `id` a frame of its own instead of the one it
/// borrows from an object.
///
/// A sole borrower takes the frame over from the object. Otherwise the
/// private page switches to a copy.
fn break_anon_loan<'f>(
    info: &FaultInfo<'_>,
    mut locks: FaultLocks<'f>,
    id: AnonId,
    frame: Frame,
) -> FaultResult<(FaultLocks<'f>, Frame)> {
    let env = info.env;
    if frame.loan_count() == 1 && take_over(info, &frame) {
        frame.set_owner(FrameOwner::Anon);
        env.queues().activate(&frame);
        inc(&env.stats().loan_breaks);
        trace!("fault at {:#x}: took a lent page over", info.vaddr);
        return Ok((locks, frame));
    }

    let Some(copy) = env.allocator().alloc(false) else {
        locks.unlock_all();
        env.wait_for_memory()?;
        return Err(FaultError::Restart);
    };
    copy.copy_from(&frame);
    env.mmu().page_protect(&frame, VmPerms::empty());
    if frame.drop_loan() == 0 && matches!(frame.owner(), FrameOwner::None) {
        env.free_frame(frame);
    }
    copy.set_owner(FrameOwner::Anon);
    locks.amap().anon_mut(id).set_page(copy.clone());
    env.queues().activate(&copy);
    copy.unbusy();
    inc(&env.stats().loan_breaks);
    trace!("fault at {:#x}: copied a lent page", info.vaddr);
    Ok((locks, copy))
}

/// Takes a frame lent by one borrower away from its object.
///
/// Fails if the object is busy with the frame, or if the frame holds data
/// that its backing store does not have yet: the object must keep it.
fn take_over(info: &FaultInfo<'_>, frame: &Frame) -> bool {
    let env = info.env;
    match frame.owner_object() {
        Some(object) => {
            let mut guard = object.lock();
            let index = frame.object_index();
            if frame.is_busy()
                || frame.is_dirty()
                || index.and_then(|index| guard.page(index)) != Some(frame)
            {
                return false;
            }
            guard.surrender(frame);
            env.mmu().page_protect(frame, VmPerms::empty());
            frame.drop_loan();
            true
        }
        None if matches!(frame.owner(), FrameOwner::None) => {
            frame.drop_loan();
            true
        }
        None => false,
    }
}

/// Maps the private page of the faulting page and queues or wires it.
fn enter(
    info: &FaultInfo<'_>,
    mut locks: FaultLocks<'_>,
    ctx: &FaultContext,
    id: AnonId,
    frame: Frame,
    busy: bool,
) -> FaultResult {
    let env = info.env;
    if let Err(err) = install(info, ctx, &frame, ctx.enter_prot) {
        env.queues().enqueue(&frame);
        if busy {
            frame.unbusy();
        }
        locks.unlock_all();
        debug!("fault at {:#x}: mapping failed: {}", info.vaddr, err);
        env.wait_for_memory()?;
        return Err(FaultError::Restart);
    }

    if ctx.wire_paging() {
        env.queues().wire(&frame);
        // A wired page never goes to swap again.
        if let Some(swap_slot) = locks.amap().anon_mut(id).take_swap_slot() {
            env.release_swap(swap_slot);
        }
    } else {
        env.queues().activate(&frame);
    }
    if busy {
        frame.unbusy();
    }
    locks.unlock_all();
    Ok(())
}
