// SPDX-License-Identifier: MPL-2.0

//! Pieces shared by the upper and lower fault paths.

use super::{
    FaultError, FaultResult,
    context::{FaultContext, FaultInfo, FaultLocks},
};
use crate::{anon::AnonId, frame::FrameOwner, mmu::MapFlags, prelude::*};

/// Installs the mapping of the faulting page.
pub(super) fn install(
    info: &FaultInfo<'_>,
    ctx: &FaultContext,
    frame: &Frame,
    prot: VmPerms,
) -> Result<()> {
    let env = info.env;
    let asid = info.space.asid();
    let mut flags = MapFlags::CAN_FAIL;
    if ctx.wire_mapping {
        flags |= MapFlags::WIRED;
    }
    // A wired translation that moves to another frame takes its pin along.
    let displaced = env
        .mmu()
        .query(asid, info.vaddr)
        .filter(|old| old.wired && old.frame != *frame && old.frame.wire_count() > 0);

    env.mmu()
        .enter(asid, info.vaddr, frame, prot, ctx.access_type, flags)?;
    if prot.contains(VmPerms::WRITE) {
        frame.set_dirty(true);
    }
    if let Some(old) = displaced {
        env.queues().unwire(&old.frame);
        if ctx.wire_mapping {
            env.queues().wire(frame);
        }
        trace!("fault at {:#x}: moved the pin to the new page", info.vaddr);
    }
    Ok(())
}

/// Maps a resident neighbor of the faulting page, if the MMU has room.
pub(super) fn map_neighbor(info: &FaultInfo<'_>, vaddr: Vaddr, frame: &Frame, prot: VmPerms) {
    info.env.queues().enqueue(frame);
    match info.env.mmu().enter(
        info.space.asid(),
        vaddr,
        frame,
        prot,
        VmPerms::empty(),
        MapFlags::CAN_FAIL,
    ) {
        Ok(()) if prot.contains(VmPerms::WRITE) => frame.set_dirty(true),
        Ok(()) => {}
        Err(err) => trace!("neighbor {:#x} not mapped: {}", vaddr, err),
    }
}

/// What a new private page is filled with.
pub(super) enum PromoteSource<'p> {
    Zero,
    /// A busy page of the object.
    Object(&'p Frame),
    /// The page of a shared private page.
    Anon(&'p Frame),
}

/// Puts a new private page, filled from `source`, into `slot` of the locked
/// anonymous layer.
///
/// Returns the private page and its frame, which is busy. The private page
/// that held the slot before, if any, must be settled by the caller.
///
/// If memory runs out, every lock is dropped, the busy object page of
/// `source` is let go, and the fault waits for memory and restarts. An
/// allocated private page is kept for the next attempt.
pub(super) fn promote<'f>(
    info: &FaultInfo<'_>,
    mut locks: FaultLocks<'f>,
    ctx: &mut FaultContext,
    slot: usize,
    source: PromoteSource<'_>,
) -> FaultResult<(FaultLocks<'f>, AnonId, Frame)> {
    let env = info.env;
    let Some(mut anon) = ctx.anon_spare.take().or_else(|| env.alloc_anon()) else {
        give_up(locks, &source);
        return Err(Error::with_message(Errno::ENOMEM, "too many private pages").into());
    };
    let Some(frame) = env
        .allocator()
        .alloc(matches!(source, PromoteSource::Zero))
    else {
        ctx.anon_spare = Some(anon);
        give_up(locks, &source);
        env.wait_for_memory()?;
        return Err(FaultError::Restart);
    };

    match source {
        PromoteSource::Zero => {}
        PromoteSource::Object(page) | PromoteSource::Anon(page) => frame.copy_from(page),
    }
    frame.set_owner(FrameOwner::Anon);
    anon.set_page(frame.clone());
    let id = locks.amap().add(slot, anon);
    Ok((locks, id, frame))
}

fn give_up(mut locks: FaultLocks<'_>, source: &PromoteSource<'_>) {
    if let PromoteSource::Object(page) = source {
        locks.object().release_busy((*page).clone());
    }
    locks.unlock_all();
}
