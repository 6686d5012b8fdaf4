// SPDX-License-Identifier: MPL-2.0

//! The page-fault engine.
//!
//! A fault runs in attempts. Each attempt starts with no lock held, looks
//! the region up, and goes through the phases below. Any phase may give up
//! with [`FaultError::Restart`] after dropping every lock, and the next
//! attempt starts over.
//!
//! 1. Check ([`check`]): protection, pending private copies, the neighbor
//!    window, and the private pages of the window.
//! 2. Upper lookup ([`upper::lookup`]): maps resident private neighbors and
//!    finds out whether a private page backs the faulting address.
//! 3. Either the upper fault ([`upper::fault`]), which resolves the fault
//!    with that private page, or the lower fault ([`lower::fault`]), which
//!    resolves it with the backing object or a zero-filled page.
//! 4. Enter: installs the mapping and queues or wires the page.
//!
//! Locks are always taken in this order: the region set of the address
//! space, the anonymous layer, the object, then frame metadata.

mod check;
mod context;
mod enter;
mod lower;
mod upper;
mod wire;

pub(crate) use self::{check::copy_private_layer, context::FaultInfo};
pub use self::wire::{map_pageable, unwire_range, wire_range};
use self::context::FaultContext;
use crate::{prelude::*, space::AddressSpace, stats::inc};

bitflags! {
    /// Options of [`resolve_fault`].
    pub struct FaultFlags: u32 {
        /// Wire the page: map exactly the faulting page with its full
        /// protection and pin it against replacement.
        const WIRE     = 1 << 0;
        /// Check the access against the maximum protection of the region
        /// instead of its current protection.
        const MAX_PROT = 1 << 1;
    }
}

/// How a fault attempt ended, if it did not succeed.
#[derive(Debug)]
pub(crate) enum FaultError {
    /// Every lock was dropped; try again from the top.
    Restart,
    /// The fault failed for good.
    Err(Error),
}

impl From<Error> for FaultError {
    fn from(err: Error) -> Self {
        FaultError::Err(err)
    }
}

pub(crate) type FaultResult<T = ()> = core::result::Result<T, FaultError>;

/// Resolves a fault at `vaddr` for an access of type `access`.
///
/// On success the page that backs `vaddr` is mapped with at least the
/// protection the access needs. The fault is retried internally until it
/// succeeds or fails with one of:
///
/// - `EFAULT`, if no region maps `vaddr` or the region has no backing;
/// - `EACCES`, if the region does not allow the access;
/// - `ENOMEM`, if memory is exhausted and nothing can be reclaimed;
/// - an error of a backing store, such as `EIO`.
pub fn resolve_fault(
    space: &AddressSpace,
    vaddr: Vaddr,
    access: VmPerms,
    flags: FaultFlags,
) -> Result<()> {
    let env = space.env();
    inc(&env.stats().faults);
    let vaddr = page_align_down(vaddr);

    let mut ctx = FaultContext::new(access, flags);
    let result = loop {
        ctx.begin_attempt();
        match fault_once(space, vaddr, &mut ctx) {
            Ok(()) => break Ok(()),
            Err(FaultError::Restart) => {
                inc(&env.stats().restarts);
                trace!("fault at {:#x}: restarting", vaddr);
            }
            Err(FaultError::Err(err)) => {
                debug!("fault at {:#x} failed: {}", vaddr, err);
                break Err(err);
            }
        }
    };

    if let Some(anon) = ctx.anon_spare.take() {
        env.release_spare_anon(anon);
    }
    result
}

fn fault_once(space: &AddressSpace, vaddr: Vaddr, ctx: &mut FaultContext) -> FaultResult {
    let (info, map) = FaultInfo::lookup(space, vaddr)?;
    let (mut locks, anons) = check::check(&info, map, ctx)?;
    let (covered, center) = upper::lookup(&info, &mut locks, ctx, &anons);
    match center {
        Some(id) => upper::fault(&info, locks, ctx, id),
        None => lower::fault(&info, locks, ctx, &covered),
    }
}
