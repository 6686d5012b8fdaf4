// SPDX-License-Identifier: MPL-2.0

//! Page-fault resolution for a two-layer virtual memory system.
//!
//! An [`AddressSpace`] is an ordered set of regions. Each region may be backed
//! by a private anonymous layer ([`AnonLayer`]) that holds copy-on-write pages,
//! by a shared [`VmObject`], or by both. When a thread touches an address that
//! has no usable hardware mapping, [`resolve_fault`] finds or creates the page
//! that must back it and installs the mapping through the [`Mmu`].
//!
//! The engine never holds a lock while it blocks. Before waiting on a busy
//! frame, a pager, the swap store, or the allocator, it drops every lock it
//! holds and re-validates what it saw once it relocks. Anything that changed
//! in the meantime restarts the fault from the top.
//!
//! The collaborators are traits so that the engine can be embedded in a
//! kernel; the crate ships [`SoftMmu`], [`FramePool`] and [`ZeroStore`] as
//! reference implementations that are also used by the tests.
//!
//! # Example
//!
//! ```
//! use vm_fault::{
//!     resolve_fault, AddressSpace, FaultFlags, FramePool, MapOptions, SoftMmu, VmEnvOptions,
//!     VmPerms, PAGE_SIZE,
//! };
//! use std::sync::Arc;
//!
//! let env = VmEnvOptions::new(Arc::new(FramePool::new(64)), Arc::new(SoftMmu::new()))
//!     .build()
//!     .unwrap();
//! let space = AddressSpace::new(&env);
//! space
//!     .map(MapOptions::new(0x10000, 4 * PAGE_SIZE, VmPerms::READ | VmPerms::WRITE))
//!     .unwrap();
//!
//! resolve_fault(&space, 0x10000, VmPerms::WRITE, FaultFlags::empty()).unwrap();
//! assert!(space.query(0x10000).is_some());
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod advice;
mod anon;
mod env;
mod error;
mod fault;
mod frame;
mod loan;
mod mmu;
mod object;
mod perms;
mod pool;
mod prelude;
mod queue;
mod space;
mod stats;
mod store;
mod wait;

#[cfg(test)]
mod test;

pub use self::{
    advice::{Advice, AdviceWindow, MAX_WINDOW},
    anon::{AnonId, AnonInfo, AnonLayer},
    env::{VmEnv, VmEnvOptions},
    error::{Errno, Error, Result},
    fault::{FaultFlags, map_pageable, resolve_fault, unwire_range, wire_range},
    frame::{Frame, FrameFlags, FrameOwner, FrameState, PAGE_SIZE, PageQueue, Paddr, Vaddr},
    loan::loan_to_anon,
    mmu::{AsId, MapFlags, MappingInfo, Mmu, SoftMmu},
    object::{ObjectFlags, VmObject},
    perms::VmPerms,
    pool::{FrameAllocator, FramePool},
    queue::{PageQueues, QueueCounts},
    space::{AddressSpace, Inherit, MapOptions, RegionFlags, RegionInfo},
    stats::{FaultStats, FaultStatsSnapshot},
    store::{BackingStore, ZeroStore},
    wait::WaitQueue,
};
