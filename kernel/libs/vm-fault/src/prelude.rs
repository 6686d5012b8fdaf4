// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::{
    fmt::Debug,
    ops::Range,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

pub(crate) use bitflags::bitflags;
pub(crate) use log::{debug, trace, warn};
pub(crate) use spin::{
    Mutex as SpinLock, MutexGuard as SpinLockGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

pub(crate) use crate::{
    error::{Errno, Error, Result},
    frame::{Frame, PAGE_SIZE, Paddr, Vaddr},
    perms::VmPerms,
    return_errno, return_errno_with_message,
};

/// Rounds `addr` down to a page boundary.
pub(crate) const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to a page boundary.
pub(crate) const fn page_align_up(addr: usize) -> usize {
    page_align_down(addr + PAGE_SIZE - 1)
}

pub(crate) const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}
