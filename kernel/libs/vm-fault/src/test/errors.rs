// SPDX-License-Identifier: MPL-2.0

use super::{FileStore, Machine, RW, first_byte};
use crate::{FaultFlags, MapOptions, fault::copy_private_layer, prelude::*, resolve_fault};

const BASE: Vaddr = 0x10000;

#[test]
fn access_outside_regions() {
    let m = Machine::new(8);
    let space = m.anon_space(BASE, 1);

    let err = resolve_fault(&space, BASE + PAGE_SIZE, VmPerms::READ, FaultFlags::empty())
        .unwrap_err();
    assert_eq!(err.error(), Errno::EFAULT);
    let err = resolve_fault(&space, 0, VmPerms::READ, FaultFlags::empty()).unwrap_err();
    assert_eq!(err.error(), Errno::EFAULT);
    assert_eq!(m.env.stats().snapshot().faults, 2);
}

#[test]
fn access_beyond_protection() {
    let m = Machine::new(8);
    let space = m.space();
    space
        .map(MapOptions::new(BASE, PAGE_SIZE, VmPerms::READ).max_perms(RW))
        .unwrap();

    let err = resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::empty()).unwrap_err();
    assert_eq!(err.error(), Errno::EACCES);
    let err = resolve_fault(&space, BASE, VmPerms::EXEC, FaultFlags::MAX_PROT).unwrap_err();
    assert_eq!(err.error(), Errno::EACCES);
    assert!(space.query(BASE).is_none());

    // The maximum protection allows the access, but the mapping keeps the
    // current protection.
    resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::MAX_PROT).unwrap();
    assert_eq!(space.query(BASE).unwrap().prot, VmPerms::READ);
}

#[test]
fn transient_pager_failure_is_retried() {
    let m = Machine::new(8);
    let (object, store) = m.file();
    let space = m.space();
    space
        .map(MapOptions::new(BASE, PAGE_SIZE, RW).object(object.clone(), 0))
        .unwrap();
    store.fail_with(&[Errno::EAGAIN, Errno::EAGAIN]);

    resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()).unwrap();
    assert_eq!(store.fetches(), 3);
    assert_eq!(first_byte(&space, BASE), FileStore::byte(0));

    let stats = m.env.stats().snapshot();
    assert_eq!(stats.pager_retries, 2);
    assert_eq!(stats.restarts, 2);
    assert_eq!(m.pool.in_use(), 1);
}

#[test]
fn pager_error_fails_the_fault() {
    let m = Machine::new(8);
    let (object, store) = m.file();
    let space = m.space();
    space
        .map(MapOptions::new(BASE, PAGE_SIZE, RW).object(object.clone(), 0))
        .unwrap();
    store.fail_with(&[Errno::EIO]);

    let err = resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()).unwrap_err();
    assert_eq!(err.error(), Errno::EIO);
    assert!(object.resident_page(0).is_none());
    assert!(space.query(BASE).is_none());
    assert_eq!(m.pool.in_use(), 0);

    resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()).unwrap();
    assert_eq!(store.fetches(), 2);
}

#[test]
fn swap_error_marks_the_slot_bad() {
    let m = Machine::new(8);
    let space = m.anon_space(BASE, 1);
    copy_private_layer(&space, BASE);
    let amap = space.region_at(BASE).unwrap().amap().unwrap().clone();
    amap.insert_swapped(0, 6);

    let err = resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()).unwrap_err();
    assert_eq!(err.error(), Errno::EIO);
    assert_eq!(m.swap.bad(), vec![6]);
    let anon = amap.anon_at(0).unwrap();
    assert!(anon.frame.is_none());
    assert_eq!(anon.swap_slot, Some(usize::MAX));
    assert_eq!(m.pool.in_use(), 0);

    // The slot is known to be bad; nothing is read from swap any more.
    m.swap.store(6, 0x11);
    let err = resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()).unwrap_err();
    assert_eq!(err.error(), Errno::EIO);
    assert_eq!(m.swap.bad(), vec![6]);
}

#[test]
fn transient_swap_failure_is_retried() {
    let m = Machine::new(8);
    let space = m.anon_space(BASE, 1);
    copy_private_layer(&space, BASE);
    let amap = space.region_at(BASE).unwrap().amap().unwrap().clone();
    amap.insert_swapped(0, 2);
    m.swap.store(2, 0x33);
    m.swap.fail_with(&[Errno::EAGAIN]);

    resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::empty()).unwrap();
    assert_eq!(first_byte(&space, BASE), 0x33);
    assert!(m.swap.bad().is_empty());
    assert_eq!(m.env.stats().snapshot().swap_ins, 2);
    assert_eq!(m.pool.in_use(), 1);
}

#[test]
fn transient_shortages_converge() {
    let m = Machine::new(8);
    let space = m.anon_space(BASE, 1);
    m.pool.fail_next(1);
    m.mmu.fail_next_enters(2);

    resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::empty()).unwrap();

    assert_eq!(space.query(BASE).unwrap().prot, RW);
    assert_eq!(m.env.live_anons(), 1);
    assert_eq!(m.pool.in_use(), 1);
    assert_eq!(m.pool.nr_waits(), 3);
    let stats = m.env.stats().snapshot();
    assert_eq!(stats.no_ram, 3);
    assert_eq!(stats.restarts, 4);
}

#[test]
fn exhausted_memory_releases_the_spare_page() {
    let m = Machine::new(1);
    let space = m.anon_space(BASE, 2);
    resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::empty()).unwrap();

    let err = resolve_fault(&space, BASE + PAGE_SIZE, VmPerms::WRITE, FaultFlags::empty())
        .unwrap_err();
    assert_eq!(err.error(), Errno::ENOMEM);
    assert_eq!(m.env.live_anons(), 1);
    assert!(space.query(BASE + PAGE_SIZE).is_none());
}

#[test]
fn private_page_limit_fails_at_once() {
    let m = Machine::with_options(8, |options| options.anon_limit(1));
    let space = m.anon_space(BASE, 2);
    resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::empty()).unwrap();

    let err = resolve_fault(&space, BASE + PAGE_SIZE, VmPerms::WRITE, FaultFlags::empty())
        .unwrap_err();
    assert_eq!(err.error(), Errno::ENOMEM);
    assert_eq!(m.pool.nr_waits(), 0);
    assert_eq!(m.pool.in_use(), 1);
}
