// SPDX-License-Identifier: MPL-2.0

use std::thread;

use super::{FileStore, Machine, RW, first_byte};
use crate::{
    AddressSpace, FaultFlags, MapOptions, VmObject, fault::copy_private_layer, prelude::*,
    resolve_fault, wire_range,
};

const BASE: Vaddr = 0x10000;

fn map_shared(m: &Machine, object: &Arc<VmObject>, npages: usize) -> Arc<AddressSpace> {
    let space = m.space();
    space
        .map(MapOptions::new(BASE, npages * PAGE_SIZE, RW).object(object.clone(), 0))
        .unwrap();
    space
}

/// Returns a check of whether the space, its layer at [`BASE`] or the object
/// is locked.
fn locks_held(
    space: &Arc<AddressSpace>,
    object: Option<&Arc<VmObject>>,
) -> impl Fn() -> bool + Send + Sync + 'static {
    let space = Arc::downgrade(space);
    let object = object.map(Arc::downgrade);
    move || {
        let space_locked = space.upgrade().is_some_and(|space| {
            space.is_locked()
                || space
                    .region_at(BASE)
                    .and_then(|region| region.amap().map(|amap| amap.is_locked()))
                    .unwrap_or(false)
        });
        let object_locked = object
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|object| object.is_locked());
        space_locked || object_locked
    }
}

#[test]
fn no_lock_is_held_while_reading() {
    let m = Machine::new(16);
    let (object, store) = m.file();
    let space = m.space();
    space
        .map(
            MapOptions::new(BASE, 4 * PAGE_SIZE, RW)
                .object(object.clone(), 0)
                .copy_on_write(),
        )
        .unwrap();
    store.set_lock_check(locks_held(&space, Some(&object)));

    store.close();
    let faulter = {
        let space = space.clone();
        thread::spawn(move || resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::empty()))
    };
    store.wait_blocked(1);

    // Another thread can change the regions while the fault waits.
    assert!(!space.is_locked());
    space.map(MapOptions::new(0x40000, PAGE_SIZE, RW)).unwrap();
    store.open();

    faulter.join().unwrap().unwrap();
    assert_eq!(store.locked_fetches(), 0);
    assert!(store.fetches() >= 1);
    assert_eq!(first_byte(&space, BASE), FileStore::byte(0));
}

#[test]
fn concurrent_faults_share_one_read() {
    let m = Machine::new(16);
    let (object, store) = m.file();
    let space = map_shared(&m, &object, 1);
    store.set_lock_check(locks_held(&space, Some(&object)));

    store.close();
    let first = {
        let space = space.clone();
        thread::spawn(move || resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()))
    };
    store.wait_blocked(1);
    let second = {
        let space = space.clone();
        thread::spawn(move || resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()))
    };
    while m.env.stats().snapshot().page_waits == 0 {
        thread::yield_now();
    }
    // One fault reads the page and the other waits for it. Neither holds
    // a lock.
    assert!(!locks_held(&space, Some(&object))());
    store.open();

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    assert_eq!(store.fetches(), 1);
    assert_eq!(store.locked_fetches(), 0);
    assert_eq!(space.query(BASE).unwrap().frame, object.resident_page(0).unwrap());
}

#[test]
fn no_lock_is_held_while_swapping_in() {
    let m = Machine::new(16);
    let space = m.anon_space(BASE, 1);
    copy_private_layer(&space, BASE);
    let amap = space.region_at(BASE).unwrap().amap().unwrap().clone();
    amap.insert_swapped(0, 3);
    m.swap.store(3, 0x5a);
    m.swap.set_lock_check(locks_held(&space, None));

    m.swap.close();
    let reader = {
        let space = space.clone();
        thread::spawn(move || resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()))
    };
    m.swap.wait_blocked(1);
    let writer = {
        let space = space.clone();
        thread::spawn(move || resolve_fault(&space, BASE, VmPerms::WRITE, FaultFlags::empty()))
    };
    while m.env.stats().snapshot().page_waits == 0 {
        thread::yield_now();
    }
    // The writer waits for the busy private page with every lock dropped.
    assert!(!space.is_locked());
    assert!(!amap.is_locked());
    m.swap.open();

    reader.join().unwrap().unwrap();
    writer.join().unwrap().unwrap();
    assert_eq!(m.swap.locked_fetches(), 0);
    assert_eq!(m.env.stats().snapshot().swap_ins, 1);
    assert_eq!(first_byte(&space, BASE), 0x5a);
    assert_eq!(space.query(BASE).unwrap().prot, RW);
}

#[test]
fn page_discarded_during_read_is_read_again() {
    let m = Machine::new(16);
    let (object, store) = m.file();
    let space = map_shared(&m, &object, 1);

    store.close();
    let faulter = {
        let space = space.clone();
        thread::spawn(move || resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()))
    };
    store.wait_blocked(1);
    let busy = object.resident_page(0).unwrap();
    object.discard(0);
    assert!(busy.is_released());
    store.open();

    faulter.join().unwrap().unwrap();
    assert_eq!(store.fetches(), 2);
    let page = object.resident_page(0).unwrap();
    assert_ne!(page, busy);
    assert_eq!(space.query(BASE).unwrap().frame, page);

    let stats = m.env.stats().snapshot();
    assert_eq!(stats.released_pages, 1);
    assert!(stats.restarts >= 1);
    assert_eq!(m.pool.in_use(), 1);
}

#[test]
fn unmap_during_read_fails_the_fault() {
    let m = Machine::new(16);
    let (object, store) = m.file();
    let space = map_shared(&m, &object, 1);

    store.close();
    let faulter = {
        let space = space.clone();
        thread::spawn(move || resolve_fault(&space, BASE, VmPerms::READ, FaultFlags::empty()))
    };
    store.wait_blocked(1);
    space.unmap(BASE..BASE + PAGE_SIZE).unwrap();
    store.open();

    let err = faulter.join().unwrap().unwrap_err();
    assert_eq!(err.error(), Errno::EFAULT);
    assert!(space.query(BASE).is_none());
    // The page that was read stays with the object, idle.
    let page = object.resident_page(0).unwrap();
    assert!(!page.is_busy());
}

#[test]
fn parallel_writers_converge() {
    const NPAGES: usize = 8;
    const NTHREADS: usize = 4;

    let m = Machine::new(2 * NPAGES);
    let space = m.anon_space(BASE, NPAGES);

    let writers: Vec<_> = (0..NTHREADS)
        .map(|id| {
            let space = space.clone();
            thread::spawn(move || {
                for round in 0..NPAGES {
                    let page = (round + id) % NPAGES;
                    space
                        .write_bytes(BASE + page * PAGE_SIZE + id, &[id as u8])
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(m.env.live_anons(), NPAGES);
    assert_eq!(m.pool.in_use(), NPAGES);
    let amap = space.region_at(BASE).unwrap().amap().unwrap().clone();
    assert_eq!(amap.nr_anons(), NPAGES);
    for page in 0..NPAGES {
        let mut bytes = [0u8; NTHREADS];
        space.read_bytes(BASE + page * PAGE_SIZE, &mut bytes).unwrap();
        for (id, byte) in bytes.iter().enumerate() {
            assert_eq!(*byte as usize, id);
        }
    }
}

#[test]
fn forked_writers_stay_apart() {
    let m = Machine::new(32);
    let parent = m.anon_space(BASE, 4);
    for page in 0..4 {
        parent.write_bytes(BASE + page * PAGE_SIZE, &[0xff]).unwrap();
    }
    let children: Vec<_> = (0..3).map(|_| parent.fork().unwrap()).collect();

    let writers: Vec<_> = children
        .iter()
        .enumerate()
        .map(|(id, child)| {
            let child = child.clone();
            thread::spawn(move || {
                for page in 0..4 {
                    child.write_bytes(BASE + page * PAGE_SIZE, &[id as u8]).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    for (id, child) in children.iter().enumerate() {
        for page in 0..4 {
            assert_eq!(first_byte(child, BASE + page * PAGE_SIZE), id as u8);
        }
    }
    let mut byte = [0u8];
    for page in 0..4 {
        parent.read_bytes(BASE + page * PAGE_SIZE, &mut byte).unwrap();
        assert_eq!(byte[0], 0xff);
    }
}

#[test]
fn wiring_races_with_faults() {
    let m = Machine::new(16);
    let (object, store) = m.file();
    let space = map_shared(&m, &object, 4);

    let wirer = {
        let space = space.clone();
        thread::spawn(move || wire_range(&space, BASE, BASE + 4 * PAGE_SIZE, VmPerms::READ, false))
    };
    let faulter = {
        let space = space.clone();
        thread::spawn(move || {
            for page in (0..4).rev() {
                resolve_fault(&space, BASE + page * PAGE_SIZE, VmPerms::WRITE, FaultFlags::empty())
                    .unwrap();
            }
        })
    };
    wirer.join().unwrap().unwrap();
    faulter.join().unwrap();

    assert_eq!(store.fetches(), 4);
    assert_eq!(m.env.queues().counts().wired, 4);
    for page in 0..4 {
        let frame = object.resident_page(page).unwrap();
        assert_eq!(frame.wire_count(), 1);
        assert!(!frame.is_busy());
    }
}
