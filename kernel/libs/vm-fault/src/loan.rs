// SPDX-License-Identifier: MPL-2.0

//! Lending object pages to anonymous layers.

use crate::{
    fault::{FaultInfo, copy_private_layer},
    prelude::*,
    space::AddressSpace,
    stats::inc,
};

/// Lends the object page behind `vaddr` to the anonymous layer of its
/// region.
///
/// The new private page borrows the object's frame instead of copying it.
/// The object stays the owner of the frame, and every mapping of the frame
/// becomes read-only. The loan is broken by the first write: a write through
/// the region gives the private page a frame of its own, and a write through
/// the object gives the object a copy.
///
/// Fails with `EFAULT` if no region maps `vaddr`, `EINVAL` if the region is
/// not a copy-on-write mapping of an object, `EEXIST` if a private page
/// already backs `vaddr`, and `ENOMEM` if no private page can be allocated.
pub fn loan_to_anon(space: &AddressSpace, vaddr: Vaddr) -> Result<()> {
    let env = space.env();
    let vaddr = page_align_down(vaddr);
    loop {
        let (info, map) = FaultInfo::lookup(space, vaddr)?;
        let region = &info.region;
        if region.needs_copy() && region.object().is_some() {
            drop(map);
            copy_private_layer(space, vaddr);
            continue;
        }
        let (Some(amap), Some(object)) = (region.amap(), region.object()) else {
            return_errno_with_message!(
                Errno::EINVAL,
                "only copy-on-write mappings of an object can borrow its pages"
            );
        };
        let index = region.object_index(vaddr);
        let slot = region.amap_slot(vaddr);
        drop(map);

        let frame = match object.fetch_page(index) {
            Ok(frame) => frame,
            Err(err) if err.error() == Errno::EAGAIN => {
                inc(&env.stats().pager_retries);
                env.backoff();
                continue;
            }
            Err(err) => return Err(err),
        };

        let Some(_map) = info.relock() else {
            object.lock().release_busy(frame);
            continue;
        };
        let mut amap = amap.lock();
        let mut object = object.lock();
        if frame.is_released() {
            object.release_busy(frame);
            continue;
        }
        if amap.lookup(slot).is_some() {
            object.release_busy(frame);
            return_errno_with_message!(Errno::EEXIST, "a private page already backs the address");
        }
        let Some(mut anon) = env.alloc_anon() else {
            object.release_busy(frame);
            return_errno_with_message!(Errno::ENOMEM, "too many private pages");
        };

        frame.add_loan();
        env.mmu().page_protect(&frame, VmPerms::READ | VmPerms::EXEC);
        anon.set_page(frame.clone());
        let id = amap.add(slot, anon);
        env.queues().activate(&frame);
        object.release_busy(frame);
        trace!("lent object page {} to private page {} at {:#x}", index, id, vaddr);
        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        VmEnvOptions,
        fault::{FaultFlags, resolve_fault},
        frame::FrameOwner,
        mmu::SoftMmu,
        object::VmObject,
        pool::FramePool,
        space::MapOptions,
    };

    const RW: VmPerms = VmPerms::from_bits_truncate(0b11);

    fn env() -> Arc<crate::VmEnv> {
        VmEnvOptions::new(Arc::new(FramePool::new(16)), Arc::new(SoftMmu::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn borrowed_page_is_shared_read_only() {
        let env = env();
        let object = VmObject::new_anonymous(&env);
        let space = AddressSpace::new(&env);
        space
            .map(
                MapOptions::new(0x10000, PAGE_SIZE, RW)
                    .object(object.clone(), 2)
                    .copy_on_write(),
            )
            .unwrap();

        loan_to_anon(&space, 0x10123).unwrap();
        let page = object.resident_page(2).unwrap();
        let anon = space.region_at(0x10000).unwrap().anon_at(0x10000).unwrap();
        assert_eq!(anon.frame.as_ref(), Some(&page));
        assert_eq!(anon.refs, 1);
        assert_eq!(page.loan_count(), 1);
        assert!(Arc::ptr_eq(&page.owner_object().unwrap(), &object));

        let err = loan_to_anon(&space, 0x10000).unwrap_err();
        assert_eq!(err.error(), Errno::EEXIST);

        resolve_fault(&space, 0x10000, VmPerms::READ, FaultFlags::empty()).unwrap();
        let mapping = space.query(0x10000).unwrap();
        assert_eq!(mapping.frame, page);
        assert!(!mapping.prot.contains(VmPerms::WRITE));
    }

    #[test]
    fn only_private_object_mappings_borrow() {
        let env = env();
        let object = VmObject::new_anonymous(&env);
        let space = AddressSpace::new(&env);
        space
            .map(MapOptions::new(0x10000, PAGE_SIZE, RW).object(object.clone(), 0))
            .unwrap();
        space.map(MapOptions::new(0x20000, PAGE_SIZE, RW)).unwrap();

        let err = loan_to_anon(&space, 0x10000).unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
        let err = loan_to_anon(&space, 0x20000).unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
        let err = loan_to_anon(&space, 0x30000).unwrap_err();
        assert_eq!(err.error(), Errno::EFAULT);
        assert_eq!(object.nr_resident(), 0);
    }

    #[test]
    fn discarded_page_stays_with_borrower() {
        let env = env();
        let object = VmObject::new_anonymous(&env);
        let space = AddressSpace::new(&env);
        space
            .map(
                MapOptions::new(0x10000, PAGE_SIZE, RW)
                    .object(object.clone(), 0)
                    .copy_on_write(),
            )
            .unwrap();
        loan_to_anon(&space, 0x10000).unwrap();
        let page = object.resident_page(0).unwrap();

        object.discard(0);
        assert!(object.resident_page(0).is_none());
        assert!(matches!(page.owner(), FrameOwner::None));
        assert_eq!(page.loan_count(), 1);

        space.unmap(0x10000..0x11000).unwrap();
        assert_eq!(page.state(), crate::frame::FrameState::Free);
        assert_eq!(env.live_anons(), 0);
    }
}
