// SPDX-License-Identifier: MPL-2.0

//! Byte-level access to an address space, faulting pages in on demand.

use super::AddressSpace;
use crate::{
    fault::{FaultFlags, resolve_fault},
    prelude::*,
};

impl AddressSpace {
    /// Reads `buf.len()` bytes starting at `vaddr`.
    pub fn read_bytes(&self, vaddr: Vaddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let (frame, offset, len) =
                self.page_for(vaddr + done, buf.len() - done, VmPerms::READ)?;
            frame.read_bytes(offset, &mut buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Writes `buf` starting at `vaddr`.
    pub fn write_bytes(&self, vaddr: Vaddr, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let (frame, offset, len) =
                self.page_for(vaddr + done, buf.len() - done, VmPerms::WRITE)?;
            frame.write_bytes(offset, &buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Returns the frame mapped at `vaddr` with at least `access`, with the
    /// offset of `vaddr` in it and how many of `remain` bytes fit in it.
    fn page_for(
        &self,
        vaddr: Vaddr,
        remain: usize,
        access: VmPerms,
    ) -> Result<(Frame, usize, usize)> {
        let page = page_align_down(vaddr);
        let offset = vaddr - page;
        let len = remain.min(PAGE_SIZE - offset);
        loop {
            if let Some(info) = self.query(page) {
                if info.prot.contains(access) {
                    return Ok((info.frame, offset, len));
                }
            }
            resolve_fault(self, page, access, FaultFlags::empty())?;
        }
    }
}
