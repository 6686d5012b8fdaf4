// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// The memory access permissions of memory mappings.
    ///
    /// The same flags describe the access type of a fault.
    pub struct VmPerms: u32 {
        /// Readable.
        const READ    = 1 << 0;
        /// Writable.
        const WRITE   = 1 << 1;
        /// Executable.
        const EXEC    = 1 << 2;
    }
}

impl VmPerms {
    /// Returns the permissions with write access removed.
    pub fn without_write(self) -> Self {
        self - VmPerms::WRITE
    }
}
