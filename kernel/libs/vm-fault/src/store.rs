// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// A source of page contents that may block.
///
/// Object pagers and the swap device share this interface. For an object,
/// `index` is the page index inside the object; for swap, it is the slot.
///
/// The fault engine calls these methods without holding any lock.
pub trait BackingStore: Send + Sync {
    /// Reads the page at `index` into `frame`.
    ///
    /// Returns `EAGAIN` if the store is only temporarily unable to serve the
    /// request; the fault is then retried after a short backoff. Any other
    /// error is final.
    fn fetch(&self, index: usize, frame: &Frame) -> Result<()>;

    /// Records that `index` cannot be read anymore.
    fn mark_bad(&self, _index: usize) {}

    /// Discards the stored copy of `index`, which is now kept in memory for
    /// good.
    fn release(&self, _index: usize) {}
}

/// The store of anonymous objects: every page reads as zeros.
#[derive(Debug, Default)]
pub struct ZeroStore;

impl BackingStore for ZeroStore {
    fn fetch(&self, _index: usize, frame: &Frame) -> Result<()> {
        frame.fill(0);
        Ok(())
    }
}
