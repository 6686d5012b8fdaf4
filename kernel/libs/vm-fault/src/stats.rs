// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_fault_stats {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Event counters of the fault engine.
        ///
        /// Counters are updated with relaxed atomics and are only meant for
        /// diagnostics.
        pub struct FaultStats {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)*
        }

        /// A point-in-time copy of [`FaultStats`].
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct FaultStatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl FaultStats {
            pub const fn new() -> Self {
                Self {
                    $($name: AtomicU64::new(0),)*
                }
            }

            pub fn snapshot(&self) -> FaultStatsSnapshot {
                FaultStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

define_fault_stats! {
    /// Calls to `resolve_fault`.
    faults,
    /// Attempts that ended with a restart.
    restarts,
    /// Lookups of a private page for the faulting address.
    anon_gets,
    /// Waits on a busy frame.
    page_waits,
    /// Private pages read back from swap.
    swap_ins,
    /// Anonymous layers created or copied to resolve a pending private copy.
    amap_copies,
    /// Private pages mapped as they are.
    anon_direct,
    /// Private pages copied because they were shared.
    anon_cow,
    /// Loans broken by a write.
    loan_breaks,
    /// Object pages mapped as they are.
    object_direct,
    /// Object pages copied into a new private page.
    object_copy,
    /// New zero-filled private pages.
    zero_fill,
    /// Neighbor private pages mapped opportunistically.
    anon_neighbors,
    /// Neighbor object pages mapped opportunistically.
    object_neighbors,
    /// Waits for free memory.
    no_ram,
    /// Frames found released after blocking.
    released_pages,
    /// Blocking reads from an object's backing store.
    pager_gets,
    /// Transient backing store failures.
    pager_retries,
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
