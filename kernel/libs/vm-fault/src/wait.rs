// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A wait queue.
///
/// One may wait on a wait queue until a condition becomes true. Other
/// threads make the condition true first and then call [`wake_all`].
///
/// The library has no scheduler of its own, so a waiter polls its
/// condition and relaxes the CPU between polls. The wake side only
/// publishes that an event happened; it is what a scheduler-backed
/// implementation would hook to unblock sleepers.
///
/// [`wake_all`]: Self::wake_all
pub struct WaitQueue {
    num_waiters: AtomicU32,
    num_wakeups: AtomicU64,
}

impl WaitQueue {
    /// Creates a new, empty wait queue.
    pub const fn new() -> Self {
        WaitQueue {
            num_waiters: AtomicU32::new(0),
            num_wakeups: AtomicU64::new(0),
        }
    }

    /// Waits until some condition is met.
    ///
    /// The method only returns when `cond` returns `Some(_)`. The caller must
    /// not hold any spin lock that the waker needs.
    pub fn wait_until<F, R>(&self, mut cond: F) -> R
    where
        F: FnMut() -> Option<R>,
    {
        if let Some(res) = cond() {
            return res;
        }

        self.num_waiters.fetch_add(1, Ordering::Relaxed);
        let res = loop {
            if let Some(res) = cond() {
                break res;
            }
            relax();
        };
        self.num_waiters.fetch_sub(1, Ordering::Relaxed);
        res
    }

    /// Wakes up all waiting threads, returning how many were waiting.
    pub fn wake_all(&self) -> usize {
        self.num_wakeups.fetch_add(1, Ordering::Release);
        self.num_waiters.load(Ordering::Acquire) as usize
    }

    /// Returns the number of threads currently waiting.
    pub fn num_waiters(&self) -> usize {
        self.num_waiters.load(Ordering::Relaxed) as usize
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Gives the CPU away for a moment while spinning.
pub(crate) fn relax() {
    cfg_if::cfg_if! {
        if #[cfg(test)] {
            std::thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };

    use super::*;

    #[test]
    fn wait_until_sees_condition() {
        let queue = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let queue = queue.clone();
            let flag = flag.clone();
            thread::spawn(move || queue.wait_until(|| flag.load(Ordering::Acquire).then_some(7)))
        };

        while queue.num_waiters() == 0 {
            thread::yield_now();
        }
        flag.store(true, Ordering::Release);
        queue.wake_all();
        assert_eq!(waiter.join().unwrap(), 7);
        assert_eq!(queue.num_waiters(), 0);
    }

    #[test]
    fn ready_condition_does_not_register() {
        let queue = WaitQueue::new();
        assert_eq!(queue.wait_until(|| Some(3)), 3);
        assert_eq!(queue.num_waiters(), 0);
        assert_eq!(queue.wake_all(), 0);
    }
}
