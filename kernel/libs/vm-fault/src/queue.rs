// SPDX-License-Identifier: MPL-2.0

//! Bookkeeping for the page-replacement queues.
//!
//! The queue lock is always the innermost lock and is never held across
//! anything but a few counter updates.

use crate::{
    frame::{FrameMeta, PageQueue},
    prelude::*,
};

/// The number of frames on each queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub active: usize,
    pub inactive: usize,
    pub wired: usize,
}

/// The active, inactive and wired page queues.
pub struct PageQueues {
    counts: SpinLock<QueueCounts>,
}

impl PageQueues {
    pub const fn new() -> Self {
        Self {
            counts: SpinLock::new(QueueCounts {
                active: 0,
                inactive: 0,
                wired: 0,
            }),
        }
    }

    /// Moves a frame to the active queue unless it is wired.
    pub fn activate(&self, frame: &Frame) {
        self.move_to(frame, PageQueue::Active);
    }

    /// Moves a frame to the inactive queue unless it is wired.
    pub fn deactivate(&self, frame: &Frame) {
        self.move_to(frame, PageQueue::Inactive);
    }

    /// Puts a frame on the active queue if it is on no queue yet.
    pub fn enqueue(&self, frame: &Frame) {
        let mut counts = self.counts.lock();
        let mut meta = frame.meta();
        if meta.wire_count > 0 || meta.queue != PageQueue::None {
            return;
        }
        meta.queue = PageQueue::Active;
        counts.active += 1;
    }

    /// Pins a frame. The first wiring takes it off the queues.
    pub fn wire(&self, frame: &Frame) {
        let mut counts = self.counts.lock();
        let mut meta = frame.meta();
        if meta.wire_count == 0 {
            dequeue(&mut counts, &mut meta);
            counts.wired += 1;
        }
        meta.wire_count += 1;
    }

    /// Drops one pin. The last unwiring puts the frame back on the active
    /// queue.
    pub fn unwire(&self, frame: &Frame) {
        let mut counts = self.counts.lock();
        let mut meta = frame.meta();
        debug_assert!(meta.wire_count > 0, "unwiring a frame that is not wired");
        if meta.wire_count == 0 {
            return;
        }
        meta.wire_count -= 1;
        if meta.wire_count == 0 {
            counts.wired -= 1;
            meta.queue = PageQueue::Active;
            counts.active += 1;
        }
    }

    /// Takes a frame off every queue before it is freed.
    pub fn remove(&self, frame: &Frame) {
        let mut counts = self.counts.lock();
        let mut meta = frame.meta();
        dequeue(&mut counts, &mut meta);
        if meta.wire_count > 0 {
            counts.wired -= 1;
            meta.wire_count = 0;
        }
    }

    pub fn counts(&self) -> QueueCounts {
        *self.counts.lock()
    }

    fn move_to(&self, frame: &Frame, queue: PageQueue) {
        let mut counts = self.counts.lock();
        let mut meta = frame.meta();
        if meta.wire_count > 0 || meta.queue == queue {
            return;
        }
        dequeue(&mut counts, &mut meta);
        meta.queue = queue;
        match queue {
            PageQueue::Active => counts.active += 1,
            PageQueue::Inactive => counts.inactive += 1,
            PageQueue::None => {}
        }
    }
}

impl Default for PageQueues {
    fn default() -> Self {
        Self::new()
    }
}

fn dequeue(counts: &mut QueueCounts, meta: &mut FrameMeta) {
    match meta.queue {
        PageQueue::Active => counts.active -= 1,
        PageQueue::Inactive => counts.inactive -= 1,
        PageQueue::None => {}
    }
    meta.queue = PageQueue::None;
}
