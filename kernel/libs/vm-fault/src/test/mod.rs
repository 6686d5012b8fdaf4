// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios of the fault engine, and the fixtures they share.

mod concurrency;
mod errors;

use std::{collections::VecDeque, sync::Mutex, thread};

use crate::{
    AddressSpace, BackingStore, FramePool, MapOptions, SoftMmu, VmEnv, VmEnvOptions, VmObject,
    object::ObjectFlags, prelude::*,
};

pub(crate) const RW: VmPerms = VmPerms::from_bits_truncate(0b11);

/// Blocks fetches while closed.
#[derive(Default)]
struct Gate {
    closed: AtomicBool,
    waiting: AtomicUsize,
}

impl Gate {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn open(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn wait_blocked(&self, count: usize) {
        while self.waiting.load(Ordering::Acquire) < count {
            thread::yield_now();
        }
    }

    fn pass(&self) {
        if !self.closed.load(Ordering::Acquire) {
            return;
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        while self.closed.load(Ordering::Acquire) {
            thread::yield_now();
        }
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

type Check = Box<dyn Fn() -> bool + Send + Sync>;

/// Runs a check in every read of a store and counts the reads during which
/// it reported a lock held.
#[derive(Default)]
struct LockCheck {
    check: Mutex<Option<Check>>,
    locked: AtomicUsize,
}

impl LockCheck {
    fn set(&self, check: impl Fn() -> bool + Send + Sync + 'static) {
        *self.check.lock().unwrap() = Some(Box::new(check));
    }

    fn run(&self) {
        if let Some(check) = self.check.lock().unwrap().as_ref() {
            if check() {
                self.locked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn locked(&self) -> usize {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A file-like store. Page `index` is filled with [`FileStore::byte`].
#[derive(Default)]
pub(crate) struct FileStore {
    fetches: AtomicUsize,
    errors: Mutex<VecDeque<Errno>>,
    gate: Gate,
    lock_check: LockCheck,
    released: Mutex<Vec<usize>>,
}

impl FileStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn byte(index: usize) -> u8 {
        (index as u8).wrapping_add(1)
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Makes the next fetches fail with `errors`, in order.
    pub(crate) fn fail_with(&self, errors: &[Errno]) {
        self.errors.lock().unwrap().extend(errors.iter().copied());
    }

    pub(crate) fn close(&self) {
        self.gate.close();
    }

    pub(crate) fn open(&self) {
        self.gate.open();
    }

    /// Spins until `count` fetches are blocked on the closed gate.
    pub(crate) fn wait_blocked(&self, count: usize) {
        self.gate.wait_blocked(count);
    }

    /// Runs `check` in every fetch. It returns whether some lock is held.
    pub(crate) fn set_lock_check(&self, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.lock_check.set(check);
    }

    /// Returns how many fetches ran while the check saw a lock held.
    pub(crate) fn locked_fetches(&self) -> usize {
        self.lock_check.locked()
    }

    pub(crate) fn released(&self) -> Vec<usize> {
        self.released.lock().unwrap().clone()
    }
}

impl BackingStore for FileStore {
    fn fetch(&self, index: usize, frame: &Frame) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.lock_check.run();
        self.gate.pass();
        if let Some(errno) = self.errors.lock().unwrap().pop_front() {
            return_errno!(errno);
        }
        frame.fill(Self::byte(index));
        Ok(())
    }

    fn release(&self, index: usize) {
        self.released.lock().unwrap().push(index);
    }
}

/// A swap device holding a fill byte per slot.
#[derive(Default)]
pub(crate) struct RamStore {
    slots: Mutex<BTreeMap<usize, u8>>,
    errors: Mutex<VecDeque<Errno>>,
    gate: Gate,
    lock_check: LockCheck,
    bad: Mutex<Vec<usize>>,
    released: Mutex<Vec<usize>>,
}

impl RamStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn store(&self, slot: usize, byte: u8) {
        self.slots.lock().unwrap().insert(slot, byte);
    }

    pub(crate) fn fail_with(&self, errors: &[Errno]) {
        self.errors.lock().unwrap().extend(errors.iter().copied());
    }

    pub(crate) fn close(&self) {
        self.gate.close();
    }

    pub(crate) fn open(&self) {
        self.gate.open();
    }

    pub(crate) fn wait_blocked(&self, count: usize) {
        self.gate.wait_blocked(count);
    }

    pub(crate) fn set_lock_check(&self, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.lock_check.set(check);
    }

    pub(crate) fn locked_fetches(&self) -> usize {
        self.lock_check.locked()
    }

    pub(crate) fn bad(&self) -> Vec<usize> {
        self.bad.lock().unwrap().clone()
    }

    pub(crate) fn released(&self) -> Vec<usize> {
        self.released.lock().unwrap().clone()
    }
}

impl BackingStore for RamStore {
    fn fetch(&self, index: usize, frame: &Frame) -> Result<()> {
        self.lock_check.run();
        self.gate.pass();
        if let Some(errno) = self.errors.lock().unwrap().pop_front() {
            return_errno!(errno);
        }
        let Some(byte) = self.slots.lock().unwrap().get(&index).copied() else {
            return_errno_with_message!(Errno::EIO, "empty swap slot");
        };
        frame.fill(byte);
        Ok(())
    }

    fn mark_bad(&self, index: usize) {
        self.bad.lock().unwrap().push(index);
    }

    fn release(&self, index: usize) {
        self.released.lock().unwrap().push(index);
    }
}

/// One machine: a frame pool, a software MMU and a swap device.
pub(crate) struct Machine {
    pub(crate) pool: Arc<FramePool>,
    pub(crate) mmu: Arc<SoftMmu>,
    pub(crate) swap: Arc<RamStore>,
    pub(crate) env: Arc<VmEnv>,
}

impl Machine {
    pub(crate) fn new(nframes: usize) -> Self {
        Self::with_options(nframes, |options| options)
    }

    pub(crate) fn with_options(
        nframes: usize,
        configure: impl FnOnce(VmEnvOptions) -> VmEnvOptions,
    ) -> Self {
        let pool = Arc::new(FramePool::new(nframes));
        let mmu = Arc::new(SoftMmu::new());
        let swap = RamStore::new();
        let options = VmEnvOptions::new(pool.clone(), mmu.clone())
            .swap(swap.clone())
            .backoff_spins(1);
        let env = configure(options).build().unwrap();
        Self {
            pool,
            mmu,
            swap,
            env,
        }
    }

    pub(crate) fn space(&self) -> Arc<AddressSpace> {
        AddressSpace::new(&self.env)
    }

    /// Creates a space with one anonymous read-write region.
    pub(crate) fn anon_space(&self, start: Vaddr, npages: usize) -> Arc<AddressSpace> {
        let space = self.space();
        space
            .map(MapOptions::new(start, npages * PAGE_SIZE, RW))
            .unwrap();
        space
    }

    /// Creates an object backed by a new [`FileStore`].
    pub(crate) fn file(&self) -> (Arc<VmObject>, Arc<FileStore>) {
        self.file_with(ObjectFlags::empty())
    }

    pub(crate) fn file_with(&self, flags: ObjectFlags) -> (Arc<VmObject>, Arc<FileStore>) {
        let store = FileStore::new();
        (VmObject::new(&self.env, store.clone(), flags), store)
    }
}

/// Reads the first byte of the page mapped at `vaddr`.
pub(crate) fn first_byte(space: &AddressSpace, vaddr: Vaddr) -> u8 {
    let mut byte = [0u8];
    space.query(vaddr).unwrap().frame.read_bytes(0, &mut byte);
    byte[0]
}
