// SPDX-License-Identifier: MPL-2.0

//! Private anonymous pages and the layers that hold them.
//!
//! An [`AnonLayer`] maps slot indexes to private pages. Layers copied from
//! one another share their pages, and therefore share one lock: all of them
//! live in the same lock domain, an arena that owns both the slot tables and
//! the pages. The only way to reach a private page is through an
//! [`AnonGuard`] of its domain, so touching a page under the wrong lock
//! cannot be expressed.

use smallvec::SmallVec;

use crate::{advice::MAX_WINDOW, env::VmEnv, prelude::*};

/// Identifies a private page inside its lock domain.
///
/// Identifiers are never reused, so comparing them detects a slot that was
/// replaced while the lock was dropped.
pub type AnonId = u64;

type LayerId = u64;

/// A private page.
///
/// It holds at most one frame, or failing that a swap slot. Its reference
/// count is the number of layer slots that point at it.
pub(crate) struct AnonPage {
    refs: usize,
    page: Option<Frame>,
    swap_slot: Option<usize>,
}

impl AnonPage {
    pub(crate) fn new() -> Self {
        Self {
            refs: 1,
            page: None,
            swap_slot: None,
        }
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs
    }

    /// Drops one reference and returns how many are left.
    pub(crate) fn drop_ref(&mut self) -> usize {
        debug_assert!(self.refs > 0);
        self.refs -= 1;
        self.refs
    }

    pub(crate) fn page(&self) -> Option<&Frame> {
        self.page.as_ref()
    }

    pub(crate) fn set_page(&mut self, frame: Frame) {
        self.page = Some(frame);
    }

    pub(crate) fn take_page(&mut self) -> Option<Frame> {
        self.page.take()
    }

    pub(crate) fn swap_slot(&self) -> Option<usize> {
        self.swap_slot
    }

    pub(crate) fn set_swap_slot(&mut self, slot: usize) {
        self.swap_slot = Some(slot);
    }

    pub(crate) fn take_swap_slot(&mut self) -> Option<usize> {
        self.swap_slot.take()
    }
}

/// The arena behind one lock.
struct AnonDomain {
    anons: BTreeMap<AnonId, AnonPage>,
    layers: BTreeMap<LayerId, BTreeMap<usize, AnonId>>,
    next_anon: AnonId,
    next_layer: LayerId,
}

impl AnonDomain {
    fn new_layer(&mut self, slots: BTreeMap<usize, AnonId>) -> LayerId {
        let id = self.next_layer;
        self.next_layer += 1;
        self.layers.insert(id, slots);
        id
    }

    fn anon_mut(&mut self, id: AnonId) -> &mut AnonPage {
        let Some(anon) = self.anons.get_mut(&id) else {
            panic!("private page {} is not in its domain", id);
        };
        anon
    }

    /// Drops a reference to a private page, freeing it with its last one.
    ///
    /// A page whose frame is busy is left in the domain with no references;
    /// the frame is marked released and the busy holder frees it.
    fn unref(&mut self, id: AnonId, env: &VmEnv) {
        let anon = self.anon_mut(id);
        if anon.drop_ref() > 0 {
            return;
        }
        if let Some(frame) = anon.page() {
            if frame.release() {
                return;
            }
        }
        if let Some(anon) = self.anons.remove(&id) {
            env.free_anon(anon);
        }
    }
}

/// A snapshot of one private page, for inspection.
#[derive(Debug, Clone)]
pub struct AnonInfo {
    pub id: AnonId,
    pub refs: usize,
    pub frame: Option<Frame>,
    pub swap_slot: Option<usize>,
}

/// A sparse array of private pages overlaying a region.
pub struct AnonLayer {
    domain: Arc<SpinLock<AnonDomain>>,
    id: LayerId,
    /// The number of regions referring to this layer.
    region_refs: AtomicUsize,
    shared: AtomicBool,
    env: Arc<VmEnv>,
}

impl AnonLayer {
    /// Creates an empty layer in a new lock domain.
    pub(crate) fn new(env: &Arc<VmEnv>) -> Arc<Self> {
        let mut domain = AnonDomain {
            anons: BTreeMap::new(),
            layers: BTreeMap::new(),
            next_anon: 0,
            next_layer: 0,
        };
        let id = domain.new_layer(BTreeMap::new());
        Arc::new(Self {
            domain: Arc::new(SpinLock::new(domain)),
            id,
            region_refs: AtomicUsize::new(1),
            shared: AtomicBool::new(false),
            env: env.clone(),
        })
    }

    /// Creates a layer sharing the pages in `nslots` slots from `start`.
    ///
    /// The new layer's slot 0 is this layer's slot `start`. Every page copied
    /// gains one reference.
    pub(crate) fn copy(&self, start: usize, nslots: usize) -> Arc<Self> {
        let mut domain = self.domain.lock();
        let mut slots = BTreeMap::new();
        let copied: Vec<_> = domain.layers[&self.id]
            .range(start..start + nslots)
            .map(|(slot, id)| (*slot, *id))
            .collect();
        for (slot, id) in copied {
            domain.anon_mut(id).refs += 1;
            slots.insert(slot - start, id);
        }
        let id = domain.new_layer(slots);
        drop(domain);

        Arc::new(Self {
            domain: self.domain.clone(),
            id,
            region_refs: AtomicUsize::new(1),
            shared: AtomicBool::new(false),
            env: self.env.clone(),
        })
    }

    pub(crate) fn lock(&self) -> AnonGuard<'_> {
        AnonGuard {
            layer: self,
            domain: self.domain.lock(),
        }
    }

    /// Returns whether the lock of this layer is held.
    pub fn is_locked(&self) -> bool {
        self.domain.is_locked()
    }

    /// Returns whether the layer is deliberately shared between regions,
    /// as opposed to shared until a private copy is made.
    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    pub(crate) fn set_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    pub fn region_refs(&self) -> usize {
        self.region_refs.load(Ordering::Relaxed)
    }

    pub(crate) fn add_region_ref(&self) {
        self.region_refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_region_ref(&self) {
        self.region_refs.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns whether two layers share a lock domain.
    pub fn same_domain(&self, other: &AnonLayer) -> bool {
        Arc::ptr_eq(&self.domain, &other.domain)
    }

    /// Returns the private page in `slot`.
    pub fn anon_at(&self, slot: usize) -> Option<AnonInfo> {
        let guard = self.lock();
        let id = guard.lookup(slot)?;
        let anon = guard.anon(id);
        Some(AnonInfo {
            id,
            refs: anon.refs,
            frame: anon.page.clone(),
            swap_slot: anon.swap_slot,
        })
    }

    /// Returns the number of filled slots.
    pub fn nr_anons(&self) -> usize {
        self.domain.lock().layers[&self.id].len()
    }

    /// Puts a swapped-out private page into an empty slot.
    #[cfg(test)]
    pub(crate) fn insert_swapped(&self, slot: usize, swap_slot: usize) -> AnonId {
        let mut anon = self.env.alloc_anon().unwrap();
        anon.set_swap_slot(swap_slot);
        self.lock().add(slot, anon)
    }
}

impl Drop for AnonLayer {
    fn drop(&mut self) {
        let mut domain = self.domain.lock();
        let Some(slots) = domain.layers.remove(&self.id) else {
            return;
        };
        for id in slots.into_values() {
            domain.unref(id, &self.env);
        }
    }
}

impl Debug for AnonLayer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnonLayer")
            .field("id", &self.id)
            .field("region_refs", &self.region_refs())
            .field("shared", &self.is_shared())
            .finish_non_exhaustive()
    }
}

/// The locked view of an [`AnonLayer`].
pub(crate) struct AnonGuard<'a> {
    layer: &'a AnonLayer,
    domain: SpinLockGuard<'a, AnonDomain>,
}

impl AnonGuard<'_> {
    pub(crate) fn layer(&self) -> &AnonLayer {
        self.layer
    }

    fn slots(&self) -> &BTreeMap<usize, AnonId> {
        &self.domain.layers[&self.layer.id]
    }

    pub(crate) fn lookup(&self, slot: usize) -> Option<AnonId> {
        self.slots().get(&slot).copied()
    }

    /// Looks up `count` consecutive slots from `start`.
    pub(crate) fn lookups(
        &self,
        start: usize,
        count: usize,
    ) -> SmallVec<[Option<AnonId>; MAX_WINDOW]> {
        let slots = self.slots();
        (start..start + count)
            .map(|slot| slots.get(&slot).copied())
            .collect()
    }

    pub(crate) fn anon(&self, id: AnonId) -> &AnonPage {
        let Some(anon) = self.domain.anons.get(&id) else {
            panic!("private page {} is not in its domain", id);
        };
        anon
    }

    pub(crate) fn anon_mut(&mut self, id: AnonId) -> &mut AnonPage {
        self.domain.anon_mut(id)
    }

    /// Puts a new private page into `slot`, returning its identifier.
    ///
    /// A page previously in the slot loses the slot but keeps its reference
    /// count; the caller settles it.
    pub(crate) fn add(&mut self, slot: usize, anon: AnonPage) -> AnonId {
        let domain = &mut *self.domain;
        let id = domain.next_anon;
        domain.next_anon += 1;
        domain.anons.insert(id, anon);
        let Some(slots) = domain.layers.get_mut(&self.layer.id) else {
            panic!("anonymous layer {} lost its slot table", self.layer.id);
        };
        slots.insert(slot, id);
        id
    }

    /// Drops the reference of `slot` to its private page and empties it.
    pub(crate) fn remove(&mut self, slot: usize) {
        let domain = &mut *self.domain;
        let Some(id) = domain
            .layers
            .get_mut(&self.layer.id)
            .and_then(|slots| slots.remove(&slot))
        else {
            return;
        };
        domain.unref(id, &self.layer.env);
    }

    /// Frees a private page that lost its last reference while its frame was
    /// busy. Called by the busy holder.
    pub(crate) fn release(&mut self, id: AnonId) {
        let Some(anon) = self.domain.anons.remove(&id) else {
            return;
        };
        debug_assert_eq!(anon.refs, 0);
        debug_assert!(anon.page().is_some_and(Frame::is_released));
        self.layer.env.free_anon(anon);
    }
}
