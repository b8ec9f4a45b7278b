//! Neighbor entry store
//!
//! A pre-sized arena of cache-line aligned slots addressed by index. Slot 0
//! is never handed out so that a zero index can mean "nothing cached". A
//! slot keeps its index for the whole life of the entry bound to it and is
//! returned to the free list only after the entry is torn down; readers
//! holding an index compare the slot's key before trusting it.

use super::neighbor_cache::{NeighborKey, PendingPacket};
use crate::protocol::MacAddr;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stable position of an entry in the store. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryIndex(NonZeroU32);

impl EntryIndex {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Entry-local state, guarded by the slot lock
#[derive(Debug, Default)]
pub(crate) struct SlotState {
    /// None while the slot is free
    pub key: Option<NeighborKey>,
    pub mac: Option<MacAddr>,
    pub ifindex: u32,
    pub pending: VecDeque<PendingPacket>,
    /// Retries issued for the outstanding request
    pub retries: u32,
    /// Set while a resolution request is in flight
    pub next_retry: Option<Instant>,
}

impl SlotState {
    fn reset(&mut self) -> VecDeque<PendingPacket> {
        self.key = None;
        self.mac = None;
        self.ifindex = 0;
        self.retries = 0;
        self.next_retry = None;
        std::mem::take(&mut self.pending)
    }
}

#[repr(align(64))]
#[derive(Debug, Default)]
pub(crate) struct Slot {
    state: RwLock<SlotState>,
    /// Last confirmed use, nanoseconds since the store epoch. Refreshed
    /// under the read lock.
    usetime: AtomicU64,
}

impl Slot {
    pub fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write()
    }
}

#[derive(Debug)]
pub(crate) struct EntryStore {
    slots: Box<[Slot]>,
    free: Mutex<Vec<u32>>,
    epoch: Instant,
}

impl EntryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize - 1);
        let slots = (0..=capacity).map(|_| Slot::default()).collect();
        // Pop order hands out low indexes first
        let free = (1..=capacity as u32).rev().collect();

        Self {
            slots,
            free: Mutex::new(free),
            epoch: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn slot(&self, idx: EntryIndex) -> Option<&Slot> {
        self.slots.get(idx.get() as usize)
    }

    /// Bind a free slot to `key`. The caller holds the structural lock.
    pub fn allocate(&self, key: NeighborKey, ifindex: u32, now: Instant) -> Option<EntryIndex> {
        let raw = self.free.lock().pop()?;
        let idx = EntryIndex::new(raw)?;
        let slot = &self.slots[raw as usize];

        let mut state = slot.write();
        state.reset();
        state.key = Some(key);
        state.ifindex = ifindex;
        slot.usetime.store(self.nanos(now), Ordering::Relaxed);

        Some(idx)
    }

    /// Tear down the entry at `idx` and return its slot to the free list.
    /// Pending packets still queued are handed back to the caller.
    pub fn release(&self, idx: EntryIndex) -> VecDeque<PendingPacket> {
        let Some(slot) = self.slot(idx) else {
            return VecDeque::new();
        };

        let pending = slot.write().reset();
        self.free.lock().push(idx.get());
        pending
    }

    /// Like `release`, but only when `still_due` holds for the entry.
    /// The check and the teardown share one write lock, so a packet queued
    /// concurrently either fails the check or finds the slot unbound.
    /// Returns the interface the entry belonged to and its pending packets.
    pub fn release_if<F>(
        &self,
        idx: EntryIndex,
        still_due: F,
    ) -> Option<(u32, VecDeque<PendingPacket>)>
    where
        F: FnOnce(&SlotState) -> bool,
    {
        let slot = self.slot(idx)?;
        let mut state = slot.write();
        if state.key.is_none() || !still_due(&state) {
            return None;
        }

        let ifindex = state.ifindex;
        let pending = state.reset();
        drop(state);
        self.free.lock().push(idx.get());
        Some((ifindex, pending))
    }

    /// Refresh last-use; never moves the timestamp backwards
    pub fn touch(&self, slot: &Slot, now: Instant) {
        slot.usetime.fetch_max(self.nanos(now), Ordering::Relaxed);
    }

    pub fn idle_for(&self, slot: &Slot, now: Instant) -> Duration {
        let used = slot.usetime.load(Ordering::Relaxed);
        Duration::from_nanos(self.nanos(now).saturating_sub(used))
    }

    fn nanos(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }
}
