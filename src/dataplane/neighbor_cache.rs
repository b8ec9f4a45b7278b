//! Neighbor resolution cache
//!
//! Maps (VRF, IPv4) to link-layer addresses for every worker at once.
//!
//! Locking:
//! - `index` (structural lock) is write-locked only to create or reclaim
//!   entries.
//! - Each slot has its own RwLock over MAC, pending queue and retry state;
//!   a hit refreshes last-use through an atomic under the read lock.
//! - When both are needed the index lock is taken first.
//!
//! Packets sent to an unresolved neighbor are parked on the entry (FIFO,
//! capped, newest dropped on overflow). The first parked packet is the only
//! one that asks the caller to send a resolution request; `age` re-issues
//! it until the retry limit, then drops the queue with the entry.

use super::neighbor_store::{EntryIndex, EntryStore, Slot, SlotState};
use super::packet::Packet;
use super::routing::NextHop;
use crate::config::NeighborConfig;
use crate::protocol::MacAddr;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Neighbor entry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeighborKey {
    pub vrf: u32,
    pub addr: Ipv4Addr,
}

impl NeighborKey {
    pub fn new(vrf: u32, addr: Ipv4Addr) -> Self {
        Self { vrf, addr }
    }
}

impl fmt::Display for NeighborKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@vrf{}", self.addr, self.vrf)
    }
}

/// Per-flow resolution pointer: the store index of the last entry used.
///
/// Any thread may overwrite or read it without locking. Zero means nothing
/// is cached. Readers go through `NeighborCache::lookup_cached`, which
/// rejects an index whose slot is now bound to another key.
#[derive(Debug, Default)]
pub struct NeighborRef(AtomicU32);

impl NeighborRef {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn get(&self) -> Option<EntryIndex> {
        EntryIndex::new(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, idx: EntryIndex) {
        self.0.store(idx.get(), Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Packet parked until its neighbor is resolved
#[derive(Debug)]
pub struct PendingPacket {
    pub packet: Packet,
    pub next_hop: Option<Arc<NextHop>>,
    pub queued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDrop {
    /// Pending queue already at its cap
    QueueFull,
    /// No free slot for a new entry
    TableFull,
}

/// Result of `NeighborCache::save`
#[derive(Debug)]
pub enum SaveOutcome {
    /// First packet parked; the caller must send a resolution request
    RequestResolution,
    /// Parked behind a request already in flight
    Queued,
    /// The address was learned meanwhile; the packet is handed back
    Resolved {
        pending: PendingPacket,
        mac: MacAddr,
    },
    Dropped(SaveDrop),
}

/// Re-issue of a resolution request, produced by `age`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    pub key: NeighborKey,
    pub ifindex: u32,
    /// VLAN of the oldest parked packet's next hop
    pub vlan: u16,
    pub attempt: u32,
}

/// Entry reclaimed after its retries ran out
#[derive(Debug)]
pub struct TimedOut {
    pub key: NeighborKey,
    pub ifindex: u32,
    pub dropped: Vec<PendingPacket>,
}

/// Everything one aging pass did
#[derive(Debug, Default)]
pub struct AgeReport {
    pub expired: Vec<NeighborKey>,
    pub retries: Vec<RetryRequest>,
    pub timed_out: Vec<TimedOut>,
}

impl AgeReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.retries.is_empty() && self.timed_out.is_empty()
    }

    pub fn dropped_packets(&self) -> usize {
        self.timed_out.iter().map(|t| t.dropped.len()).sum()
    }
}

/// One row of the diagnostic dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSnapshot {
    pub key: NeighborKey,
    pub index: EntryIndex,
    pub mac: Option<MacAddr>,
    pub ifindex: u32,
    pub idle: Duration,
    pub pending: usize,
    pub retries: u32,
}

#[derive(Clone, Copy)]
enum AgeAction {
    Expire,
    TimeOut,
}

pub struct NeighborCache {
    store: EntryStore,
    index: RwLock<HashMap<NeighborKey, EntryIndex>>,
    ttl: Duration,
    retry_interval: Duration,
    retry_limit: u32,
    max_pending: usize,
    metrics: Arc<MetricsRegistry>,
}

impl NeighborCache {
    pub fn new(config: &NeighborConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            store: EntryStore::new(config.max_entries),
            index: RwLock::new(HashMap::with_capacity(config.max_entries)),
            ttl: config.entry_ttl(),
            retry_interval: config.retry_interval(),
            retry_limit: config.retry_limit,
            max_pending: config.max_pending_per_entry,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Store index of the entry for `key`
    pub fn entry_index(&self, key: &NeighborKey) -> Option<EntryIndex> {
        self.index.read().get(key).copied()
    }

    /// Resolved address of `key`. A hit refreshes the entry; a miss makes
    /// sure an unresolved entry exists so the key can be learned. Never
    /// queues anything.
    pub fn lookup(&self, key: &NeighborKey, ifindex: u32, now: Instant) -> Option<MacAddr> {
        if let Some(mac) = self.hit(key, now) {
            self.metrics.neigh_hits.inc();
            return Some(mac);
        }

        self.metrics.neigh_misses.inc();
        if let Err(e) = self.entry_for(key, ifindex, now) {
            debug!(%key, error = %e, "Cannot create neighbor entry");
        }
        None
    }

    /// Address of `key` without creating or refreshing anything
    pub fn peek(&self, key: &NeighborKey) -> Option<MacAddr> {
        let idx = self.entry_index(key)?;
        let state = self.store.slot(idx)?.read();
        if state.key != Some(*key) {
            return None;
        }
        state.mac
    }

    /// Fast path through a per-flow pointer, skipping the index lock.
    /// Returns `None` whenever the pointer is empty, stale or names an
    /// unresolved entry.
    pub fn lookup_cached(
        &self,
        flow: &NeighborRef,
        key: &NeighborKey,
        now: Instant,
    ) -> Option<MacAddr> {
        let idx = flow.get()?;
        let slot = self.store.slot(idx)?;
        let state = slot.read();
        if state.key != Some(*key) {
            return None;
        }
        let mac = state.mac?;
        self.store.touch(slot, now);
        self.metrics.neigh_flow_hits.inc();
        Some(mac)
    }

    /// Point `flow` at the entry for `key`. Returns false when there is none.
    pub fn set_cached(&self, flow: &NeighborRef, key: &NeighborKey) -> bool {
        match self.entry_index(key) {
            Some(idx) => {
                flow.set(idx);
                true
            }
            None => false,
        }
    }

    /// Per-flow pointer first, full lookup second; a full hit re-points the
    /// flow.
    pub fn lookup_with_ref(
        &self,
        flow: &NeighborRef,
        key: &NeighborKey,
        ifindex: u32,
        now: Instant,
    ) -> Option<MacAddr> {
        if let Some(mac) = self.lookup_cached(flow, key, now) {
            return Some(mac);
        }

        let mac = self.lookup(key, ifindex, now)?;
        self.set_cached(flow, key);
        Some(mac)
    }

    /// Park `packet` until `key` is resolved.
    pub fn save(
        &self,
        packet: Packet,
        next_hop: Option<Arc<NextHop>>,
        key: &NeighborKey,
        ifindex: u32,
        now: Instant,
    ) -> SaveOutcome {
        let pending = PendingPacket {
            packet,
            next_hop,
            queued_at: now,
        };

        // A concurrent reclaim may unbind the slot between the index lookup
        // and the slot lock; the second round creates a fresh entry.
        for _ in 0..2 {
            let idx = match self.entry_for(key, ifindex, now) {
                Ok(idx) => idx,
                Err(_) => {
                    self.metrics.neigh_table_full.inc();
                    return SaveOutcome::Dropped(SaveDrop::TableFull);
                }
            };
            let Some(slot) = self.store.slot(idx) else {
                break;
            };

            let mut state = slot.write();
            if state.key != Some(*key) {
                continue;
            }

            if let Some(mac) = state.mac {
                drop(state);
                self.store.touch(slot, now);
                return SaveOutcome::Resolved { pending, mac };
            }

            if state.pending.len() >= self.max_pending {
                self.metrics.pending_overflow_drops.inc();
                trace!(%key, queued = state.pending.len(), "Pending queue full, dropping packet");
                return SaveOutcome::Dropped(SaveDrop::QueueFull);
            }

            state.pending.push_back(pending);
            self.metrics.pending_queued.inc();

            if state.next_retry.is_some() {
                return SaveOutcome::Queued;
            }

            state.retries = 0;
            state.next_retry = Some(now + self.retry_interval);
            self.metrics.neigh_requests.inc();
            debug!(%key, ifindex, "Neighbor resolution requested");
            return SaveOutcome::RequestResolution;
        }

        self.metrics.neigh_table_full.inc();
        SaveOutcome::Dropped(SaveDrop::TableFull)
    }

    /// Bind `mac` to `key` and hand back every parked packet in the order
    /// it was saved. Creates the entry when the key is new (passive
    /// learning).
    pub fn resolve(
        &self,
        key: &NeighborKey,
        mac: MacAddr,
        ifindex: u32,
        now: Instant,
    ) -> Result<Vec<PendingPacket>> {
        let (_, flushed) = self.bind(key, mac, ifindex, now)?;
        Ok(flushed)
    }

    /// Static binding. Packets that happened to be parked on the key are
    /// discarded.
    pub fn insert(
        &self,
        key: &NeighborKey,
        mac: MacAddr,
        ifindex: u32,
        now: Instant,
    ) -> Result<EntryIndex> {
        let (idx, flushed) = self.bind(key, mac, ifindex, now)?;
        if !flushed.is_empty() {
            warn!(%key, count = flushed.len(), "Static neighbor discarded pending packets");
            self.metrics.pending_discarded.add(flushed.len() as u64);
        }
        Ok(idx)
    }

    fn bind(
        &self,
        key: &NeighborKey,
        mac: MacAddr,
        ifindex: u32,
        now: Instant,
    ) -> Result<(EntryIndex, Vec<PendingPacket>)> {
        for _ in 0..2 {
            let idx = self.entry_for(key, ifindex, now)?;
            let Some(slot) = self.store.slot(idx) else {
                break;
            };

            let mut state = slot.write();
            if state.key != Some(*key) {
                continue;
            }

            let previous = state.mac.replace(mac);
            state.ifindex = ifindex;
            state.retries = 0;
            state.next_retry = None;
            let flushed = std::mem::take(&mut state.pending);
            drop(state);

            self.store.touch(slot, now);
            self.metrics.neigh_resolved.inc();
            self.metrics.pending_flushed.add(flushed.len() as u64);

            if previous != Some(mac) {
                debug!(%key, %mac, ifindex, flushed = flushed.len(), "Neighbor resolved");
            }
            return Ok((idx, flushed.into()));
        }

        Err(Error::TableFull {
            capacity: self.capacity(),
        })
    }

    /// Delete one entry, dropping anything parked on it
    pub fn remove(&self, key: &NeighborKey) -> Option<MacAddr> {
        let mut index = self.index.write();
        let idx = index.remove(key)?;
        let mac = self.store.slot(idx).and_then(|slot| slot.read().mac);
        let dropped = self.store.release(idx);
        self.metrics.set_neigh_entries(index.len());
        drop(index);

        self.metrics.pending_discarded.add(dropped.len() as u64);
        debug!(%key, dropped = dropped.len(), "Neighbor removed");
        mac
    }

    /// Delete every entry learned on `ifindex`
    pub fn remove_interface(&self, ifindex: u32) -> usize {
        let mut index = self.index.write();
        let owned: Vec<(NeighborKey, EntryIndex)> = index
            .iter()
            .filter(|(_, idx)| {
                self.store
                    .slot(**idx)
                    .is_some_and(|slot| slot.read().ifindex == ifindex)
            })
            .map(|(key, idx)| (*key, *idx))
            .collect();

        let mut dropped = 0;
        for (key, idx) in &owned {
            index.remove(key);
            dropped += self.store.release(*idx).len();
        }
        self.metrics.set_neigh_entries(index.len());
        drop(index);

        self.metrics.pending_discarded.add(dropped as u64);
        if !owned.is_empty() {
            info!(ifindex, removed = owned.len(), dropped, "Flushed neighbors of interface");
        }
        owned.len()
    }

    /// One aging pass.
    ///
    /// - Idle past the TTL with nothing pending: reclaimed.
    /// - Pending and the retry is due: another request, or once the retry
    ///   limit is reached the queue is dropped and the entry reclaimed.
    pub fn age(&self, now: Instant) -> AgeReport {
        let mut report = AgeReport::default();
        let entries: Vec<(NeighborKey, EntryIndex)> = self
            .index
            .read()
            .iter()
            .map(|(key, idx)| (*key, *idx))
            .collect();

        let mut candidates = Vec::new();
        for (key, idx) in entries {
            let Some(slot) = self.store.slot(idx) else {
                continue;
            };
            let mut state = slot.write();
            if state.key != Some(key) {
                continue;
            }

            if state.pending.is_empty() {
                if self.store.idle_for(slot, now) > self.ttl {
                    candidates.push((key, idx, AgeAction::Expire));
                }
                continue;
            }

            if !retry_due(&state, now) {
                continue;
            }
            if state.retries >= self.retry_limit {
                candidates.push((key, idx, AgeAction::TimeOut));
                continue;
            }

            state.retries += 1;
            state.next_retry = Some(now + self.retry_interval);
            self.metrics.neigh_retries.inc();
            let vlan = state
                .pending
                .front()
                .and_then(|p| p.next_hop.as_ref())
                .map_or(0, |nh| nh.vlan);
            report.retries.push(RetryRequest {
                key,
                ifindex: state.ifindex,
                vlan,
                attempt: state.retries,
            });
        }

        if candidates.is_empty() {
            return report;
        }

        // Reclaim under the structural lock, re-checking each entry since
        // it may have been resolved or refreshed in between.
        let mut index = self.index.write();
        for (key, idx, action) in candidates {
            if index.get(&key) != Some(&idx) {
                continue;
            }
            let Some(slot) = self.store.slot(idx) else {
                continue;
            };

            let released = self.store.release_if(idx, |state| match action {
                AgeAction::Expire => {
                    state.pending.is_empty() && self.store.idle_for(slot, now) > self.ttl
                }
                AgeAction::TimeOut => {
                    !state.pending.is_empty()
                        && retry_due(state, now)
                        && state.retries >= self.retry_limit
                }
            });
            let Some((ifindex, dropped)) = released else {
                continue;
            };
            index.remove(&key);
            let dropped: Vec<PendingPacket> = dropped.into();

            match action {
                AgeAction::Expire => {
                    self.metrics.neigh_expired.inc();
                    trace!(%key, "Neighbor expired");
                    report.expired.push(key);
                }
                AgeAction::TimeOut => {
                    self.metrics.pending_timeout_drops.add(dropped.len() as u64);
                    warn!(%key, dropped = dropped.len(), "Neighbor resolution timed out");
                    report.timed_out.push(TimedOut {
                        key,
                        ifindex,
                        dropped,
                    });
                }
            }
        }
        self.metrics.set_neigh_entries(index.len());

        report
    }

    /// All entries, sorted by key
    pub fn snapshot(&self, now: Instant) -> Vec<NeighborSnapshot> {
        let entries: Vec<(NeighborKey, EntryIndex)> = self
            .index
            .read()
            .iter()
            .map(|(key, idx)| (*key, *idx))
            .collect();

        let mut rows: Vec<NeighborSnapshot> = entries
            .into_iter()
            .filter_map(|(key, idx)| {
                let slot = self.store.slot(idx)?;
                let state = slot.read();
                (state.key == Some(key)).then(|| NeighborSnapshot {
                    key,
                    index: idx,
                    mac: state.mac,
                    ifindex: state.ifindex,
                    idle: self.store.idle_for(slot, now),
                    pending: state.pending.len(),
                    retries: state.retries,
                })
            })
            .collect();
        rows.sort_by_key(|row| row.key);
        rows
    }

    /// Print the neighbor table
    pub fn write_table<W: io::Write>(&self, out: &mut W, now: Instant) -> io::Result<()> {
        writeln!(
            out,
            "{:>6} {:>5} {:<15} {:<17} {:>7} {:>8} {:>7}",
            "index", "vrf", "address", "mac", "ifindex", "idle(s)", "pending"
        )?;
        for row in self.snapshot(now) {
            let mac = row
                .mac
                .map(|m| m.to_string())
                .unwrap_or_else(|| "(incomplete)".to_string());
            writeln!(
                out,
                "{:>6} {:>5} {:<15} {:<17} {:>7} {:>8} {:>7}",
                row.index.get(),
                row.key.vrf,
                row.key.addr,
                mac,
                row.ifindex,
                row.idle.as_secs(),
                row.pending
            )?;
        }
        Ok(())
    }

    /// Print the entries that have packets waiting on resolution
    pub fn write_saved_packets<W: io::Write>(&self, out: &mut W, now: Instant) -> io::Result<()> {
        for row in self.snapshot(now).into_iter().filter(|r| r.pending > 0) {
            let Some(slot) = self.store.slot(row.index) else {
                continue;
            };
            let state = slot.read();
            if state.key != Some(row.key) {
                continue;
            }

            writeln!(
                out,
                "{} ifindex {} retries {} pending {}",
                row.key,
                state.ifindex,
                state.retries,
                state.pending.len()
            )?;
            for (n, pending) in state.pending.iter().enumerate() {
                writeln!(
                    out,
                    "  #{} {} -> {} len {} waited {}ms",
                    n,
                    pending.packet.src_addr(),
                    pending.packet.dst_addr(),
                    pending.packet.len(),
                    now.saturating_duration_since(pending.queued_at).as_millis()
                )?;
            }
        }
        Ok(())
    }

    /// Index of the entry for `key`, creating an unresolved one if needed
    fn entry_for(&self, key: &NeighborKey, ifindex: u32, now: Instant) -> Result<EntryIndex> {
        if let Some(idx) = self.entry_index(key) {
            return Ok(idx);
        }

        let mut index = self.index.write();
        if let Some(idx) = index.get(key) {
            return Ok(*idx);
        }

        let Some(idx) = self.store.allocate(*key, ifindex, now) else {
            warn!(%key, capacity = self.capacity(), "Neighbor table full");
            return Err(Error::TableFull {
                capacity: self.capacity(),
            });
        };
        index.insert(*key, idx);
        self.metrics.set_neigh_entries(index.len());
        trace!(%key, index = idx.get(), "Neighbor entry created");
        Ok(idx)
    }

    /// Resolved address under the slot read lock, refreshing last-use
    fn hit(&self, key: &NeighborKey, now: Instant) -> Option<MacAddr> {
        let idx = self.entry_index(key)?;
        let slot: &Slot = self.store.slot(idx)?;
        let state = slot.read();
        if state.key != Some(*key) {
            return None;
        }
        let mac = state.mac?;
        self.store.touch(slot, now);
        Some(mac)
    }
}

fn retry_due(state: &SlotState, now: Instant) -> bool {
    state.next_retry.is_some_and(|at| at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ipv4::Ipv4Builder;

    const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
    const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

    fn make_config() -> NeighborConfig {
        NeighborConfig {
            max_entries: 8,
            entry_ttl_secs: 60,
            retry_interval_secs: 1,
            retry_limit: 3,
            max_pending_per_entry: 4,
            aging_interval_ms: 100,
        }
    }

    fn make_cache() -> NeighborCache {
        NeighborCache::new(&make_config(), Arc::new(MetricsRegistry::new()))
    }

    fn make_packet(id: u16) -> Packet {
        let data = Ipv4Builder::new()
            .identification(id)
            .src_addr(Ipv4Addr::new(10, 0, 0, 1))
            .dst_addr(Ipv4Addr::new(10, 0, 0, 2))
            .udp(1000, 80, b"x")
            .build();
        Packet::new(data, 0).unwrap()
    }

    fn packet_id(pending: &PendingPacket) -> u16 {
        let bytes = pending.packet.as_bytes();
        u16::from_be_bytes([bytes[4], bytes[5]])
    }

    fn key(last: u8) -> NeighborKey {
        NeighborKey::new(0, Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_lookup_miss_creates_unresolved_entry() {
        let cache = make_cache();
        let now = Instant::now();

        assert_eq!(cache.lookup(&key(1), 1, now), None);
        assert_eq!(cache.len(), 1);
        assert!(cache.entry_index(&key(1)).is_some());
        assert_eq!(cache.peek(&key(1)), None);
        assert_eq!(cache.metrics().neigh_misses.get(), 1);
        assert_eq!(cache.metrics().neigh_requests.get(), 0);
    }

    #[test]
    fn test_lookup_hit_after_resolve() {
        let cache = make_cache();
        let now = Instant::now();

        let flushed = cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        assert!(flushed.is_empty());
        assert_eq!(cache.lookup(&key(1), 1, now), Some(MAC_A));
        assert_eq!(cache.metrics().neigh_hits.get(), 1);
    }

    #[test]
    fn test_vrf_is_part_of_key() {
        let cache = make_cache();
        let now = Instant::now();
        let other = NeighborKey::new(5, key(1).addr);

        cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        assert_eq!(cache.peek(&other), None);
        cache.resolve(&other, MAC_B, 1, now).unwrap();
        assert_eq!(cache.peek(&key(1)), Some(MAC_A));
        assert_eq!(cache.peek(&other), Some(MAC_B));
    }

    #[test]
    fn test_single_request_per_unresolved_key() {
        let cache = make_cache();
        let now = Instant::now();

        let first = cache.save(make_packet(1), None, &key(1), 1, now);
        assert!(matches!(first, SaveOutcome::RequestResolution));
        for id in 2..=4 {
            let outcome = cache.save(make_packet(id), None, &key(1), 1, now);
            assert!(matches!(outcome, SaveOutcome::Queued));
        }
        assert_eq!(cache.metrics().neigh_requests.get(), 1);
    }

    #[test]
    fn test_save_after_lookup_miss_still_requests() {
        let cache = make_cache();
        let now = Instant::now();

        cache.lookup(&key(1), 1, now);
        let outcome = cache.save(make_packet(1), None, &key(1), 1, now);
        assert!(matches!(outcome, SaveOutcome::RequestResolution));
    }

    #[test]
    fn test_pending_overflow_drops_newest() {
        let cache = make_cache();
        let now = Instant::now();

        for id in 1..=4 {
            cache.save(make_packet(id), None, &key(1), 1, now);
        }
        let outcome = cache.save(make_packet(5), None, &key(1), 1, now);
        assert!(matches!(outcome, SaveOutcome::Dropped(SaveDrop::QueueFull)));
        assert_eq!(cache.metrics().pending_overflow_drops.get(), 1);

        let flushed = cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        let ids: Vec<u16> = flushed.iter().map(packet_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_resolve_flushes_in_order_and_clears_state() {
        let cache = make_cache();
        let now = Instant::now();

        for id in [7, 3, 9] {
            cache.save(make_packet(id), None, &key(1), 1, now);
        }
        let flushed = cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        let ids: Vec<u16> = flushed.iter().map(packet_id).collect();
        assert_eq!(ids, vec![7, 3, 9]);

        // Nothing left to retry
        let report = cache.age(now + Duration::from_secs(5));
        assert!(report.is_empty());
        assert_eq!(cache.metrics().pending_flushed.get(), 3);
    }

    #[test]
    fn test_save_on_resolved_entry_hands_packet_back() {
        let cache = make_cache();
        let now = Instant::now();
        cache.resolve(&key(1), MAC_A, 1, now).unwrap();

        match cache.save(make_packet(1), None, &key(1), 1, now) {
            SaveOutcome::Resolved { pending, mac } => {
                assert_eq!(mac, MAC_A);
                assert_eq!(packet_id(&pending), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_table_full() {
        let config = NeighborConfig {
            max_entries: 2,
            ..make_config()
        };
        let cache = NeighborCache::new(&config, Arc::new(MetricsRegistry::new()));
        let now = Instant::now();

        cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        cache.resolve(&key(2), MAC_A, 1, now).unwrap();
        assert!(matches!(
            cache.resolve(&key(3), MAC_A, 1, now),
            Err(Error::TableFull { capacity: 2 })
        ));
        assert!(matches!(
            cache.save(make_packet(1), None, &key(3), 1, now),
            SaveOutcome::Dropped(SaveDrop::TableFull)
        ));

        // Existing flows are unaffected
        assert_eq!(cache.lookup(&key(1), 1, now), Some(MAC_A));
    }

    #[test]
    fn test_age_expires_idle_entries_only() {
        let cache = make_cache();
        let start = Instant::now();

        cache.resolve(&key(1), MAC_A, 1, start).unwrap();
        cache.resolve(&key(2), MAC_B, 1, start).unwrap();

        // key 2 is used half way through
        let mid = start + Duration::from_secs(40);
        assert_eq!(cache.lookup(&key(2), 1, mid), Some(MAC_B));

        let report = cache.age(start + Duration::from_secs(61));
        assert_eq!(report.expired, vec![key(1)]);
        assert_eq!(cache.peek(&key(1)), None);
        assert_eq!(cache.peek(&key(2)), Some(MAC_B));
        assert_eq!(cache.metrics().neigh_expired.get(), 1);
    }

    #[test]
    fn test_age_retries_then_times_out() {
        let cache = make_cache();
        let start = Instant::now();

        for id in 1..=3 {
            cache.save(make_packet(id), None, &key(1), 4, start);
        }

        // Not due yet
        assert!(cache.age(start).is_empty());

        for attempt in 1..=3 {
            let report = cache.age(start + Duration::from_secs(attempt as u64));
            assert_eq!(
                report.retries,
                vec![RetryRequest {
                    key: key(1),
                    ifindex: 4,
                    vlan: 0,
                    attempt,
                }]
            );
        }

        let report = cache.age(start + Duration::from_secs(4));
        assert_eq!(report.timed_out.len(), 1);
        assert_eq!(report.dropped_packets(), 3);
        assert_eq!(cache.entry_index(&key(1)), None);
        assert_eq!(cache.metrics().pending_timeout_drops.get(), 3);
    }

    #[test]
    fn test_remove_and_remove_interface() {
        let cache = make_cache();
        let now = Instant::now();

        cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        cache.resolve(&key(2), MAC_A, 2, now).unwrap();
        cache.save(make_packet(1), None, &key(3), 2, now);

        assert_eq!(cache.remove(&key(1)), Some(MAC_A));
        assert_eq!(cache.remove(&key(1)), None);

        assert_eq!(cache.remove_interface(2), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().pending_discarded.get(), 1);
        assert_eq!(cache.metrics().neigh_entries.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_slot_reuse_invalidates_flow_ref() {
        let config = NeighborConfig {
            max_entries: 1,
            ..make_config()
        };
        let cache = NeighborCache::new(&config, Arc::new(MetricsRegistry::new()));
        let now = Instant::now();
        let flow = NeighborRef::new();

        cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        assert!(cache.set_cached(&flow, &key(1)));
        assert_eq!(cache.lookup_cached(&flow, &key(1), now), Some(MAC_A));

        cache.remove(&key(1));
        cache.resolve(&key(2), MAC_B, 1, now).unwrap();

        // Same slot, different key
        assert_eq!(flow.get(), cache.entry_index(&key(2)));
        assert_eq!(cache.lookup_cached(&flow, &key(1), now), None);
        assert_eq!(cache.lookup_cached(&flow, &key(2), now), Some(MAC_B));
    }

    #[test]
    fn test_lookup_with_ref_repoints_flow() {
        let cache = make_cache();
        let now = Instant::now();
        let flow = NeighborRef::new();

        assert_eq!(cache.lookup_with_ref(&flow, &key(1), 1, now), None);
        assert!(flow.get().is_none());

        cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        assert_eq!(cache.lookup_with_ref(&flow, &key(1), 1, now), Some(MAC_A));
        assert!(flow.get().is_some());

        assert_eq!(cache.lookup_with_ref(&flow, &key(1), 1, now), Some(MAC_A));
        assert_eq!(cache.metrics().neigh_flow_hits.get(), 1);

        flow.clear();
        assert!(flow.get().is_none());
    }

    #[test]
    fn test_insert_static_entry() {
        let cache = make_cache();
        let now = Instant::now();

        cache.save(make_packet(1), None, &key(1), 1, now);
        let idx = cache.insert(&key(1), MAC_A, 1, now).unwrap();
        assert_eq!(cache.entry_index(&key(1)), Some(idx));
        assert_eq!(cache.peek(&key(1)), Some(MAC_A));
        assert_eq!(cache.metrics().pending_discarded.get(), 1);
    }

    #[test]
    fn test_dump() {
        let cache = make_cache();
        let now = Instant::now();

        cache.resolve(&key(1), MAC_A, 1, now).unwrap();
        cache.save(make_packet(1), None, &key(2), 3, now);

        let rows = cache.snapshot(now);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].mac, Some(MAC_A));
        assert_eq!(rows[1].pending, 1);

        let mut table = Vec::new();
        cache.write_table(&mut table, now).unwrap();
        let table = String::from_utf8(table).unwrap();
        assert!(table.contains("02:00:00:00:00:0a"));
        assert!(table.contains("(incomplete)"));

        let mut saved = Vec::new();
        cache.write_saved_packets(&mut saved, now).unwrap();
        let saved = String::from_utf8(saved).unwrap();
        assert!(saved.starts_with("10.0.0.2@vrf0 ifindex 3"));
        assert!(saved.contains("10.0.0.1 -> 10.0.0.2"));
    }
}
