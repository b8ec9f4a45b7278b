//! Packet and table counters for the data plane.
//!
//! Counters are relaxed atomics shared by every worker; the per-port table is
//! only written when a port is registered.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-port transmit statistics.
#[derive(Debug, Default)]
pub struct PortStats {
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    pub tx_errors: Counter,
}

impl PortStats {
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }
}

/// Global metrics registry; also the drop-accounting hook of the core.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    ports: RwLock<HashMap<u32, PortStats>>,

    // Transmit engine
    pub xmit_forwarded: Counter,
    pub xmit_dropped_malformed: Counter,
    pub xmit_dropped_handler: Counter,
    pub xmit_dropped_egress: Counter,
    pub cport_filled: Counter,
    pub route_lookups: Counter,
    pub route_cache_hits: Counter,
    pub route_unreachable: Counter,

    // Neighbor cache
    pub neigh_hits: Counter,
    pub neigh_misses: Counter,
    pub neigh_flow_hits: Counter,
    pub neigh_requests: Counter,
    pub neigh_retries: Counter,
    pub neigh_resolved: Counter,
    pub neigh_expired: Counter,
    pub neigh_table_full: Counter,
    pub pending_queued: Counter,
    pub pending_flushed: Counter,
    pub pending_overflow_drops: Counter,
    pub pending_timeout_drops: Counter,
    /// Dropped by explicit removal of the entry or its interface
    pub pending_discarded: Counter,

    /// Current number of neighbor entries.
    pub neigh_entries: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_port(&self, port: u32) {
        self.ports.write().entry(port).or_default();
    }

    pub fn record_tx(&self, port: u32, bytes: usize) {
        if let Some(stats) = self.ports.read().get(&port) {
            stats.record_tx(bytes);
        }
    }

    pub fn record_tx_error(&self, port: u32) {
        if let Some(stats) = self.ports.read().get(&port) {
            stats.tx_errors.inc();
        }
    }

    pub fn set_neigh_entries(&self, count: usize) {
        self.neigh_entries.store(count as u64, Ordering::Relaxed);
    }

    /// Packets dropped by the transmit engine for any reason.
    pub fn xmit_dropped(&self) -> u64 {
        self.xmit_dropped_malformed.get()
            + self.xmit_dropped_handler.get()
            + self.xmit_dropped_egress.get()
    }

    /// Exports all metrics as name/value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("xmit_forwarded".into(), self.xmit_forwarded.get()),
            (
                "xmit_dropped_malformed".into(),
                self.xmit_dropped_malformed.get(),
            ),
            (
                "xmit_dropped_handler".into(),
                self.xmit_dropped_handler.get(),
            ),
            ("xmit_dropped_egress".into(), self.xmit_dropped_egress.get()),
            ("cport_filled".into(), self.cport_filled.get()),
            ("route_lookups".into(), self.route_lookups.get()),
            ("route_cache_hits".into(), self.route_cache_hits.get()),
            ("route_unreachable".into(), self.route_unreachable.get()),
            ("neigh_hits".into(), self.neigh_hits.get()),
            ("neigh_misses".into(), self.neigh_misses.get()),
            ("neigh_flow_hits".into(), self.neigh_flow_hits.get()),
            ("neigh_requests".into(), self.neigh_requests.get()),
            ("neigh_retries".into(), self.neigh_retries.get()),
            ("neigh_resolved".into(), self.neigh_resolved.get()),
            ("neigh_expired".into(), self.neigh_expired.get()),
            ("neigh_table_full".into(), self.neigh_table_full.get()),
            ("pending_queued".into(), self.pending_queued.get()),
            ("pending_flushed".into(), self.pending_flushed.get()),
            (
                "pending_overflow_drops".into(),
                self.pending_overflow_drops.get(),
            ),
            (
                "pending_timeout_drops".into(),
                self.pending_timeout_drops.get(),
            ),
            ("pending_discarded".into(), self.pending_discarded.get()),
            (
                "neigh_entries".into(),
                self.neigh_entries.load(Ordering::Relaxed),
            ),
        ];

        let ports = self.ports.read();
        let mut ids: Vec<_> = ports.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(stats) = ports.get(&id) {
                result.extend([
                    (format!("port{}_tx_packets", id), stats.tx_packets.get()),
                    (format!("port{}_tx_bytes", id), stats.tx_bytes.get()),
                    (format!("port{}_tx_errors", id), stats.tx_errors.get()),
                ]);
            }
        }

        result
    }
}
