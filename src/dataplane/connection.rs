//! Connection record as seen by the transmit engine
//!
//! Lookup, hashing and expiry of connections live elsewhere; the engine
//! only reads the addresses, fills in a client port learned from the first
//! packet and caches next hops per direction.

use super::routing::NextHop;
use arc_swap::ArcSwapOption;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

/// Connection flags
pub mod flags {
    /// Client port not known yet (wildcard template)
    pub const NO_CPORT: u32 = 0x0004;
}

struct CachedNextHop {
    epoch: u64,
    next_hop: Arc<NextHop>,
}

/// Lazily filled next-hop cache for one direction of a connection.
///
/// Concurrent fills race benignly: last write wins.
#[derive(Default)]
pub struct NextHopSlot(ArcSwapOption<CachedNextHop>);

impl NextHopSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached next hop, ignoring one stamped before `min_epoch`
    pub fn load(&self, min_epoch: Option<u64>) -> Option<Arc<NextHop>> {
        let guard = self.0.load();
        let cached = (*guard).as_ref()?;
        if min_epoch.is_some_and(|epoch| cached.epoch < epoch) {
            return None;
        }
        Some(Arc::clone(&cached.next_hop))
    }

    pub fn store(&self, epoch: u64, next_hop: Arc<NextHop>) {
        self.0
            .store(Some(Arc::new(CachedNextHop { epoch, next_hop })));
    }

    pub fn clear(&self) {
        self.0.store(None);
    }

    pub fn is_empty(&self) -> bool {
        self.0.load().is_none()
    }
}

impl std::fmt::Debug for NextHopSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.0.load() {
            Some(cached) => write!(f, "NextHopSlot({:?} @{})", cached.next_hop, cached.epoch),
            None => write!(f, "NextHopSlot(empty)"),
        }
    }
}

/// Load-balanced connection
#[derive(Debug)]
pub struct Connection {
    /// Client
    pub caddr: Ipv4Addr,
    cport: AtomicU16,
    /// Virtual service
    pub vaddr: Ipv4Addr,
    pub vport: u16,
    /// Local address used towards the real server (Full-NAT)
    pub laddr: Ipv4Addr,
    pub lport: u16,
    /// Real server
    pub daddr: Ipv4Addr,
    pub dport: u16,
    flags: AtomicU32,
    /// Client to real server direction
    pub in_nh: NextHopSlot,
    /// Real server to client direction
    pub out_nh: NextHopSlot,
}

impl Connection {
    pub fn new(
        client: (Ipv4Addr, u16),
        vip: (Ipv4Addr, u16),
        local: (Ipv4Addr, u16),
        dest: (Ipv4Addr, u16),
    ) -> Self {
        Self {
            caddr: client.0,
            cport: AtomicU16::new(client.1),
            vaddr: vip.0,
            vport: vip.1,
            laddr: local.0,
            lport: local.1,
            daddr: dest.0,
            dport: dest.1,
            flags: AtomicU32::new(0),
            in_nh: NextHopSlot::new(),
            out_nh: NextHopSlot::new(),
        }
    }

    /// Template connection whose client port is learned from its first
    /// packet
    pub fn without_client_port(mut self) -> Self {
        *self.cport.get_mut() = 0;
        *self.flags.get_mut() |= flags::NO_CPORT;
        self
    }

    pub fn cport(&self) -> u16 {
        self.cport.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn needs_client_port(&self) -> bool {
        self.flags() & flags::NO_CPORT != 0
    }

    /// Bind the client port and clear the "not yet known" flag
    pub fn fill_client_port(&self, port: u16) {
        self.cport.store(port, Ordering::Release);
        self.flags.fetch_and(!flags::NO_CPORT, Ordering::AcqRel);
    }

    /// Drop both cached next hops
    pub fn invalidate_routes(&self) {
        self.in_nh.clear();
        self.out_nh.clear();
    }
}
