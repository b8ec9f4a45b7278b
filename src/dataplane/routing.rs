//! Next-hop routing
//!
//! The transmit engine only needs `RouteLookup`. `RoutingTable` is the
//! in-process implementation: a per-VRF longest prefix match over a sorted
//! route list, good enough for tests, the benchmark and small deployments.

use super::neighbor_cache::NeighborRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Where a routed packet leaves the box
pub struct NextHop {
    /// None for directly connected destinations
    pub gateway: Option<Ipv4Addr>,
    /// Egress port / interface index
    pub port: u32,
    /// 802.1Q VLAN, 0 when untagged
    pub vlan: u16,
    /// Last neighbor entry used for this next hop
    pub neighbor: NeighborRef,
}

impl NextHop {
    pub fn new(gateway: Option<Ipv4Addr>, port: u32, vlan: u16) -> Self {
        Self {
            gateway,
            port,
            vlan,
            neighbor: NeighborRef::new(),
        }
    }

    pub fn connected(port: u32) -> Self {
        Self::new(None, port, 0)
    }

    pub fn via(gateway: Ipv4Addr, port: u32) -> Self {
        Self::new(Some(gateway), port, 0)
    }

    pub fn with_vlan(mut self, vlan: u16) -> Self {
        self.vlan = vlan;
        self
    }

    /// Address whose link-layer binding is needed to reach `dst`
    pub fn resolve_target(&self, dst: Ipv4Addr) -> Ipv4Addr {
        self.gateway.unwrap_or(dst)
    }
}

impl fmt::Debug for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextHop")
            .field("gateway", &self.gateway)
            .field("port", &self.port)
            .field("vlan", &self.vlan)
            .finish()
    }
}

/// Routing lookup consumed by the transmit engine
pub trait RouteLookup: Send + Sync {
    fn next_hop(&self, vrf: u32, dst: Ipv4Addr) -> Option<Arc<NextHop>>;
}

impl<T: RouteLookup + ?Sized> RouteLookup for Arc<T> {
    fn next_hop(&self, vrf: u32, dst: Ipv4Addr) -> Option<Arc<NextHop>> {
        (**self).next_hop(vrf, dst)
    }
}

/// Route entry
#[derive(Debug, Clone)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub next_hop: Arc<NextHop>,
    pub metric: u32,
    pub source: RouteSource,
}

impl Route {
    pub fn new(destination: Ipv4Addr, prefix_len: u8, next_hop: NextHop) -> Self {
        let source = if next_hop.gateway.is_none() {
            RouteSource::Connected
        } else {
            RouteSource::Static
        };

        Self {
            destination,
            prefix_len: prefix_len.min(32),
            next_hop: Arc::new(next_hop),
            metric: 0,
            source,
        }
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - self.prefix_len)
        }
    }

    fn matches(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(addr) & mask) == (u32::from(self.destination) & mask)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Directly connected network
    Connected,
    /// Configured through a gateway
    Static,
}

/// Longest prefix match table, one route list per VRF
#[derive(Debug, Default)]
pub struct RoutingTable {
    vrfs: HashMap<u32, Vec<Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, replacing one with the same destination/prefix
    pub fn add(&mut self, vrf: u32, route: Route) {
        let routes = self.vrfs.entry(vrf).or_default();
        routes.retain(|r| r.destination != route.destination || r.prefix_len != route.prefix_len);
        routes.push(route);
        // Longest prefix first, then lowest metric
        routes.sort_by(|a, b| {
            b.prefix_len
                .cmp(&a.prefix_len)
                .then(a.metric.cmp(&b.metric))
        });
    }

    pub fn remove(&mut self, vrf: u32, destination: Ipv4Addr, prefix_len: u8) -> bool {
        let Some(routes) = self.vrfs.get_mut(&vrf) else {
            return false;
        };
        let before = routes.len();
        routes.retain(|r| r.destination != destination || r.prefix_len != prefix_len);
        before != routes.len()
    }

    pub fn lookup(&self, vrf: u32, addr: Ipv4Addr) -> Option<&Route> {
        self.vrfs.get(&vrf)?.iter().find(|r| r.matches(addr))
    }

    pub fn routes(&self, vrf: u32) -> &[Route] {
        self.vrfs.get(&vrf).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.vrfs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RouteLookup for RoutingTable {
    fn next_hop(&self, vrf: u32, dst: Ipv4Addr) -> Option<Arc<NextHop>> {
        self.lookup(vrf, dst).map(|r| Arc::clone(&r.next_hop))
    }
}

/// Shared table updated by a control plane while workers read it
impl RouteLookup for RwLock<RoutingTable> {
    fn next_hop(&self, vrf: u32, dst: Ipv4Addr) -> Option<Arc<NextHop>> {
        self.read().next_hop(vrf, dst)
    }
}
