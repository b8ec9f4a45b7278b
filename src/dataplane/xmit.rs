//! Load-balancing transmit engine
//!
//! Per packet: header rewrite for the forwarding mode, IPv4 checksum,
//! protocol handler, next-hop resolution through the connection's cache,
//! handoff to egress. Anything that goes wrong drops the packet; the caller
//! only ever sees `Forwarded` or `Dropped`.

use super::connection::{Connection, NextHopSlot};
use super::packet::Packet;
use super::routing::{NextHop, RouteLookup};
use crate::config::XmitConfig;
use crate::telemetry::MetricsRegistry;
use crate::Result;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Forwarding mode of a transmit call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XmitMode {
    /// Client to real server, destination rewritten
    Nat,
    /// Real server to client, source rewritten to the VIP
    NatResponse,
    /// Client to real server, both addresses rewritten
    FullNat,
    /// Real server to client, both addresses rewritten
    FullNatResponse,
    /// Unmodified packet sent towards the real server
    DirectRouting,
}

impl XmitMode {
    pub fn is_response(self) -> bool {
        matches!(self, XmitMode::NatResponse | XmitMode::FullNatResponse)
    }

    /// Forward directions that may bind a template connection's client port
    fn learns_client_port(self) -> bool {
        matches!(self, XmitMode::Nat | XmitMode::FullNat)
    }
}

/// Outcome of a transmit call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmitResult {
    Forwarded,
    Dropped,
}

/// Handler verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Protocol specific payload mangling, one method per direction
pub trait ProtocolHandler: Send + Sync {
    fn dnat(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        Verdict::Accept
    }

    fn snat(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        Verdict::Accept
    }

    fn fnat_in(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        Verdict::Accept
    }

    fn fnat_out(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        Verdict::Accept
    }
}

/// Handler for protocols with nothing to mangle
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl ProtocolHandler for PassThrough {}

/// Packet send primitive
pub trait Egress: Send + Sync {
    /// Send `packet` towards `next_hop`, or with `None` let the egress
    /// layer route it itself.
    fn send(&self, packet: Packet, next_hop: Option<Arc<NextHop>>) -> Result<()>;
}

impl<T: Egress + ?Sized> Egress for Arc<T> {
    fn send(&self, packet: Packet, next_hop: Option<Arc<NextHop>>) -> Result<()> {
        (**self).send(packet, next_hop)
    }
}

pub struct TransmitEngine<R: RouteLookup, E: Egress> {
    config: XmitConfig,
    routes: R,
    egress: E,
    metrics: Arc<MetricsRegistry>,
    route_epoch: AtomicU64,
}

impl<R: RouteLookup, E: Egress> TransmitEngine<R, E> {
    pub fn new(config: XmitConfig, routes: R, egress: E, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            routes,
            egress,
            metrics,
            route_epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &XmitConfig {
        &self.config
    }

    pub fn routes(&self) -> &R {
        &self.routes
    }

    pub fn egress(&self) -> &E {
        &self.egress
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Forward one packet of `conn` in the given mode.
    pub fn transmit(
        &self,
        mut packet: Packet,
        conn: &Connection,
        handler: &dyn ProtocolHandler,
        mode: XmitMode,
    ) -> XmitResult {
        if packet.header_len().is_none() {
            self.metrics.xmit_dropped_malformed.inc();
            debug!(?mode, "Bad IPv4 header length, dropping");
            return XmitResult::Dropped;
        }

        // Checked before anything is rewritten so a drop leaves the packet
        // as it arrived
        if mode.learns_client_port() && conn.needs_client_port() {
            match packet.transport_src_port() {
                Some(port) => {
                    conn.fill_client_port(port);
                    self.metrics.cport_filled.inc();
                    trace!(?mode, port, "Client port learned");
                }
                None => {
                    self.metrics.xmit_dropped_malformed.inc();
                    debug!(?mode, "No transport header to learn client port, dropping");
                    return XmitResult::Dropped;
                }
            }
        }

        if mode != XmitMode::DirectRouting {
            rewrite(&mut packet, conn, mode);
            self.fix_checksum(&mut packet);

            if self.mangle(&mut packet, conn, handler, mode) == Verdict::Reject {
                self.metrics.xmit_dropped_handler.inc();
                debug!(?mode, "Protocol handler rejected packet");
                return XmitResult::Dropped;
            }
        }

        let next_hop = self.route(&packet, conn, mode);

        match self.egress.send(packet, next_hop) {
            Ok(()) => {
                self.metrics.xmit_forwarded.inc();
                XmitResult::Forwarded
            }
            Err(e) => {
                self.metrics.xmit_dropped_egress.inc();
                debug!(?mode, error = %e, "Egress failed");
                XmitResult::Dropped
            }
        }
    }

    /// Make every next hop cached so far count as stale
    pub fn invalidate_routes(&self) {
        let epoch = self.route_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(epoch, "Route cache invalidated");
    }

    pub fn route_epoch(&self) -> u64 {
        self.route_epoch.load(Ordering::Acquire)
    }

    fn fix_checksum(&self, packet: &mut Packet) {
        packet.zero_checksum();
        if self.config.checksum_offload {
            packet.request_checksum_offload();
        } else {
            packet.fill_checksum();
        }
    }

    fn mangle(
        &self,
        packet: &mut Packet,
        conn: &Connection,
        handler: &dyn ProtocolHandler,
        mode: XmitMode,
    ) -> Verdict {
        match mode {
            XmitMode::Nat => handler.dnat(packet, conn),
            XmitMode::NatResponse => handler.snat(packet, conn),
            XmitMode::FullNat => handler.fnat_in(packet, conn),
            XmitMode::FullNatResponse => handler.fnat_out(packet, conn),
            XmitMode::DirectRouting => Verdict::Accept,
        }
    }

    fn route(&self, packet: &Packet, conn: &Connection, mode: XmitMode) -> Option<Arc<NextHop>> {
        let (slot, fast) = if mode.is_response() {
            (&conn.out_nh, self.config.fast_xmit_outbound)
        } else {
            (&conn.in_nh, self.config.fast_xmit_inbound)
        };
        let dst = match mode {
            XmitMode::DirectRouting => conn.daddr,
            _ => packet.dst_addr(),
        };

        self.next_hop(slot, fast, packet.vrf(), dst)
    }

    fn next_hop(
        &self,
        slot: &NextHopSlot,
        fast: bool,
        vrf: u32,
        dst: Ipv4Addr,
    ) -> Option<Arc<NextHop>> {
        let min_epoch = self
            .config
            .invalidate_on_route_change
            .then(|| self.route_epoch());

        // Without fast xmit the slot is never filled here; egress routes
        if !fast {
            return slot.load(min_epoch);
        }
        if let Some(next_hop) = slot.load(min_epoch) {
            self.metrics.route_cache_hits.inc();
            return Some(next_hop);
        }

        // Stamp before the lookup so an invalidation racing with it wins
        let epoch = self.route_epoch();
        self.metrics.route_lookups.inc();
        let Some(next_hop) = self.routes.next_hop(vrf, dst) else {
            self.metrics.route_unreachable.inc();
            debug!(vrf, %dst, "No route, leaving it to egress");
            return None;
        };

        slot.store(epoch, Arc::clone(&next_hop));
        Some(next_hop)
    }
}

fn rewrite(packet: &mut Packet, conn: &Connection, mode: XmitMode) {
    match mode {
        XmitMode::Nat => packet.set_dst_addr(conn.daddr),
        XmitMode::NatResponse => packet.set_src_addr(conn.vaddr),
        XmitMode::FullNat => {
            packet.set_src_addr(conn.laddr);
            packet.set_dst_addr(conn.daddr);
        }
        XmitMode::FullNatResponse => {
            packet.set_src_addr(conn.vaddr);
            packet.set_dst_addr(conn.caddr);
        }
        XmitMode::DirectRouting => {}
    }
}
