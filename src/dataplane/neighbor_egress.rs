//! Neighbor-aware egress
//!
//! Turns routed IPv4 packets into Ethernet frames. The gateway's (or
//! directly connected destination's) MAC comes from the neighbor cache,
//! trying the next hop's per-flow pointer first. Unresolved packets are
//! parked on the cache and an ARP request goes out for the first one.
//! Incoming ARP feeds the cache back and releases parked packets.

use super::neighbor_cache::{AgeReport, NeighborCache, NeighborKey, PendingPacket, SaveOutcome};
use super::packet::Packet;
use super::routing::{NextHop, RouteLookup};
use super::xmit::Egress;
use crate::protocol::arp::{ArpOp, ArpPacket, ARP_PACKET_SIZE};
use crate::protocol::ethernet::{Frame, FrameBuilder};
use crate::protocol::{EtherType, MacAddr};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Port transmit primitive
pub trait FrameSink: Send + Sync {
    fn transmit(&self, port: u32, frame: Vec<u8>) -> Result<()>;

    /// Whether the port fills in IPv4 header checksums itself
    fn ip_checksum_offload(&self) -> bool {
        false
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn transmit(&self, port: u32, frame: Vec<u8>) -> Result<()> {
        (**self).transmit(port, frame)
    }

    fn ip_checksum_offload(&self) -> bool {
        (**self).ip_checksum_offload()
    }
}

/// Local addressing of a port
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub ip_addr: Ipv4Addr,
    pub mac_addr: MacAddr,
    pub prefix_len: u8,
    pub vrf: u32,
}

impl InterfaceInfo {
    fn is_in_network(&self, addr: Ipv4Addr) -> bool {
        let mask = if self.prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - self.prefix_len.min(32))
        };
        (u32::from(self.ip_addr) & mask) == (u32::from(addr) & mask)
    }
}

/// Frame ready to go out on a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub port: u32,
    pub frame: Vec<u8>,
}

pub struct NeighborEgress<S: FrameSink> {
    cache: Arc<NeighborCache>,
    sink: S,
    interfaces: RwLock<HashMap<u32, InterfaceInfo>>,
    routes: Option<Arc<dyn RouteLookup>>,
    metrics: Arc<MetricsRegistry>,
}

impl<S: FrameSink> NeighborEgress<S> {
    pub fn new(cache: Arc<NeighborCache>, sink: S) -> Self {
        let metrics = Arc::clone(cache.metrics());
        Self {
            cache,
            sink,
            interfaces: RwLock::new(HashMap::new()),
            routes: None,
            metrics,
        }
    }

    /// Route packets handed over without a next hop through `routes`
    pub fn with_fallback_routes(mut self, routes: Arc<dyn RouteLookup>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn cache(&self) -> &Arc<NeighborCache> {
        &self.cache
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn add_interface(&self, port: u32, info: InterfaceInfo) {
        self.metrics.register_port(port);
        self.interfaces.write().insert(port, info);
    }

    /// Forget a port and every neighbor learned on it
    pub fn remove_interface(&self, port: u32) -> Option<InterfaceInfo> {
        let info = self.interfaces.write().remove(&port)?;
        self.cache.remove_interface(port);
        Some(info)
    }

    pub fn interface(&self, port: u32) -> Option<InterfaceInfo> {
        self.interfaces.read().get(&port).cloned()
    }

    /// Process an ARP packet received on `port`: learn the sender, release
    /// packets parked on it and answer requests for our address. Returns
    /// the frames to transmit.
    pub fn handle_arp(&self, port: u32, arp: &ArpPacket, now: Instant) -> Result<Vec<OutboundFrame>> {
        self.handle_tagged_arp(port, 0, arp, now)
    }

    /// Raw Ethernet frame variant of `handle_arp`; anything that is not
    /// ARP is ignored. Replies carry the request's VLAN tag.
    pub fn handle_frame(&self, port: u32, frame: &[u8], now: Instant) -> Result<Vec<OutboundFrame>> {
        let frame = Frame::parse(frame)?;
        if EtherType::from_u16(frame.ethertype()) != Some(EtherType::Arp) {
            return Ok(Vec::new());
        }
        let vlan = frame.vlan_tag().map_or(0, |tag| tag.vid);
        let arp = ArpPacket::parse(frame.payload())?;
        self.handle_tagged_arp(port, vlan, &arp, now)
    }

    fn handle_tagged_arp(
        &self,
        port: u32,
        vlan: u16,
        arp: &ArpPacket,
        now: Instant,
    ) -> Result<Vec<OutboundFrame>> {
        let iface = self
            .interface(port)
            .ok_or(Error::InterfaceNotFound { ifindex: port })?;
        let key = NeighborKey::new(iface.vrf, arp.sender_ip);
        let mut frames = Vec::new();

        // Learn on-link senders we already track or who are talking to us
        let known = self.cache.entry_index(&key).is_some();
        let for_us = arp.target_ip == iface.ip_addr;
        let valid_sender = iface.is_in_network(arp.sender_ip)
            && !arp.sender_mac.is_multicast()
            && !arp.sender_mac.is_zero();
        if (known || for_us) && valid_sender {
            let flushed = self.cache.resolve(&key, arp.sender_mac, port, now)?;
            if !flushed.is_empty() {
                trace!(%key, count = flushed.len(), "Releasing parked packets");
            }
            frames.extend(self.frame_pending(flushed, arp.sender_mac, port));
        }

        if arp.operation == ArpOp::Request && for_us {
            let reply = ArpPacket::reply(
                iface.mac_addr,
                iface.ip_addr,
                arp.sender_mac,
                arp.sender_ip,
            );
            frames.push(OutboundFrame {
                port,
                frame: arp_frame(arp.sender_mac, iface.mac_addr, vlan, &reply),
            });
        }

        Ok(frames)
    }

    /// Run one aging pass and send the ARP retries it asks for
    pub fn age(&self, now: Instant) -> AgeReport {
        let report = self.cache.age(now);

        for retry in &report.retries {
            let Some(iface) = self.interface(retry.ifindex) else {
                debug!(key = %retry.key, ifindex = retry.ifindex, "Retry for unknown interface");
                continue;
            };
            let frame = self.request_frame(&iface, retry.key.addr, retry.vlan);
            trace!(key = %retry.key, attempt = retry.attempt, "ARP retry");
            self.deliver(OutboundFrame {
                port: retry.ifindex,
                frame,
            });
        }

        report
    }

    /// Send frames, counting failures against their port
    pub fn deliver_all(&self, frames: Vec<OutboundFrame>) -> usize {
        frames
            .into_iter()
            .map(|frame| self.deliver(frame))
            .filter(|sent| *sent)
            .count()
    }

    fn deliver(&self, out: OutboundFrame) -> bool {
        let port = out.port;
        match self.send_frame(port, out.frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(port, error = %e, "Transmit failed");
                false
            }
        }
    }

    fn send_frame(&self, port: u32, frame: Vec<u8>) -> Result<()> {
        let len = frame.len();
        match self.sink.transmit(port, frame) {
            Ok(()) => {
                self.metrics.record_tx(port, len);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_tx_error(port);
                Err(e)
            }
        }
    }

    fn frame_pending(
        &self,
        pending: Vec<PendingPacket>,
        mac: MacAddr,
        port: u32,
    ) -> Vec<OutboundFrame> {
        pending
            .into_iter()
            .filter_map(|p| {
                let (port, vlan) = p
                    .next_hop
                    .as_ref()
                    .map_or((port, 0), |nh| (nh.port, nh.vlan));
                let iface = self.interface(port)?;
                Some(OutboundFrame {
                    port,
                    frame: self.ip_frame(&iface, mac, vlan, p.packet),
                })
            })
            .collect()
    }

    fn ip_frame(&self, iface: &InterfaceInfo, dst: MacAddr, vlan: u16, mut packet: Packet) -> Vec<u8> {
        if packet.checksum_offload_requested() && !self.sink.ip_checksum_offload() {
            packet.fill_checksum();
        }

        FrameBuilder::with_capacity(packet.len())
            .dst_mac(dst)
            .src_mac(iface.mac_addr)
            .vlan(vlan)
            .ethertype(EtherType::Ipv4)
            .payload(packet.as_bytes())
            .build()
    }

    fn request_frame(&self, iface: &InterfaceInfo, target: Ipv4Addr, vlan: u16) -> Vec<u8> {
        let request = ArpPacket::request(iface.mac_addr, iface.ip_addr, target);
        arp_frame(MacAddr::BROADCAST, iface.mac_addr, vlan, &request)
    }

    fn route_fallback(&self, packet: &Packet) -> Result<Arc<NextHop>> {
        self.routes
            .as_ref()
            .and_then(|routes| routes.next_hop(packet.vrf(), packet.dst_addr()))
            .ok_or_else(|| Error::Egress(format!("no route to {}", packet.dst_addr())))
    }
}

impl<S: FrameSink> Egress for NeighborEgress<S> {
    fn send(&self, packet: Packet, next_hop: Option<Arc<NextHop>>) -> Result<()> {
        let now = Instant::now();
        let next_hop = match next_hop {
            Some(nh) => nh,
            None => self.route_fallback(&packet)?,
        };
        let port = next_hop.port;
        let iface = self
            .interface(port)
            .ok_or(Error::InterfaceNotFound { ifindex: port })?;

        let target = next_hop.resolve_target(packet.dst_addr());
        let key = NeighborKey::new(packet.vrf(), target);

        if let Some(mac) = self
            .cache
            .lookup_with_ref(&next_hop.neighbor, &key, port, now)
        {
            let frame = self.ip_frame(&iface, mac, next_hop.vlan, packet);
            return self.send_frame(port, frame);
        }

        match self
            .cache
            .save(packet, Some(Arc::clone(&next_hop)), &key, port, now)
        {
            SaveOutcome::RequestResolution => {
                let frame = self.request_frame(&iface, target, next_hop.vlan);
                self.send_frame(port, frame)
            }
            SaveOutcome::Queued => Ok(()),
            SaveOutcome::Resolved { pending, mac } => {
                let frame = self.ip_frame(&iface, mac, next_hop.vlan, pending.packet);
                self.send_frame(port, frame)
            }
            SaveOutcome::Dropped(reason) => {
                Err(Error::Egress(format!("{} not resolved: {:?}", key, reason)))
            }
        }
    }
}

fn arp_frame(dst: MacAddr, src: MacAddr, vlan: u16, arp: &ArpPacket) -> Vec<u8> {
    FrameBuilder::with_capacity(ARP_PACKET_SIZE)
        .dst_mac(dst)
        .src_mac(src)
        .vlan(vlan)
        .ethertype(EtherType::Arp)
        .payload(&arp.to_bytes())
        .build()
}
