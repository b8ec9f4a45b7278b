//! End-to-end transmit scenarios driven through the public API

use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use vsplane::config::XmitConfig;
use vsplane::dataplane::{
    Connection, Egress, NextHop, Packet, PassThrough, ProtocolHandler, RouteLookup,
    TransmitEngine, Verdict, XmitMode, XmitResult,
};
use vsplane::protocol::ipv4::Ipv4Builder;
use vsplane::telemetry::MetricsRegistry;
use vsplane::Result;

const CLIENT: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
const VIP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 80);
const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);
const REAL: Ipv4Addr = Ipv4Addr::new(10, 20, 0, 5);

/// Route lookup that answers every query with one next hop and records
/// what it was asked.
struct FixedRoutes {
    next_hop: Arc<NextHop>,
    queries: Mutex<Vec<(u32, Ipv4Addr)>>,
}

impl FixedRoutes {
    fn new(port: u32) -> Self {
        Self {
            next_hop: Arc::new(NextHop::via(Ipv4Addr::new(10, 0, 0, 254), port)),
            queries: Mutex::new(Vec::new()),
        }
    }
}

impl RouteLookup for FixedRoutes {
    fn next_hop(&self, vrf: u32, dst: Ipv4Addr) -> Option<Arc<NextHop>> {
        self.queries.lock().push((vrf, dst));
        Some(Arc::clone(&self.next_hop))
    }
}

#[derive(Default)]
struct RecordingEgress {
    sent: Mutex<Vec<(Packet, Option<Arc<NextHop>>)>>,
}

impl Egress for RecordingEgress {
    fn send(&self, packet: Packet, next_hop: Option<Arc<NextHop>>) -> Result<()> {
        self.sent.lock().push((packet, next_hop));
        Ok(())
    }
}

/// Handler that records which direction it was called for
#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<&'static str>>,
}

impl ProtocolHandler for RecordingHandler {
    fn dnat(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        self.calls.lock().push("dnat");
        Verdict::Accept
    }

    fn snat(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        self.calls.lock().push("snat");
        Verdict::Accept
    }

    fn fnat_in(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        self.calls.lock().push("fnat_in");
        Verdict::Accept
    }

    fn fnat_out(&self, _packet: &mut Packet, _conn: &Connection) -> Verdict {
        self.calls.lock().push("fnat_out");
        Verdict::Accept
    }
}

type Engine = TransmitEngine<FixedRoutes, RecordingEgress>;

fn make_engine() -> Engine {
    TransmitEngine::new(
        XmitConfig::default(),
        FixedRoutes::new(3),
        RecordingEgress::default(),
        Arc::new(MetricsRegistry::new()),
    )
}

fn make_conn() -> Connection {
    Connection::new((CLIENT, 51_000), (VIP, 443), (LOCAL, 6_000), (REAL, 8_443))
}

fn make_packet(src: Ipv4Addr, dst: Ipv4Addr, vrf: u32) -> Packet {
    let data = Ipv4Builder::new()
        .identification(0x1234)
        .src_addr(src)
        .dst_addr(dst)
        .udp(51_000, 443, b"request")
        .build();
    Packet::new(data, vrf).unwrap()
}

fn take_sent(engine: &Engine) -> Vec<(Packet, Option<Arc<NextHop>>)> {
    std::mem::take(&mut *engine.egress().sent.lock())
}

#[test]
fn test_nat_forward() {
    let engine = make_engine();
    let conn = make_conn();
    let handler = RecordingHandler::default();

    let result = engine.transmit(make_packet(CLIENT, VIP, 2), &conn, &handler, XmitMode::Nat);
    assert_eq!(result, XmitResult::Forwarded);

    let sent = take_sent(&engine);
    assert_eq!(sent.len(), 1);
    let (packet, next_hop) = &sent[0];
    assert_eq!(packet.src_addr(), CLIENT);
    assert_eq!(packet.dst_addr(), REAL);
    assert!(packet.header_checksum_valid());
    assert_eq!(next_hop.as_ref().unwrap().port, 3);

    assert_eq!(*handler.calls.lock(), vec!["dnat"]);
    // Looked up by packet VRF and rewritten destination
    assert_eq!(*engine.routes().queries.lock(), vec![(2, REAL)]);
    assert!(!conn.in_nh.is_empty());
}

#[test]
fn test_full_nat_forward() {
    let engine = make_engine();
    let conn = make_conn().without_client_port();
    let handler = RecordingHandler::default();

    let result = engine.transmit(make_packet(CLIENT, VIP, 0), &conn, &handler, XmitMode::FullNat);
    assert_eq!(result, XmitResult::Forwarded);

    let sent = take_sent(&engine);
    let (packet, _) = &sent[0];
    assert_eq!(packet.src_addr(), LOCAL);
    assert_eq!(packet.dst_addr(), REAL);
    assert!(packet.header_checksum_valid());

    assert_eq!(conn.cport(), 51_000);
    assert!(!conn.needs_client_port());
    assert_eq!(*handler.calls.lock(), vec!["fnat_in"]);
}

#[test]
fn test_full_nat_response() {
    let engine = make_engine();
    let conn = make_conn();
    let handler = RecordingHandler::default();

    let result = engine.transmit(
        make_packet(REAL, LOCAL, 0),
        &conn,
        &handler,
        XmitMode::FullNatResponse,
    );
    assert_eq!(result, XmitResult::Forwarded);

    let sent = take_sent(&engine);
    let (packet, _) = &sent[0];
    assert_eq!(packet.src_addr(), VIP);
    assert_eq!(packet.dst_addr(), CLIENT);
    assert!(packet.header_checksum_valid());

    assert_eq!(*handler.calls.lock(), vec!["fnat_out"]);
    assert!(!conn.out_nh.is_empty());
    assert!(conn.in_nh.is_empty());
}

#[test]
fn test_malformed_no_client_port_packet_dropped_unmodified() {
    let engine = make_engine();
    let conn = make_conn().without_client_port();
    let handler = RecordingHandler::default();

    // Header only, no transport header to read the port from
    let data = Ipv4Builder::new().src_addr(CLIENT).dst_addr(VIP).build();
    let packet = Packet::new(data, 0).unwrap();

    let result = engine.transmit(packet, &conn, &handler, XmitMode::FullNat);
    assert_eq!(result, XmitResult::Dropped);

    assert!(take_sent(&engine).is_empty());
    assert!(handler.calls.lock().is_empty());
    assert!(conn.needs_client_port());
    assert!(conn.in_nh.is_empty());
    assert!(engine.routes().queries.lock().is_empty());
    assert_eq!(engine.metrics().xmit_dropped_malformed.get(), 1);
    assert_eq!(engine.metrics().cport_filled.get(), 0);
}

#[test]
fn test_nat_response_and_direct_routing() {
    let engine = make_engine();
    let conn = make_conn();

    engine.transmit(make_packet(REAL, CLIENT, 0), &conn, &PassThrough, XmitMode::NatResponse);
    engine.transmit(make_packet(CLIENT, VIP, 0), &conn, &PassThrough, XmitMode::DirectRouting);

    let sent = take_sent(&engine);
    assert_eq!(sent[0].0.src_addr(), VIP);
    assert_eq!(sent[0].0.dst_addr(), CLIENT);
    assert_eq!(sent[1].0.src_addr(), CLIENT);
    assert_eq!(sent[1].0.dst_addr(), VIP);

    // DR is routed towards the real server
    assert_eq!(*engine.routes().queries.lock(), vec![(0, CLIENT), (0, REAL)]);
}

#[test]
fn test_route_slot_filled_once_per_direction() {
    let engine = make_engine();
    let conn = make_conn();

    for _ in 0..4 {
        engine.transmit(make_packet(CLIENT, VIP, 0), &conn, &PassThrough, XmitMode::FullNat);
        engine.transmit(
            make_packet(REAL, LOCAL, 0),
            &conn,
            &PassThrough,
            XmitMode::FullNatResponse,
        );
    }

    assert_eq!(engine.routes().queries.lock().len(), 2);
    assert_eq!(engine.metrics().route_cache_hits.get(), 6);
    assert_eq!(engine.metrics().xmit_forwarded.get(), 8);
}

#[test]
fn test_concurrent_transmit_on_shared_connection() {
    let engine = make_engine();
    let conn = make_conn().without_client_port();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    let result =
                        engine.transmit(make_packet(CLIENT, VIP, 0), &conn, &PassThrough, XmitMode::FullNat);
                    assert_eq!(result, XmitResult::Forwarded);
                }
            });
        }
    });

    assert_eq!(engine.metrics().xmit_forwarded.get(), 400);
    assert_eq!(conn.cport(), 51_000);
    assert_eq!(take_sent(&engine).len(), 400);
}
