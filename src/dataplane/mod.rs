//! Data plane components
//!
//! Neighbor resolution and the load-balancing transmit path.

mod aging;
mod connection;
mod neighbor_cache;
mod neighbor_egress;
mod neighbor_store;
mod packet;
mod routing;
mod xmit;

pub use aging::spawn_aging_task;
pub use connection::{flags, Connection, NextHopSlot};
pub use neighbor_cache::{
    AgeReport, NeighborCache, NeighborKey, NeighborRef, NeighborSnapshot, PendingPacket,
    RetryRequest, SaveDrop, SaveOutcome, TimedOut,
};
pub use neighbor_egress::{FrameSink, InterfaceInfo, NeighborEgress, OutboundFrame};
pub use neighbor_store::EntryIndex;
pub use packet::Packet;
pub use routing::{NextHop, Route, RouteLookup, RouteSource, RoutingTable};
pub use xmit::{
    Egress, PassThrough, ProtocolHandler, TransmitEngine, Verdict, XmitMode, XmitResult,
};
