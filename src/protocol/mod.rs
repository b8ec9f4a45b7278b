//! Wire formats used by the data plane

pub mod arp;
pub mod ethernet;
pub mod ipv4;
pub mod types;

pub use types::*;
