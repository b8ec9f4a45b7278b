//! vsplane - load balancer data-plane core
//!
//! Neighbor resolution cache and the NAT / Full-NAT / Direct Routing
//! transmit engine of a user-space forwarding stack.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
