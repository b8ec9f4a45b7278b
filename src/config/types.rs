//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration (vsplane.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub xmit: XmitConfig,
    #[serde(default)]
    pub neighbor: NeighborConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transmit engine switches
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct XmitConfig {
    /// Leave the IPv4 header checksum to the NIC
    pub checksum_offload: bool,
    /// Cache the next hop on the connection for client-to-server traffic
    pub fast_xmit_inbound: bool,
    /// Cache the next hop on the connection for server-to-client traffic
    pub fast_xmit_outbound: bool,
    /// Treat next hops cached before the last route change as absent
    pub invalidate_on_route_change: bool,
}

impl Default for XmitConfig {
    fn default() -> Self {
        Self {
            checksum_offload: false,
            fast_xmit_inbound: true,
            fast_xmit_outbound: true,
            invalidate_on_route_change: true,
        }
    }
}

/// Neighbor cache sizing and timers
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NeighborConfig {
    pub max_entries: usize,
    /// Idle time after which an entry without pending packets is reclaimed
    pub entry_ttl_secs: u64,
    /// Delay between resolution retries while packets are pending
    pub retry_interval_secs: u64,
    /// Retries before queued packets are dropped
    pub retry_limit: u32,
    /// Pending-packet cap per entry; newer packets are dropped beyond it
    pub max_pending_per_entry: usize,
    /// Period of the aging task
    pub aging_interval_ms: u64,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            entry_ttl_secs: 1200,
            retry_interval_secs: 1,
            retry_limit: 3,
            max_pending_per_entry: 16,
            aging_interval_ms: 1000,
        }
    }
}

impl NeighborConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug, trace
    pub level: String,
    /// pretty, compact, json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
