//! Periodic neighbor aging driver

use super::neighbor_egress::{FrameSink, NeighborEgress};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Age the neighbor cache every `period` until `shutdown` flips to true or
/// its sender is dropped. ARP retries go out through `egress`.
pub fn spawn_aging_task<S>(
    egress: Arc<NeighborEgress<S>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: FrameSink + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let report = egress.age(Instant::now());
                    if !report.is_empty() {
                        debug!(
                            expired = report.expired.len(),
                            retries = report.retries.len(),
                            timed_out = report.timed_out.len(),
                            dropped = report.dropped_packets(),
                            "Neighbor aging pass"
                        );
                    }
                    egress.cache().metrics().set_neigh_entries(egress.cache().len());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Neighbor aging stopped");
    })
}
