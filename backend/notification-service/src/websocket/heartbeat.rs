/// Heartbeat monitor
///
/// Every cycle each connection either gets a protocol ping (and its liveness
/// flag cleared) or, if it never answered the previous ping, is terminated.
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::connection::{ConnectionId, Frame};
use super::registry::ConnectionRegistry;
use crate::metrics;

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const HEARTBEAT_TIMEOUT_REASON: &str = "Heartbeat timeout";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub terminated: usize,
}

/// Run one heartbeat cycle
pub fn sweep(registry: &ConnectionRegistry) -> HeartbeatReport {
    let mut report = HeartbeatReport::default();

    let dead: Vec<ConnectionId> = {
        let mut inner = registry.lock();
        let mut dead = Vec::new();
        for connection in inner.connections.values_mut() {
            if !connection.alive {
                dead.push(connection.id);
                continue;
            }
            connection.alive = false;
            if connection.write(Frame::Ping) {
                report.pinged += 1;
            }
        }
        dead
    };

    for id in dead {
        if registry.terminate(id, CLOSE_GOING_AWAY, HEARTBEAT_TIMEOUT_REASON) {
            metrics::heartbeat_terminated();
            report.terminated += 1;
        }
    }

    if report.terminated > 0 {
        tracing::info!(
            terminated = report.terminated,
            pinged = report.pinged,
            "heartbeat terminated unresponsive connections"
        );
    }
    report
}

/// Spawn the monitor loop. The first sweep happens one full interval after start.
pub fn spawn(registry: ConnectionRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let report = sweep(&registry);
            tracing::trace!(pinged = report.pinged, "heartbeat sweep");
        }
    })
}
