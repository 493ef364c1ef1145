//! Heartbeat Monitor
//!
//! Liveness policing for registered connections. Clients are expected to send
//! a heartbeat at least once per interval; a connection that misses its
//! window is probed once, and one that stays silent through the grace period
//! is torn down as timed out.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use super::bridge::PubSubBridge;
use super::frames::ServerFrame;
use super::registry::{ConnectionRegistry, DisconnectCause, Liveness};

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<PubSubBridge>,
    interval: Duration,
    grace: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<PubSubBridge>,
        interval: Duration,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { registry, bridge, interval, grace })
    }

    /// One policing sweep over every live connection.
    ///
    /// ALIVE connections past the interval become SUSPECT and get a single
    /// ping probe; SUSPECT connections past interval plus grace are torn
    /// down. Any heartbeat restores ALIVE, so a probe answered in time
    /// cancels the suspicion.
    pub fn probe(&self) {
        for conn in self.registry.all_connections() {
            let age = conn.heartbeat_age();
            match conn.liveness() {
                Liveness::Alive if age > self.interval => {
                    conn.mark_suspect();
                    tracing::debug!(
                        session_id = %conn.id(),
                        idle_ms = age.as_millis() as u64,
                        "connection suspect; probing"
                    );
                    if conn.push(ServerFrame::Ping).is_err() {
                        self.bridge.drop_connection(&conn, DisconnectCause::TransportError);
                    }
                }
                Liveness::Suspect if age > self.interval + self.grace => {
                    tracing::info!(
                        session_id = %conn.id(),
                        user_id = %conn.user_id(),
                        idle_ms = age.as_millis() as u64,
                        "heartbeat timeout"
                    );
                    self.bridge.drop_connection(&conn, DisconnectCause::HeartbeatTimeout);
                }
                _ => {}
            }
        }
    }

    /// Periodic policing task. Sweeps at the grace period so a timed-out
    /// connection is detected within one grace window of its deadline.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.grace);
        loop {
            ticker.tick().await;
            self.probe();
        }
    }
}
