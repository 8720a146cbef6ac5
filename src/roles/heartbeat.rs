use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{RelayConfig, ThreadRange};
use crate::connection::dual::HeartbeatOutcome;
use crate::connection::registry::ConnectionRegistry;
use crate::connection::Connection;
use crate::pool::{Role, Worker};


/// Periodically checks all connections: sends keep-alives on idle channels, disposes connections
///  whose stream went silent, unbinds silent datagram channels, and decays string tables.
pub struct HeartbeatRole {
    registry: Arc<ConnectionRegistry>,
    config: Arc<RelayConfig>,
}

impl HeartbeatRole {
    pub fn new(registry: Arc<ConnectionRegistry>, config: Arc<RelayConfig>) -> HeartbeatRole {
        HeartbeatRole { registry, config }
    }

    /// one pass over all connections
    pub fn beat(&self, now: Instant, cleanup_strings: bool) {
        for conn in self.registry.all() {
            match conn.heartbeat(now) {
                HeartbeatOutcome::Alive => {}
                HeartbeatOutcome::TimedOut => {
                    info!(uid = conn.uid(), "connection timed out");
                    conn.dispose();
                    continue;
                }
                HeartbeatOutcome::UdpTimedOut => {
                    debug!(uid = conn.uid(), "datagram channel timed out, falling back to the stream");
                    self.registry.unbind_endpoint(&conn);
                }
            }
            if cleanup_strings {
                if let Some(strings) = conn.strings() {
                    strings.cleanup();
                }
            }
        }
    }
}

impl Role for HeartbeatRole {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn threads(&self) -> ThreadRange {
        self.config.pool.heartbeat
    }

    fn run_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        let mut last_cleanup = Instant::now();
        while !worker.cancel().wait_timeout(self.config.heartbeat_interval) {
            let _active = worker.active();
            let now = Instant::now();
            let cleanup_strings = now.duration_since(last_cleanup) >= self.config.string_table_cleanup_interval;
            if cleanup_strings {
                last_cleanup = now;
            }
            self.beat(now, cleanup_strings);
        }
        Ok(())
    }
}
