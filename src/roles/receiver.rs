use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::ThreadRange;
use crate::connection::dual::{ReadOutcome, UdpBinding};
use crate::connection::registry::ConnectionRegistry;
use crate::connection::Connection;
use crate::pool::{Role, Worker};
use crate::roles::binder::{effective_threads, SocketBinder};
use crate::roles::dispose_after_error;
use crate::roles::poller::Poller;
use crate::util::rate::{RateMetric, RateSnapshot};


pub const TOKEN_DATAGRAM_MARKER: u8 = 0xFF;
pub const TOKEN_DATAGRAM_LEN: usize = 5;

/// upper bound for a blocked receive to notice cancellation, should the socket interrupt not
///  reach it
const UDP_READ_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_DATAGRAM_BUFFER: usize = 64 * 1024;


/// Reads the TCP streams of connections the poller reports as readable
pub struct TcpReceiverRole {
    poller: Arc<dyn Poller>,
    threads: ThreadRange,
    throughput: RateMetric,
}

impl TcpReceiverRole {
    pub fn new(poller: Arc<dyn Poller>, threads: ThreadRange) -> TcpReceiverRole {
        TcpReceiverRole {
            poller,
            threads,
            throughput: RateMetric::new(RateMetric::DEFAULT_TAU),
        }
    }
}

impl Role for TcpReceiverRole {
    fn name(&self) -> &str {
        "tcp-receiver"
    }

    fn threads(&self) -> ThreadRange {
        self.threads
    }

    fn run_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        let poller = self.poller.clone();
        worker.cancel().on_cancel(move || poller.wake());

        for conn in self.poller.start_polling(worker.cancel()) {
            let _active = worker.active();
            let (outcome, received) = match conn.receive_tcp() {
                Ok(r) => r,
                Err(e) => {
                    dispose_after_error(conn.as_ref(), "receiving failed", &e);
                    continue;
                }
            };
            if received.bytes > 0 {
                self.throughput.add(received.bytes, received.packets);
            }
            match outcome {
                ReadOutcome::Drained => {
                    if let Err(e) = self.poller.arm_connection(&conn) {
                        dispose_after_error(conn.as_ref(), "re-arming failed", &e);
                    }
                }
                ReadOutcome::PeerClosed => {
                    debug!(uid = conn.uid(), "peer closed the stream");
                    conn.dispose();
                }
            }
        }
        Ok(())
    }

    fn throughput(&self) -> Option<RateSnapshot> {
        Some(self.throughput.rate())
    }
}


/// Reads datagrams, binding endpoints to connections by their token and dispatching containers
///  from bound endpoints
pub struct UdpReceiverRole {
    binder: SocketBinder<UdpSocket>,
    registry: Arc<ConnectionRegistry>,
    threads: ThreadRange,
    throughput: RateMetric,
}

impl UdpReceiverRole {
    pub fn new(addr: SocketAddr, registry: Arc<ConnectionRegistry>, threads: ThreadRange) -> anyhow::Result<UdpReceiverRole> {
        Ok(UdpReceiverRole {
            binder: SocketBinder::new(addr)?,
            registry,
            threads: effective_threads(threads),
            throughput: RateMetric::new(RateMetric::DEFAULT_TAU),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.binder.local_addr()
    }
}

impl Role for UdpReceiverRole {
    fn name(&self) -> &str {
        "udp-receiver"
    }

    fn threads(&self) -> ThreadRange {
        self.threads
    }

    fn run_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        let socket = self.binder.socket_for_worker(worker.cancel())?;
        socket.set_read_timeout(Some(UDP_READ_TIMEOUT))?;
        let mut buf = vec![0u8; MAX_DATAGRAM_BUFFER];

        while !worker.is_cancelled() {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let _active = worker.active();
                    self.throughput.add(len, 1);
                    handle_datagram(&self.registry, &socket, &buf[..len], from);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                // ICMP port unreachable from an earlier send surfaces as a reset on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    trace!("ignoring datagram socket reset: {}", e);
                }
                Err(e) => {
                    if worker.is_cancelled() {
                        break;
                    }
                    warn!("receiving a datagram failed: {}", e);
                }
            }
        }
        Ok(())
    }

    fn throughput(&self) -> Option<RateSnapshot> {
        Some(self.throughput.rate())
    }
}

/// Datagrams that are not a valid token datagram and do not come from a bound endpoint are
///  dropped without a reply.
pub fn handle_datagram(registry: &ConnectionRegistry, socket: &Arc<UdpSocket>, datagram: &[u8], from: SocketAddr) {
    if datagram.is_empty() {
        return;
    }

    if datagram.len() == TOKEN_DATAGRAM_LEN && datagram[0] == TOKEN_DATAGRAM_MARKER {
        let mut token = [0u8; 4];
        token.copy_from_slice(&datagram[1..]);
        let token = u32::from_le_bytes(token);

        let Some(conn) = registry.by_token(token) else {
            trace!(%from, "dropping datagram with an unknown token");
            return;
        };
        registry.bind_endpoint(&conn, UdpBinding {
            endpoint: from,
            socket: socket.clone(),
        });
        if let Err(e) = socket.send_to(datagram, from) {
            debug!(uid = conn.uid(), %from, "echoing the token datagram failed: {}", e);
        }
        return;
    }

    match registry.by_endpoint(from) {
        Some(conn) => conn.receive_datagram(datagram),
        None => trace!(%from, "dropping datagram from an unbound endpoint"),
    }
}
