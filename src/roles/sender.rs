//! Sender roles drain the send queues of connections that had data queued. A connection is on
//!  a flush queue at most once at a time, so it is only ever drained by one worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver};
use tracing::{debug, trace};

use crate::config::ThreadRange;
use crate::connection::dual::DualConnection;
use crate::connection::Connection;
use crate::pool::{Role, Worker};
use crate::roles::dispose_after_error;
use crate::util::rate::{RateMetric, RateSnapshot};


/// how long an idle worker blocks before re-checking its deferred connections
const IDLE_WAIT: Duration = Duration::from_millis(100);


/// Flushes stream channels. A connection that is over its rate cap is held back by the worker
///  that dequeued it until its back-off expires, and flushed afterwards.
pub struct TcpSenderRole {
    queue: Receiver<Arc<DualConnection>>,
    threads: ThreadRange,
    throughput: RateMetric,
}

impl TcpSenderRole {
    pub fn new(queue: Receiver<Arc<DualConnection>>, threads: ThreadRange) -> TcpSenderRole {
        TcpSenderRole {
            queue,
            threads,
            throughput: RateMetric::new(RateMetric::DEFAULT_TAU),
        }
    }

    fn flush_tcp(&self, conn: &DualConnection) {
        if !conn.is_alive() {
            return;
        }
        match conn.flush_tcp() {
            Ok(flushed) => {
                if flushed.sent.packets > 0 {
                    self.throughput.add(flushed.sent.bytes, flushed.sent.packets);
                }
            }
            Err(e) => dispose_after_error(conn, "flushing the stream failed", &e),
        }
    }
}

impl Role for TcpSenderRole {
    fn name(&self) -> &str {
        "tcp-sender"
    }

    fn threads(&self) -> ThreadRange {
        self.threads
    }

    fn run_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        let mut deferred: Vec<(Instant, Arc<DualConnection>)> = Vec::new();

        while !worker.is_cancelled() {
            let now = Instant::now();
            let (due, waiting): (Vec<_>, Vec<_>) = deferred.drain(..).partition(|(until, _)| *until <= now);
            deferred = waiting;
            for (_, conn) in due {
                let _active = worker.active();
                self.flush_tcp(&conn);
            }

            let timeout = deferred.iter()
                .map(|(until, _)| until.saturating_duration_since(now))
                .min()
                .unwrap_or(IDLE_WAIT);

            let conn = select! {
                recv(self.queue) -> conn => match conn {
                    Ok(conn) => conn,
                    Err(_) => break,
                },
                recv(worker.cancel().receiver()) -> _ => break,
                default(timeout) => continue,
            };

            if let Some(until) = conn.throttled_until() {
                trace!(uid = conn.uid(), "deferring flush of a throttled stream");
                deferred.push((until, conn));
                continue;
            }
            let _active = worker.active();
            self.flush_tcp(&conn);
        }

        if !deferred.is_empty() {
            debug!("handing {} throttled streams back to the flush queue", deferred.len());
        }
        for (_, conn) in deferred {
            conn.requeue_tcp_flush();
        }
        Ok(())
    }

    fn throughput(&self) -> Option<RateSnapshot> {
        Some(self.throughput.rate())
    }
}


/// Flushes datagram channels
pub struct UdpSenderRole {
    queue: Receiver<Arc<DualConnection>>,
    threads: ThreadRange,
    throughput: RateMetric,
}

impl UdpSenderRole {
    pub fn new(queue: Receiver<Arc<DualConnection>>, threads: ThreadRange) -> UdpSenderRole {
        UdpSenderRole {
            queue,
            threads,
            throughput: RateMetric::new(RateMetric::DEFAULT_TAU),
        }
    }
}

impl Role for UdpSenderRole {
    fn name(&self) -> &str {
        "udp-sender"
    }

    fn threads(&self) -> ThreadRange {
        self.threads
    }

    fn run_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        loop {
            let next = select! {
                recv(self.queue) -> conn => conn.ok(),
                recv(worker.cancel().receiver()) -> _ => None,
            };
            let Some(conn) = next else {
                break;
            };
            if !conn.is_alive() {
                continue;
            }

            let _active = worker.active();
            match conn.flush_udp() {
                Ok(sent) if sent.packets > 0 => self.throughput.add(sent.bytes, sent.packets),
                Ok(_) => {}
                Err(e) => dispose_after_error(conn.as_ref(), "flushing datagrams failed", &e),
            }
        }
        Ok(())
    }

    fn throughput(&self) -> Option<RateSnapshot> {
        Some(self.throughput.rate())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{SocketAddr, UdpSocket};
    use std::thread;

    use bytes::BytesMut;

    use crate::config::{PoolConfig, RelayConfig};
    use crate::connection::dual::tests::connection_pair;
    use crate::connection::dual::{FlushQueues, UdpBinding};
    use crate::connection::read_stream_packets;
    use crate::pool::ThreadPool;
    use crate::test_util::message::{test_context, TestChat};
    use crate::wire::message::downcast_ref;
    use super::*;

    fn chat(text: &str) -> Arc<TestChat> {
        Arc::new(TestChat { from: None, text: text.to_string() })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition was not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_tcp_sender_flushes_in_order() {
        let ctx = Arc::new(test_context());
        let (queues, tcp_rx, _) = FlushQueues::new();
        let (conn, mut client) = connection_pair(ctx.clone(), RelayConfig::default(), queues);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let pool = ThreadPool::new(PoolConfig::default()).unwrap();
        pool.add_role(Arc::new(TcpSenderRole::new(tcp_rx, ThreadRange::new(2, 2)))).unwrap();

        for i in 0..20 {
            conn.send(chat(&format!("line {}", i)));
        }

        let mut buf = BytesMut::new();
        let mut texts = Vec::new();
        let mut chunk = [0u8; 4096];
        while texts.len() < 20 {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
            for frame in read_stream_packets(&ctx, &mut buf, None).unwrap() {
                if let Some(chat) = downcast_ref::<TestChat>(frame.message.as_ref()) {
                    texts.push(chat.text.clone());
                }
            }
        }
        let expected: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
        assert_eq!(texts, expected);
        // recorded once the flush returns
        wait_until(|| pool.throughput("tcp-sender").unwrap().packets_per_sec > 0.0);
        assert!(pool.throughput("tcp-sender").unwrap().bytes_per_sec > 0.0);

        pool.dispose();
        assert_eq!(pool.num_running_workers("tcp-sender"), 0);
    }

    fn read_until_texts(ctx: &crate::data::context::DataContext, client: &mut std::net::TcpStream, wanted: &[&str]) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = BytesMut::new();
        let mut texts = Vec::new();
        let mut chunk = [0u8; 4096];
        while !wanted.iter().all(|w| texts.iter().any(|t: &String| t == w)) {
            assert!(Instant::now() < deadline, "did not receive {:?}, got {:?}", wanted, texts);
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
            for frame in read_stream_packets(ctx, &mut buf, None).unwrap() {
                if let Some(chat) = downcast_ref::<TestChat>(frame.message.as_ref()) {
                    texts.push(chat.text.clone());
                }
            }
        }
        texts
    }

    #[test]
    fn test_throttled_stream_survives_worker_shutdown() {
        let ctx = Arc::new(test_context());
        let (queues, tcp_rx, _) = FlushQueues::new();
        let config = RelayConfig {
            tcp_rate_cap: 1.0,
            ..RelayConfig::default()
        };
        let (conn, mut client) = connection_pair(ctx.clone(), config, queues);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // drive the back-off up to its maximum
        for i in 0..8 {
            conn.send(chat(&format!("warm-up {}", i)));
            conn.flush_tcp().unwrap();
        }
        assert!(conn.throttled_until().is_some());
        while tcp_rx.try_recv().is_ok() {}

        conn.send(chat("held"));
        assert_eq!(tcp_rx.len(), 1);

        let first = ThreadPool::new(PoolConfig::default()).unwrap();
        first.add_role(Arc::new(TcpSenderRole::new(tcp_rx.clone(), ThreadRange::fixed(1)))).unwrap();
        wait_until(|| tcp_rx.is_empty());
        thread::sleep(Duration::from_millis(20));
        first.dispose();

        assert!(conn.throttled_until().is_some(), "back-off expired before the worker stopped");
        assert_eq!(tcp_rx.len(), 1, "deferred connection was not handed back");

        conn.send(chat("later"));
        let second = ThreadPool::new(PoolConfig::default()).unwrap();
        second.add_role(Arc::new(TcpSenderRole::new(tcp_rx, ThreadRange::fixed(1)))).unwrap();

        let texts = read_until_texts(&ctx, &mut client, &["held", "later"]);
        let held = texts.iter().position(|t| t == "held").unwrap();
        let later = texts.iter().position(|t| t == "later").unwrap();
        assert!(held < later);

        second.dispose();
    }

    #[test]
    fn test_tcp_sender_disposes_broken_stream() {
        let ctx = Arc::new(test_context());
        let (queues, tcp_rx, _) = FlushQueues::new();
        let (conn, client) = connection_pair(ctx, RelayConfig::default(), queues);
        drop(client);

        let pool = ThreadPool::new(PoolConfig::default()).unwrap();
        pool.add_role(Arc::new(TcpSenderRole::new(tcp_rx, ThreadRange::fixed(1)))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.is_alive() {
            assert!(Instant::now() < deadline, "connection was not disposed");
            conn.send(chat("anyone there?"));
            thread::sleep(Duration::from_millis(20));
        }
        pool.dispose();
    }

    #[test]
    fn test_udp_sender_sends_containers() {
        let ctx = Arc::new(test_context());
        let (queues, _, udp_rx) = FlushQueues::new();
        let (conn, _client) = connection_pair(ctx.clone(), RelayConfig::default(), queues);

        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let endpoint: SocketAddr = client.local_addr().unwrap();
        conn.bind_udp(UdpBinding { endpoint, socket: server });

        let pool = ThreadPool::new(PoolConfig::default()).unwrap();
        pool.add_role(Arc::new(UdpSenderRole::new(udp_rx, ThreadRange::fixed(1)))).unwrap();

        conn.send(Arc::new(crate::test_util::message::TestPosition { player_id: 7, x: 1.5, y: -2.0 }));

        let mut datagram = [0u8; 2048];
        let (len, _) = client.recv_from(&mut datagram).unwrap();
        assert!(len > 1);
        assert_eq!(datagram[0], 0, "first container ID");
        wait_until(|| pool.throughput("udp-sender").unwrap().bytes_per_sec > 0.0);

        pool.dispose();
    }
}
