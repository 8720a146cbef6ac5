use std::fmt::{Debug, Formatter};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::connection::base::ConnectionCore;
use crate::connection::{read_stream_packets, write_stream_packet, Connection, Payload, SendItem};
use crate::data::context::DataContext;
use crate::messages::{KeepAlive, StringMap};
use crate::util::backoff::ThrottleBackoff;
use crate::util::rate::RateMetric;
use crate::wire::reader::DataReader;
use crate::wire::string_table::StringTable;


/// container IDs cycle through `0..=MAX_CONTAINER_ID`; `0xFF` marks a token datagram
pub const MAX_CONTAINER_ID: u8 = 0xFE;

/// stream writes are issued in chunks of roughly this size
const TCP_WRITE_CHUNK: usize = 64 * 1024;


/// Per-connection limits negotiated during the handshake
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionSettings {
    pub max_datagram_size: usize,
    pub udp_rate_cap: f64,
}

/// Who the connection belongs to and what was negotiated, as established by the handshake
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub uid: String,
    pub name: String,
    pub token: u32,
    pub features: Vec<String>,
    pub settings: ConnectionSettings,
}

/// The queues feeding the sender roles. A connection is on a queue at most once at a time.
#[derive(Clone)]
pub struct FlushQueues {
    pub tcp: Sender<Arc<DualConnection>>,
    pub udp: Sender<Arc<DualConnection>>,
}

impl FlushQueues {
    pub fn new() -> (FlushQueues, Receiver<Arc<DualConnection>>, Receiver<Arc<DualConnection>>) {
        let (tcp, tcp_rx) = crossbeam_channel::unbounded();
        let (udp, udp_rx) = crossbeam_channel::unbounded();
        (FlushQueues { tcp, udp }, tcp_rx, udp_rx)
    }
}

#[derive(Clone)]
pub struct UdpBinding {
    pub endpoint: SocketAddr,
    pub socket: Arc<UdpSocket>,
}

/// bytes and packets moved by a single flush or read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub bytes: usize,
    pub packets: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlush {
    pub sent: Transferred,
    /// recommended back-off if the channel is over its rate cap
    pub backoff: Option<Duration>,
}

pub enum ReadOutcome {
    /// everything available was read, the connection is still open
    Drained,
    PeerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Alive,
    /// no data on the stream channel for too long
    TimedOut,
    /// the datagram channel went silent and should be unbound
    UdpTimedOut,
}

struct UdpSendState {
    container: BytesMut,
    frame: BytesMut,
    next_container_id: u8,
}

/// Blocks until a full stream has room for more data. The poll is created on first use, since
///  most streams never fill their socket buffer.
#[derive(Default)]
struct WriteWaiter {
    #[cfg(unix)]
    poll: Option<(mio::Poll, mio::Events)>,
}

impl WriteWaiter {
    #[cfg(unix)]
    fn wait(&mut self, stream: &TcpStream, timeout: Duration) -> anyhow::Result<()> {
        use std::os::fd::AsRawFd;
        use mio::unix::SourceFd;
        use mio::{Events, Interest, Poll, Token};

        if self.poll.is_none() {
            let poll = Poll::new()?;
            poll.registry().register(&mut SourceFd(&stream.as_raw_fd()), Token(0), Interest::WRITABLE)?;
            self.poll = Some((poll, Events::with_capacity(4)));
        }
        let Some((poll, events)) = self.poll.as_mut() else {
            return Ok(());
        };
        // edge-triggered: the caller wrote until WouldBlock, so the next event means room
        match poll.poll(events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(unix))]
    fn wait(&mut self, _stream: &TcpStream, timeout: Duration) -> anyhow::Result<()> {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(())
    }
}

struct Activity {
    tcp_send: Instant,
    tcp_recv: Instant,
    udp_send: Instant,
    udp_recv: Instant,
}


/// A client session's connection: a TCP stream for reliable data, plus a UDP flow for
///  unreliable data once the client bound one with its token.
///
/// Unreliable items go to a queue of their own while the datagram channel is bound, and fall
///  back to the stream otherwise. Draining is done by the sender roles: [Connection::trigger_flush]
///  puts the connection on the matching [FlushQueues] queue unless it is already there.
pub struct DualConnection {
    core: ConnectionCore,
    this: Weak<DualConnection>,
    ctx: Arc<DataContext>,
    config: Arc<RelayConfig>,
    session: SessionInfo,
    remote_addr: SocketAddr,
    strings: StringTable,

    stream: TcpStream,
    udp: RwLock<Option<UdpBinding>>,
    udp_queue_tx: Sender<SendItem>,
    udp_queue_rx: Receiver<SendItem>,
    flush_queues: FlushQueues,

    tcp_flush_queued: AtomicBool,
    udp_flush_queued: AtomicBool,
    tcp_send: Mutex<BytesMut>,
    write_waiter: Mutex<WriteWaiter>,
    udp_send: Mutex<UdpSendState>,
    tcp_recv: Mutex<BytesMut>,

    tcp_send_rate: RateMetric,
    tcp_recv_rate: RateMetric,
    udp_send_rate: RateMetric,
    udp_recv_rate: RateMetric,
    throttle: Mutex<ThrottleBackoff>,
    throttle_until: Mutex<Option<Instant>>,
    activity: Mutex<Activity>,
}

impl Debug for DualConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DualConnection{{{:?},remote:{}}}", self.core, self.remote_addr)
    }
}

impl DualConnection {
    /// Takes over a TCP stream whose handshake completed. `initial` holds bytes that were read
    ///  from the stream after the handshake, if any.
    pub fn new(ctx: Arc<DataContext>, config: Arc<RelayConfig>, stream: TcpStream, initial: &[u8], session: SessionInfo, flush_queues: FlushQueues) -> anyhow::Result<Arc<DualConnection>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;

        let (udp_queue_tx, udp_queue_rx) = crossbeam_channel::unbounded();
        let now = Instant::now();

        Ok(Arc::new_cyclic(|this: &Weak<DualConnection>| {
            let this_dyn: Weak<dyn Connection> = this.clone();
            DualConnection {
                core: ConnectionCore::new(this_dyn, session.uid.clone()),
                this: this.clone(),
                strings: StringTable::new(config.string_table),
                ctx,
                config,
                session,
                remote_addr,
                stream,
                udp: Default::default(),
                udp_queue_tx,
                udp_queue_rx,
                flush_queues,
                tcp_flush_queued: AtomicBool::new(false),
                udp_flush_queued: AtomicBool::new(false),
                tcp_send: Default::default(),
                write_waiter: Default::default(),
                udp_send: Mutex::new(UdpSendState {
                    container: BytesMut::new(),
                    frame: BytesMut::new(),
                    next_container_id: 0,
                }),
                tcp_recv: Mutex::new(BytesMut::from(initial)),
                tcp_send_rate: RateMetric::new(RateMetric::DEFAULT_TAU),
                tcp_recv_rate: RateMetric::new(RateMetric::DEFAULT_TAU),
                udp_send_rate: RateMetric::new(RateMetric::DEFAULT_TAU),
                udp_recv_rate: RateMetric::new(RateMetric::DEFAULT_TAU),
                throttle: Default::default(),
                throttle_until: Default::default(),
                activity: Mutex::new(Activity {
                    tcp_send: now,
                    tcp_recv: now,
                    udp_send: now,
                    udp_recv: now,
                }),
            }
        }))
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub fn token(&self) -> u32 {
        self.session.token
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.session.features.iter().any(|f| f == feature)
    }

    pub fn tcp_stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn Connection> {
        self.clone()
    }

    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        self.udp.read().as_ref().map(|b| b.endpoint)
    }

    pub fn is_udp_bound(&self) -> bool {
        self.udp.read().is_some()
    }

    /// Binds the datagram channel to `endpoint`, returning the previous endpoint. Rebinding to
    ///  a different endpoint is allowed so that clients survive NAT rebinding and IP changes.
    pub fn bind_udp(&self, binding: UdpBinding) -> Option<SocketAddr> {
        let endpoint = binding.endpoint;
        let previous = self.udp.write().replace(binding).map(|b| b.endpoint);
        match previous {
            None => debug!(uid = self.uid(), %endpoint, "datagram channel bound"),
            Some(prev) if prev != endpoint => info!(uid = self.uid(), %prev, %endpoint, "datagram channel moved to a new endpoint"),
            Some(_) => trace!(uid = self.uid(), %endpoint, "datagram channel re-confirmed"),
        }
        self.activity.lock().udp_recv = Instant::now();
        previous
    }

    /// Unbinds the datagram channel. Unreliable items that are still queued move to the stream.
    pub fn unbind_udp(&self) -> Option<SocketAddr> {
        let previous = self.udp.write().take().map(|b| b.endpoint);
        if let Some(endpoint) = previous {
            debug!(uid = self.uid(), %endpoint, "datagram channel unbound");
        }
        self.move_udp_queue_to_tcp();
        previous
    }

    fn move_udp_queue_to_tcp(&self) {
        let mut moved = false;
        while let Ok(item) = self.udp_queue_rx.try_recv() {
            self.core.push(item);
            moved = true;
        }
        if moved {
            self.schedule_tcp_flush();
        }
    }

    fn schedule_tcp_flush(&self) {
        if self.tcp_flush_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            if self.flush_queues.tcp.send(this).is_err() {
                trace!(uid = self.uid(), "TCP sender is gone");
            }
        }
    }

    /// Puts the connection back on the stream flush queue after a sender worker that held it
    ///  back stopped before flushing it
    pub fn requeue_tcp_flush(&self) {
        self.tcp_flush_queued.store(false, Ordering::Release);
        self.schedule_tcp_flush();
    }

    fn schedule_udp_flush(&self) {
        if self.udp_flush_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            if self.flush_queues.udp.send(this).is_err() {
                trace!(uid = self.uid(), "UDP sender is gone");
            }
        }
    }

    /// the instant until which the stream channel should not be flushed, if it is throttled
    pub fn throttled_until(&self) -> Option<Instant> {
        let until = *self.throttle_until.lock();
        until.filter(|&t| t > Instant::now())
    }

    /// Writes everything queued for the stream channel. Promoted strings are announced first,
    ///  so the peer can use them for anything it sends after reading this.
    ///
    /// Returns what was written and the recommended back-off if the channel is over its rate
    ///  cap. An error means the stream is broken.
    pub fn flush_tcp(&self) -> anyhow::Result<TcpFlush> {
        self.tcp_flush_queued.store(false, Ordering::Release);
        let mut buf = self.tcp_send.lock();
        buf.clear();

        let mut num_packets = 0;
        let mut num_bytes = 0;

        let promoted = self.strings.promote_read();
        for chunk in promoted.chunks(StringMap::MAX_ENTRIES) {
            let item = SendItem {
                payload: Payload::Message(Arc::new(StringMap { entries: chunk.to_vec() }), Vec::new()),
                reliable: true,
            };
            write_stream_packet(&self.ctx, &mut buf, &item, None)?;
            num_packets += 1;
        }

        while let Some(item) = self.core.try_pop() {
            if let Err(e) = write_stream_packet(&self.ctx, &mut buf, &item, Some(&self.strings)) {
                warn!(uid = self.uid(), "skipping outgoing message that cannot be serialized: {}", e);
                continue;
            }
            num_packets += 1;
            if buf.len() >= TCP_WRITE_CHUNK {
                num_bytes += buf.len();
                self.write_all(&buf)?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            num_bytes += buf.len();
            self.write_all(&buf)?;
            buf.clear();
        }

        if num_packets == 0 {
            return Ok(TcpFlush::default());
        }
        let now = Instant::now();
        self.tcp_send_rate.add_at(now, num_bytes, num_packets);
        self.activity.lock().tcp_send = now;

        let over_cap = self.tcp_send_rate.rate_at(now).bytes_per_sec > self.config.tcp_rate_cap;
        let backoff = self.throttle.lock().on_rate_check(over_cap);
        *self.throttle_until.lock() = backoff.map(|d| now + d);
        if let Some(delay) = backoff {
            debug!(uid = self.uid(), "stream channel over its rate cap, throttling for {:?}", delay);
        }
        Ok(TcpFlush {
            sent: Transferred { bytes: num_bytes, packets: num_packets },
            backoff,
        })
    }

    /// Writes to the non-blocking stream, waiting for writable readiness while the socket
    ///  buffer is full.
    fn write_all(&self, mut data: &[u8]) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.config.send_timeout;
        while !data.is_empty() {
            match (&self.stream).write(data) {
                Ok(0) => bail!("peer closed the stream"),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        bail!("stream write did not complete within {:?}", self.config.send_timeout);
                    }
                    self.write_waiter.lock().wait(&self.stream, deadline - now)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Packs everything queued for the datagram channel into containers and sends them.
    ///
    /// While the channel is over its rate cap, containers are dropped. Frames that cannot fit
    ///  into a container on their own go to the stream channel instead.
    pub fn flush_udp(&self) -> anyhow::Result<Transferred> {
        self.udp_flush_queued.store(false, Ordering::Release);
        let Some(binding) = self.udp.read().clone() else {
            self.move_udp_queue_to_tcp();
            return Ok(Transferred::default());
        };

        let mut state = self.udp_send.lock();
        let state = &mut *state;
        let max_size = self.session.settings.max_datagram_size;
        let mut fallback_to_tcp = false;
        let mut num_dropped = 0;
        let mut sent = Transferred::default();

        state.container.clear();
        let mut frames_in_container = 0;
        while let Ok(item) = self.udp_queue_rx.try_recv() {
            state.frame.clear();
            if let Err(e) = item.write_frame(&self.ctx, &mut state.frame, Some(&self.strings)) {
                warn!(uid = self.uid(), "skipping outgoing message that cannot be serialized: {}", e);
                continue;
            }
            if state.frame.len() + 1 > max_size {
                trace!(uid = self.uid(), "{} byte frame exceeds the datagram size, sending it on the stream", state.frame.len());
                self.core.push(item);
                fallback_to_tcp = true;
                continue;
            }

            if state.container.len() + state.frame.len() > max_size {
                if self.send_container(&binding, &state.container, frames_in_container)? {
                    sent.bytes += state.container.len();
                    sent.packets += 1;
                }
                else {
                    num_dropped += 1;
                }
                state.container.clear();
                frames_in_container = 0;
            }
            if state.container.is_empty() {
                state.container.put_u8(state.next_container_id);
                state.next_container_id = if state.next_container_id == MAX_CONTAINER_ID { 0 } else { state.next_container_id + 1 };
            }
            state.container.extend_from_slice(&state.frame);
            frames_in_container += 1;
        }
        if !state.container.is_empty() {
            if self.send_container(&binding, &state.container, frames_in_container)? {
                sent.bytes += state.container.len();
                sent.packets += 1;
            }
            else {
                num_dropped += 1;
            }
        }
        state.container.clear();

        if num_dropped > 0 {
            debug!(uid = self.uid(), "datagram channel over its rate cap, dropped {} containers", num_dropped);
        }
        if fallback_to_tcp {
            self.schedule_tcp_flush();
        }
        Ok(sent)
    }

    /// returns `false` if the container was dropped because of the rate cap
    fn send_container(&self, binding: &UdpBinding, container: &[u8], num_frames: usize) -> anyhow::Result<bool> {
        let now = Instant::now();
        if self.udp_send_rate.rate_at(now).bytes_per_sec > self.session.settings.udp_rate_cap {
            return Ok(false);
        }

        match binding.socket.send_to(container, binding.endpoint) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!(uid = self.uid(), "socket buffer full, dropping datagram");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        self.udp_send_rate.add_at(now, container.len(), num_frames);
        self.activity.lock().udp_send = now;
        Ok(true)
    }

    /// Reads everything that is available on the stream and dispatches the complete frames.
    ///  An error means the stream is corrupt or broken.
    pub fn receive_tcp(&self) -> anyhow::Result<(ReadOutcome, Transferred)> {
        let mut outcome = ReadOutcome::Drained;
        let mut num_bytes = 0;
        let frames = {
            let mut buf = self.tcp_recv.lock();
            let mut chunk = [0u8; 8192];
            loop {
                match (&self.stream).read(&mut chunk) {
                    Ok(0) => {
                        outcome = ReadOutcome::PeerClosed;
                        break;
                    }
                    Ok(n) => {
                        num_bytes += n;
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
            read_stream_packets(&self.ctx, &mut buf, Some(&self.strings))?
        };

        let received = Transferred { bytes: num_bytes, packets: frames.len() };
        if num_bytes > 0 {
            let now = Instant::now();
            self.tcp_recv_rate.add_at(now, received.bytes, received.packets);
            self.activity.lock().tcp_recv = now;
        }
        for frame in frames {
            self.core.receive(frame.message, &frame.metas)?;
        }
        Ok((outcome, received))
    }

    /// Dispatches the frames in a datagram container. Datagrams are not trusted to be intact,
    ///  so a malformed one is dropped without affecting the connection.
    pub fn receive_datagram(&self, datagram: &[u8]) {
        let now = Instant::now();
        self.udp_recv_rate.add_at(now, datagram.len(), 1);
        self.activity.lock().udp_recv = now;

        if datagram.len() < 2 {
            return;
        }
        let mut r = DataReader::new(&datagram[1..], &self.ctx, Some(&self.strings));
        while r.remaining() > 0 {
            let frame = match self.ctx.read_frame(&mut r) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(uid = self.uid(), "dropping the rest of a malformed datagram: {}", e);
                    return;
                }
            };
            if let Err(e) = self.core.receive(frame.message, &frame.metas) {
                debug!(uid = self.uid(), "dropping datagram frame: {}", e);
            }
        }
    }

    /// Sends keep-alives on idle channels and checks timeouts
    pub fn heartbeat(&self, now: Instant) -> HeartbeatOutcome {
        let (idle_tcp_send, idle_tcp_recv, idle_udp_send, idle_udp_recv) = {
            let activity = self.activity.lock();
            (
                now.saturating_duration_since(activity.tcp_send),
                now.saturating_duration_since(activity.tcp_recv),
                now.saturating_duration_since(activity.udp_send),
                now.saturating_duration_since(activity.udp_recv),
            )
        };

        if idle_tcp_recv > self.config.tcp_timeout {
            return HeartbeatOutcome::TimedOut;
        }
        if idle_tcp_send > self.config.keepalive_interval {
            self.send(Arc::new(KeepAlive { unreliable: false }));
        }

        if self.is_udp_bound() {
            if idle_udp_recv > self.config.udp_timeout {
                return HeartbeatOutcome::UdpTimedOut;
            }
            if idle_udp_send > self.config.keepalive_interval {
                self.send(Arc::new(KeepAlive { unreliable: true }));
            }
        }
        HeartbeatOutcome::Alive
    }

    pub fn tcp_send_rate(&self) -> &RateMetric {
        &self.tcp_send_rate
    }

    pub fn tcp_recv_rate(&self) -> &RateMetric {
        &self.tcp_recv_rate
    }

    pub fn udp_send_rate(&self) -> &RateMetric {
        &self.udp_send_rate
    }

    pub fn udp_recv_rate(&self) -> &RateMetric {
        &self.udp_recv_rate
    }
}

impl Connection for DualConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn strings(&self) -> Option<&StringTable> {
        Some(&self.strings)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn trigger_flush(&self, reliable: bool) {
        if reliable {
            self.schedule_tcp_flush();
        }
        else {
            self.schedule_udp_flush();
        }
    }

    fn flush_now(&self) -> anyhow::Result<()> {
        self.flush_tcp().map(|_| ())
    }

    fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(uid = self.uid(), "shutting down the stream: {}", e);
        }
        self.udp.write().take();
        while self.udp_queue_rx.try_recv().is_ok() {}
    }

    fn enqueue(&self, item: SendItem) {
        if !self.is_alive() {
            trace!(uid = self.uid(), "discarding outgoing data for a disposed connection");
            return;
        }
        if !item.reliable && self.is_udp_bound() {
            // the queue lives in self, so it cannot be disconnected
            let _ = self.udp_queue_tx.send(item);
            self.schedule_udp_flush();
        }
        else {
            self.core.push(item);
            self.schedule_tcp_flush();
        }
    }
}
