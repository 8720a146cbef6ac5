//! Readiness notification for connections' TCP streams.
//!
//! Delivery is one-shot: once a connection was handed to a worker, it is not handed out again
//!  until the worker re-arms it with [Poller::arm_connection] after draining the stream. That
//!  keeps a connection's inbound frames in order even when several workers poll concurrently.
//!  Readiness that arrives while a connection is disarmed is remembered and delivered on
//!  re-arming.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::connection::dual::DualConnection;
use crate::connection::Connection;
use crate::util::cancel::CancelToken;


pub trait Poller: Send + Sync + 'static {
    /// Registers a connection. It starts out armed.
    fn add_connection(&self, conn: &Arc<DualConnection>) -> anyhow::Result<()>;

    fn remove_connection(&self, id: u64);

    /// Blocks until a connection is ready, returning `None` once `cancel` fires
    fn next_ready(&self, cancel: &CancelToken) -> Option<Arc<DualConnection>>;

    /// re-enables delivery after the connection was drained
    fn arm_connection(&self, conn: &DualConnection) -> anyhow::Result<()>;

    /// makes blocked [Poller::next_ready] calls re-check their cancel token
    fn wake(&self);

    fn start_polling<'a>(&'a self, cancel: &'a CancelToken) -> Box<dyn Iterator<Item = Arc<DualConnection>> + 'a> {
        Box::new(std::iter::from_fn(move || self.next_ready(cancel)))
    }
}


#[derive(Default)]
struct ArmState {
    armed: bool,
    /// readiness was reported while the connection was not armed
    pending: bool,
}

struct PollEntry {
    conn: Arc<DualConnection>,
    state: Mutex<ArmState>,
}

impl PollEntry {
    fn new(conn: Arc<DualConnection>) -> PollEntry {
        PollEntry {
            conn,
            state: Mutex::new(ArmState { armed: true, pending: false }),
        }
    }

    /// records readiness, returning `true` if the connection should be delivered now
    fn on_ready(&self) -> bool {
        let mut state = self.state.lock();
        if state.armed {
            state.armed = false;
            state.pending = false;
            true
        }
        else {
            state.pending = true;
            false
        }
    }

    /// re-arms, returning `true` if readiness was reported in the meantime and the connection
    ///  should be delivered right away
    fn arm(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending {
            state.pending = false;
            true
        }
        else {
            state.armed = true;
            false
        }
    }
}


#[cfg(unix)]
pub use mio_poller::MioPoller;

#[cfg(unix)]
mod mio_poller {
    use std::os::fd::AsRawFd;

    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll, Registry, Token, Waker};

    use super::*;

    const WAKE_TOKEN: Token = Token(usize::MAX);
    const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    /// Edge-triggered OS readiness notification. Whichever worker gets hold of the [Poll] waits
    ///  for events and queues the ready connections; the other workers take connections from
    ///  that queue.
    pub struct MioPoller {
        poll: Mutex<(Poll, Events)>,
        registry: Registry,
        waker: Waker,
        entries: RwLock<FxHashMap<u64, Arc<PollEntry>>>,
        ready_tx: Sender<Arc<DualConnection>>,
        ready_rx: Receiver<Arc<DualConnection>>,
    }

    impl MioPoller {
        pub fn new() -> anyhow::Result<MioPoller> {
            let poll = Poll::new()?;
            let registry = poll.registry().try_clone()?;
            let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
            let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
            Ok(MioPoller {
                poll: Mutex::new((poll, Events::with_capacity(1024))),
                registry,
                waker,
                entries: Default::default(),
                ready_tx,
                ready_rx,
            })
        }

        fn deliver(&self, conn: Arc<DualConnection>) {
            // both ends live in self
            let _ = self.ready_tx.send(conn);
        }

        /// waits for events once; returns `false` if someone else is polling already
        fn poll_once(&self) -> anyhow::Result<bool> {
            let Some(mut guard) = self.poll.try_lock() else {
                return Ok(false);
            };
            let (poll, events) = &mut *guard;
            match poll.poll(events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(true),
                Err(e) => return Err(e.into()),
            }

            let entries = self.entries.read();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let Ok(id) = u64::try_from(event.token().0) else {
                    continue;
                };
                if let Some(entry) = entries.get(&id) {
                    if entry.on_ready() {
                        self.deliver(entry.conn.clone());
                    }
                }
            }
            Ok(true)
        }
    }

    impl Poller for MioPoller {
        fn add_connection(&self, conn: &Arc<DualConnection>) -> anyhow::Result<()> {
            let fd = conn.tcp_stream().as_raw_fd();
            let token = Token(usize::try_from(conn.id())?);
            self.entries.write().insert(conn.id(), Arc::new(PollEntry::new(conn.clone())));
            self.registry.register(&mut SourceFd(&fd), token, Interest::READABLE)?;
            trace!(uid = conn.uid(), "registered with the poller");
            Ok(())
        }

        fn remove_connection(&self, id: u64) {
            if let Some(entry) = self.entries.write().remove(&id) {
                let fd = entry.conn.tcp_stream().as_raw_fd();
                if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                    trace!(uid = entry.conn.uid(), "deregistering from the poller: {}", e);
                }
            }
        }

        fn next_ready(&self, cancel: &CancelToken) -> Option<Arc<DualConnection>> {
            loop {
                if cancel.is_cancelled() {
                    return None;
                }
                if let Ok(conn) = self.ready_rx.try_recv() {
                    return Some(conn);
                }
                match self.poll_once() {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Ok(conn) = self.ready_rx.recv_timeout(Duration::from_millis(10)) {
                            return Some(conn);
                        }
                    }
                    Err(e) => {
                        debug!("polling failed: {}", e);
                        cancel.wait_timeout(Duration::from_millis(10));
                    }
                }
            }
        }

        fn arm_connection(&self, conn: &DualConnection) -> anyhow::Result<()> {
            let entry = self.entries.read().get(&conn.id()).cloned();
            if let Some(entry) = entry {
                if entry.arm() {
                    self.deliver(entry.conn.clone());
                }
            }
            Ok(())
        }

        fn wake(&self) {
            if let Err(e) = self.waker.wake() {
                debug!("waking the poller failed: {}", e);
            }
        }
    }
}


/// Portable readiness notification through a pending peek per connection. Each armed
///  connection has a task on a small private runtime that waits for a one byte peek to
///  complete, which happens when data or end of stream arrives, without consuming anything.
///  An idle connection costs a parked task and nothing else.
pub struct PeekPoller {
    handle: tokio::runtime::Handle,
    shutdown: Arc<Notify>,
    runtime_thread: Mutex<Option<thread::JoinHandle<()>>>,
    entries: RwLock<FxHashMap<u64, PeekEntry>>,
    ready_tx: Sender<Arc<DualConnection>>,
    ready_rx: Receiver<Arc<DualConnection>>,
}

struct PeekEntry {
    entry: Arc<PollEntry>,
    rearmed: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl PeekPoller {
    pub fn new() -> anyhow::Result<PeekPoller> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()?;
        let handle = runtime.handle().clone();
        let shutdown = Arc::new(Notify::new());

        let signal = shutdown.clone();
        let runtime_thread = thread::Builder::new()
            .name("peek-poller".to_string())
            .spawn(move || {
                runtime.block_on(signal.notified());
                trace!("peek poller runtime finished");
            })?;

        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        Ok(PeekPoller {
            handle,
            shutdown,
            runtime_thread: Mutex::new(Some(runtime_thread)),
            entries: Default::default(),
            ready_tx,
            ready_rx,
        })
    }

    async fn watch(stream: tokio::net::TcpStream, entry: Arc<PollEntry>, rearmed: Arc<Notify>, ready_tx: Sender<Arc<DualConnection>>) {
        let mut buf = [0u8; 1];
        loop {
            // an error is delivered as readiness too, the receiver has to see it
            if let Err(e) = stream.peek(&mut buf).await {
                trace!(uid = entry.conn.uid(), "peek failed: {}", e);
            }
            if entry.on_ready() && ready_tx.send(entry.conn.clone()).is_err() {
                return;
            }
            rearmed.notified().await;
        }
    }
}

impl Poller for PeekPoller {
    fn add_connection(&self, conn: &Arc<DualConnection>) -> anyhow::Result<()> {
        let stream = {
            let _runtime = self.handle.enter();
            tokio::net::TcpStream::from_std(conn.tcp_stream().try_clone()?)?
        };
        let entry = Arc::new(PollEntry::new(conn.clone()));
        let rearmed = Arc::new(Notify::new());
        let task = self.handle.spawn(Self::watch(stream, entry.clone(), rearmed.clone(), self.ready_tx.clone()));

        if let Some(old) = self.entries.write().insert(conn.id(), PeekEntry { entry, rearmed, task }) {
            old.task.abort();
        }
        trace!(uid = conn.uid(), "registered with the poller");
        Ok(())
    }

    fn remove_connection(&self, id: u64) {
        if let Some(removed) = self.entries.write().remove(&id) {
            removed.task.abort();
        }
    }

    fn next_ready(&self, cancel: &CancelToken) -> Option<Arc<DualConnection>> {
        if cancel.is_cancelled() {
            return None;
        }
        select! {
            recv(self.ready_rx) -> conn => conn.ok(),
            recv(cancel.receiver()) -> _ => None,
        }
    }

    fn arm_connection(&self, conn: &DualConnection) -> anyhow::Result<()> {
        if let Some(e) = self.entries.read().get(&conn.id()) {
            // the watching task peeks again, so readiness that arrived meanwhile is not lost
            if e.entry.arm() {
                let _ = self.ready_tx.send(e.entry.conn.clone());
            }
            else {
                e.rearmed.notify_one();
            }
        }
        Ok(())
    }

    /// waiting workers also select on their cancel token, so there is nothing to wake
    fn wake(&self) {}
}

impl Drop for PeekPoller {
    fn drop(&mut self) {
        for (_, e) in self.entries.write().drain() {
            e.task.abort();
        }
        self.shutdown.notify_one();
        if let Some(runtime_thread) = self.runtime_thread.lock().take() {
            if runtime_thread.join().is_err() {
                debug!("peek poller runtime panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use rstest::rstest;

    use crate::config::RelayConfig;
    use crate::connection::dual::tests::connection_pair;
    use crate::connection::dual::FlushQueues;
    use crate::test_util::message::test_context;
    use super::*;

    fn new_poller(kind: &str) -> Arc<dyn Poller> {
        match kind {
            #[cfg(unix)]
            "mio" => Arc::new(MioPoller::new().unwrap()),
            _ => Arc::new(PeekPoller::new().unwrap()),
        }
    }

    fn setup(kind: &str) -> (Arc<dyn Poller>, Arc<DualConnection>, TcpStream) {
        let ctx = Arc::new(test_context());
        let (queues, _, _) = FlushQueues::new();
        let (conn, client) = connection_pair(ctx, RelayConfig::default(), queues);
        let poller = new_poller(kind);
        poller.add_connection(&conn).unwrap();
        (poller, conn, client)
    }

    #[rstest]
    #[case::mio("mio")]
    #[case::peek("peek")]
    fn test_delivers_readable_connection(#[case] kind: &str) {
        let (poller, conn, mut client) = setup(kind);
        let cancel = CancelToken::new();

        client.write_all(b"x").unwrap();
        let ready = poller.next_ready(&cancel).unwrap();
        assert_eq!(ready.id(), conn.id());
    }

    #[rstest]
    #[case::mio("mio")]
    #[case::peek("peek")]
    fn test_no_double_delivery_until_rearmed(#[case] kind: &str) {
        let (poller, conn, mut client) = setup(kind);
        let cancel = CancelToken::new();
        let deliveries = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4).map(|_| {
            let poller = poller.clone();
            let cancel = cancel.clone();
            let deliveries = deliveries.clone();
            thread::spawn(move || {
                for _ in poller.start_polling(&cancel) {
                    deliveries.fetch_add(1, Ordering::SeqCst);
                }
            })
        }).collect();

        for _ in 0..10 {
            client.write_all(b"xyz").unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while deliveries.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);

        // readiness that arrived while disarmed is delivered on re-arming
        client.write_all(b"more").unwrap();
        thread::sleep(Duration::from_millis(50));
        poller.arm_connection(&conn).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while deliveries.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        cancel.cancel();
        poller.wake();
        for w in workers {
            w.join().unwrap();
        }
    }

    #[rstest]
    #[case::mio("mio")]
    #[case::peek("peek")]
    fn test_idle_connection_is_never_delivered(#[case] kind: &str) {
        let (poller, _conn, _client) = setup(kind);
        let (_other_poller, busy, mut busy_client) = setup(kind);
        poller.add_connection(&busy).unwrap();

        let cancel = CancelToken::new();
        busy_client.write_all(b"x").unwrap();
        let ready = poller.next_ready(&cancel).unwrap();
        assert_eq!(ready.id(), busy.id());

        let c = cancel.clone();
        let p = poller.clone();
        let handle = thread::spawn(move || p.next_ready(&c).map(|conn| conn.id()));
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
        poller.wake();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[rstest]
    #[case::mio("mio")]
    #[case::peek("peek")]
    fn test_removed_connection_is_not_delivered(#[case] kind: &str) {
        let (poller, conn, mut client) = setup(kind);
        poller.remove_connection(conn.id());
        client.write_all(b"x").unwrap();

        let cancel = CancelToken::new();
        let c = cancel.clone();
        let p = poller.clone();
        let handle = thread::spawn(move || p.next_ready(&c).is_none());
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        poller.wake();
        assert!(handle.join().unwrap());
    }
}
