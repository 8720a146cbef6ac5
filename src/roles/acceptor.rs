use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::ThreadRange;
use crate::pool::{Role, Worker};
use crate::roles::binder::{effective_threads, SocketBinder};
use crate::roles::handshaker::HandshakerRole;


const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Accepts TCP connections and submits them to the handshaker
pub struct AcceptorRole {
    binder: SocketBinder<TcpListener>,
    threads: ThreadRange,
    handshaker: Arc<HandshakerRole>,
}

impl AcceptorRole {
    pub fn new(addr: SocketAddr, threads: ThreadRange, handshaker: Arc<HandshakerRole>) -> anyhow::Result<AcceptorRole> {
        Ok(AcceptorRole {
            binder: SocketBinder::new(addr)?,
            threads: effective_threads(threads),
            handshaker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.binder.local_addr()
    }
}

impl Role for AcceptorRole {
    fn name(&self) -> &str {
        "acceptor"
    }

    fn threads(&self) -> ThreadRange {
        self.threads
    }

    fn run_worker(&self, worker: &Worker) -> anyhow::Result<()> {
        let listener = self.binder.socket_for_worker(worker.cancel())?;

        loop {
            let accepted = listener.accept();
            if worker.is_cancelled() {
                break;
            }
            match accepted {
                Ok((stream, peer)) => {
                    let _active = worker.active();
                    debug!(%peer, "accepted connection");
                    self.handshaker.submit(stream);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    trace!("accept interrupted");
                }
                Err(e) => {
                    // e.g. running out of file descriptors or a connection reset before accept
                    warn!("accepting a connection failed: {}", e);
                    thread::sleep(ACCEPT_ERROR_PAUSE);
                }
            }
        }
        Ok(())
    }
}
