use std::fmt::{Debug, Formatter};
use std::io::Write;
use std::sync::{Arc, Weak};
use std::thread;

use bytes::BytesMut;
use crossbeam_channel::{select, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::connection::base::ConnectionCore;
use crate::connection::{read_stream_packets, write_stream_packet, Connection};
use crate::data::context::DataContext;
use crate::util::cancel::CancelToken;


/// The basic connection over a single reliable byte stream: every item goes through the one
///  channel, and a background thread of its own drains the send queue.
///
/// Incoming bytes are handed in through [StreamConnection::feed] by whoever reads the stream.
pub struct StreamConnection<S: Write + Send + 'static> {
    core: ConnectionCore,
    ctx: Arc<DataContext>,
    writer: Mutex<S>,
    receive_buf: Mutex<BytesMut>,
    flush_tx: Sender<()>,
    cancel: CancelToken,
}

impl <S: Write + Send + 'static> Debug for StreamConnection<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamConnection{{{:?}}}", self.core)
    }
}

impl <S: Write + Send + 'static> StreamConnection<S> {
    pub fn new(uid: &str, ctx: Arc<DataContext>, writer: S) -> anyhow::Result<Arc<StreamConnection<S>>> {
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(1);
        let cancel = CancelToken::new();

        let conn = Arc::new_cyclic(|this: &Weak<StreamConnection<S>>| {
            let this_dyn: Weak<dyn Connection> = this.clone();
            StreamConnection {
                core: ConnectionCore::new(this_dyn, uid),
                ctx,
                writer: Mutex::new(writer),
                receive_buf: Default::default(),
                flush_tx,
                cancel: cancel.clone(),
            }
        });

        let weak = Arc::downgrade(&conn);
        thread::Builder::new()
            .name(format!("drain-{}", conn.id()))
            .spawn(move || {
                loop {
                    select! {
                        recv(flush_rx) -> msg => {
                            if msg.is_err() {
                                break;
                            }
                            let Some(conn) = weak.upgrade() else {
                                break;
                            };
                            if let Err(e) = conn.drain() {
                                debug!(uid = conn.uid(), "stream write failed: {}", e);
                                conn.dispose();
                                break;
                            }
                        }
                        recv(cancel.receiver()) -> _ => break,
                    }
                }
                trace!("drain loop finished");
            })?;

        Ok(conn)
    }

    fn drain(&self) -> anyhow::Result<()> {
        let mut writer = self.writer.lock();
        let mut buf = BytesMut::new();
        while let Some(item) = self.core.try_pop() {
            if let Err(e) = write_stream_packet(&self.ctx, &mut buf, &item, None) {
                warn!(uid = self.uid(), "skipping outgoing message that cannot be serialized: {}", e);
            }
        }
        if buf.is_empty() {
            return Ok(());
        }
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Processes bytes read from the stream, passing complete frames to the receive hooks. An
    ///  error means the stream is corrupt, and the caller should dispose the connection.
    pub fn feed(&self, data: &[u8]) -> anyhow::Result<()> {
        let frames = {
            let mut buf = self.receive_buf.lock();
            buf.extend_from_slice(data);
            read_stream_packets(&self.ctx, &mut buf, None)?
        };
        for frame in frames {
            self.core.receive(frame.message, &frame.metas)?;
        }
        Ok(())
    }
}

impl <S: Write + Send + 'static> Connection for StreamConnection<S> {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn trigger_flush(&self, _reliable: bool) {
        match self.flush_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => trace!(uid = self.uid(), "flush after the drain loop finished"),
        }
    }

    fn flush_now(&self) -> anyhow::Result<()> {
        self.drain()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
