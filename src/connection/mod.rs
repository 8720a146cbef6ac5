//! Connections: a send queue with a drain, receive and disconnect hooks, and the concrete
//!  channel implementations.
//!
//! On a stream channel, every frame travels in a packet of its own:
//! ```ascii
//! [length: u16][frame: length bytes]
//! ```
//! so a truncated or garbled frame is detected at the packet boundary instead of desynchronizing
//!  the stream.

pub mod base;
pub mod dual;
pub mod registry;
pub mod stream;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, trace};

use crate::connection::base::ConnectionCore;
use crate::data::context::{DataContext, Frame};
use crate::messages::DisconnectReason;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::flags::DataFlags;
use crate::wire::message::{AsAny, Message};
use crate::wire::meta::MetaItem;
use crate::wire::reader::DataReader;
use crate::wire::string_table::StringTable;


#[derive(Debug, Clone)]
pub enum Payload {
    Message(Arc<dyn Message>, Vec<MetaItem>),
    /// a frame that was serialized once for many recipients
    Blob(Bytes),
}

#[derive(Debug, Clone)]
pub struct SendItem {
    pub payload: Payload,
    pub reliable: bool,
}

impl SendItem {
    pub fn message(&self) -> Option<&Arc<dyn Message>> {
        match &self.payload {
            Payload::Message(msg, _) => Some(msg),
            Payload::Blob(_) => None,
        }
    }

    pub fn metas(&self) -> &[MetaItem] {
        match &self.payload {
            Payload::Message(_, metas) => metas,
            Payload::Blob(_) => &[],
        }
    }

    /// appends this item's frame to `buf`
    pub fn write_frame(&self, ctx: &DataContext, buf: &mut BytesMut, strings: Option<&StringTable>) -> anyhow::Result<()> {
        match &self.payload {
            Payload::Message(msg, metas) => ctx.write_frame(buf, msg.as_ref(), metas, strings),
            Payload::Blob(blob) => {
                buf.put_slice(blob);
                Ok(())
            }
        }
    }
}


/// A live duplex channel to one peer. Implementations provide the channel specific parts; queueing,
///  hooks and disposal are shared through [ConnectionCore].
pub trait Connection: AsAny + Debug {
    fn core(&self) -> &ConnectionCore;

    fn strings(&self) -> Option<&StringTable> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Called after an item was queued: wakes up whatever drains the queue
    fn trigger_flush(&self, reliable: bool);

    /// Writes everything queued for the reliable channel on the calling thread
    fn flush_now(&self) -> anyhow::Result<()>;

    /// Closes the underlying channels. Called exactly once, on disposal.
    fn close(&self);

    fn id(&self) -> u64 {
        self.core().id()
    }

    fn uid(&self) -> &str {
        self.core().uid()
    }

    fn is_alive(&self) -> bool {
        self.core().is_alive()
    }

    fn send(&self, msg: Arc<dyn Message>) {
        self.send_with_metas(msg, Vec::new());
    }

    fn send_with_metas(&self, msg: Arc<dyn Message>, mut metas: Vec<MetaItem>) {
        if let Some(entity_id) = msg.ordered_entity() {
            let seq = self.core().next_ordered_seq(entity_id);
            metas.push(MetaItem::OrderedUpdate { entity_id, seq });
        }
        let reliable = !msg.flags().contains(DataFlags::UNRELIABLE);
        self.enqueue(SendItem {
            payload: Payload::Message(msg, metas),
            reliable,
        });
    }

    fn send_blob(&self, blob: Bytes, reliable: bool) {
        self.enqueue(SendItem {
            payload: Payload::Blob(blob),
            reliable,
        });
    }

    fn enqueue(&self, item: SendItem) {
        if !self.is_alive() {
            trace!(uid = self.uid(), "discarding outgoing data for a disposed connection");
            return;
        }
        let reliable = item.reliable;
        self.core().push(item);
        self.trigger_flush(reliable);
    }

    /// Closes the connection and notifies disconnect hooks. Subsequent calls do nothing.
    fn dispose(&self) {
        if !self.core().mark_disposed() {
            return;
        }
        debug!(uid = self.uid(), id = self.id(), "disposing connection");
        self.close();
        self.core().fire_disconnect();
    }

    /// sends a disconnect reason, then disposes
    fn kick(&self, reason: &str) {
        info!(uid = self.uid(), "kicking connection: {}", reason);
        self.send(Arc::new(DisconnectReason { reason: reason.to_string() }));
        if let Err(e) = self.flush_now() {
            debug!(uid = self.uid(), "could not deliver the disconnect reason: {}", e);
        }
        self.dispose();
    }
}


/// Appends a stream packet containing `item`'s frame
pub fn write_stream_packet(ctx: &DataContext, buf: &mut BytesMut, item: &SendItem, strings: Option<&StringTable>) -> anyhow::Result<()> {
    let start = buf.len();
    buf.put_u16_le(0);
    if let Err(e) = item.write_frame(ctx, buf, strings) {
        buf.truncate(start);
        return Err(e);
    }
    let len = buf.len() - start - 2;
    if len > u16::MAX as usize {
        buf.truncate(start);
        bail!("frame of {} bytes does not fit a stream packet", len);
    }
    let len: u16 = len.prechecked_cast();
    buf[start..start + 2].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Splits all complete packets off the front of `buf` and reads their frames, leaving an
///  incomplete trailing packet in the buffer.
///
/// Any malformed packet is an error: the stream cannot be trusted after that.
pub fn read_stream_packets(ctx: &DataContext, buf: &mut BytesMut, strings: Option<&StringTable>) -> anyhow::Result<Vec<Frame>> {
    let mut result = Vec::new();
    loop {
        if buf.len() < 2 {
            break;
        }
        let len: usize = u16::from_le_bytes([buf[0], buf[1]]).safe_cast();
        if buf.len() < 2 + len {
            break;
        }
        if len == 0 {
            bail!("empty stream packet");
        }

        buf.advance(2);
        let packet = buf.split_to(len);
        let mut r = DataReader::new(&packet, ctx, strings);
        let frame = ctx.read_frame(&mut r)?;
        if r.remaining() > 0 {
            bail!("stream packet has {} trailing bytes after its {} frame", r.remaining(), frame.message.data_type());
        }
        result.push(frame);
    }
    Ok(result)
}
