use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::data::refs::RefTable;
use crate::data::request::{PendingReply, RequestTracker};
use crate::messages;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::flags::DataFlags;
use crate::wire::message::{downcast_ref, DataType, Message, RefIdentity, UnparsedMessage};
use crate::wire::meta::{MetaItem, MetaSet};
use crate::wire::reader::DataReader;
use crate::wire::string_table::StringTable;
use crate::wire::writer::DataWriter;
use crate::wire::MAX_WELL_KNOWN;


pub(crate) type ReadFn = fn(&mut DataReader<'_>, &MetaSet) -> anyhow::Result<Arc<dyn Message>>;

type ErasedHandler = Arc<dyn Fn(&Arc<dyn Connection>, &dyn Message, &MetaSet) -> anyhow::Result<()> + Send + Sync>;
type ErasedFilter = Arc<dyn Fn(&Arc<dyn Connection>, &dyn Message, &MetaSet) -> bool + Send + Sync>;

fn read_erased<T: DataType>(r: &mut DataReader<'_>, metas: &MetaSet) -> anyhow::Result<Arc<dyn Message>> {
    Ok(Arc::new(T::read(r, metas)?))
}


/// One deserialized frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub message: Arc<dyn Message>,
    pub metas: MetaSet,
}


/// The message registry: maps type-IDs to message variants, drives framing, owns the reference
///  tables and dispatches received messages to filters and handlers.
///
/// The set of message types and well-known strings is fixed when the context is built. Handlers
///  and filters can be registered at any time.
///
/// Frame format:
/// ```ascii
/// [type-ID: NUL-terminated UTF-8, or string table ID for SLIM_HEADER variants]
/// [flags: u16]
/// [length: u16]
/// [payload: length bytes = [meta count: u8][metas][body]]
/// ```
pub struct DataContext {
    types: FxHashMap<&'static str, ReadFn>,
    well_known: Vec<String>,
    refs: RefTable,
    requests: RequestTracker,
    handlers: RwLock<Dispatch>,
}

#[derive(Default)]
struct Dispatch {
    any_filters: Vec<ErasedFilter>,
    filters: FxHashMap<String, Vec<ErasedFilter>>,
    any_handlers: Vec<ErasedHandler>,
    handlers: FxHashMap<String, Vec<ErasedHandler>>,
}

pub struct DataContextBuilder {
    types: Vec<(&'static str, ReadFn)>,
    well_known: Vec<String>,
}

impl DataContextBuilder {
    pub fn register<T: DataType>(mut self) -> Self {
        self.types.push((T::DATA_TYPE, read_erased::<T> as ReadFn));
        self
    }

    /// Strings that are encoded as single-byte control codes. At most seven, and the same list
    ///  (in the same order) on both sides.
    pub fn well_known_strings(mut self, strings: &[&str]) -> Self {
        self.well_known.extend(strings.iter().map(|s| s.to_string()));
        self
    }

    pub fn build(self) -> anyhow::Result<DataContext> {
        if self.well_known.len() > MAX_WELL_KNOWN {
            bail!("at most {} well-known strings are supported, got {}", MAX_WELL_KNOWN, self.well_known.len());
        }

        let mut types: FxHashMap<&'static str, ReadFn> = FxHashMap::default();
        for (data_type, read_fn) in messages::core_types().into_iter().chain(self.types) {
            if data_type.is_empty() {
                bail!("empty type-ID");
            }
            if types.insert(data_type, read_fn).is_some() {
                bail!("duplicate registration for type-ID {:?}", data_type);
            }
        }

        let ctx = DataContext {
            types,
            well_known: self.well_known,
            refs: RefTable::new(),
            requests: RequestTracker::new(),
            handlers: Default::default(),
        };
        messages::register_core_handlers(&ctx);
        Ok(ctx)
    }
}

impl DataContext {
    pub fn builder() -> DataContextBuilder {
        DataContextBuilder {
            types: Vec::new(),
            well_known: Vec::new(),
        }
    }

    pub(crate) fn core_type<T: DataType>() -> (&'static str, ReadFn) {
        (T::DATA_TYPE, read_erased::<T> as ReadFn)
    }

    pub fn refs(&self) -> &RefTable {
        &self.refs
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.requests
    }

    pub fn is_registered(&self, data_type: &str) -> bool {
        self.types.contains_key(data_type)
    }

    pub fn well_known_code(&self, s: &str) -> Option<u8> {
        self.well_known.iter()
            .position(|w| w == s)
            .map(|idx| idx.prechecked_cast())
    }

    pub fn well_known_string(&self, code: u8) -> Option<&str> {
        self.well_known.get(code.safe_cast())
            .map(|s| s.as_str())
    }

    pub fn register_handler<T: DataType>(&self, handler: impl Fn(&Arc<dyn Connection>, &T, &MetaSet) -> anyhow::Result<()> + Send + Sync + 'static) {
        let erased: ErasedHandler = Arc::new(move |conn, msg, metas| {
            match downcast_ref::<T>(msg) {
                Some(msg) => handler(conn, msg, metas),
                None => Err(anyhow!("handler for {} called with a {}", T::DATA_TYPE, msg.data_type())),
            }
        });
        self.handlers.write()
            .handlers.entry(T::DATA_TYPE.to_string())
            .or_default()
            .push(erased);
    }

    /// A filter returning `false` drops the message before any handler (and before reference
    ///  tables are updated)
    pub fn register_filter<T: DataType>(&self, filter: impl Fn(&Arc<dyn Connection>, &T, &MetaSet) -> bool + Send + Sync + 'static) {
        let erased: ErasedFilter = Arc::new(move |conn, msg, metas| {
            match downcast_ref::<T>(msg) {
                Some(msg) => filter(conn, msg, metas),
                None => false,
            }
        });
        self.handlers.write()
            .filters.entry(T::DATA_TYPE.to_string())
            .or_default()
            .push(erased);
    }

    /// handlers for all messages, including unparsed ones; they run before typed handlers
    pub fn register_any_handler(&self, handler: impl Fn(&Arc<dyn Connection>, &dyn Message, &MetaSet) -> anyhow::Result<()> + Send + Sync + 'static) {
        self.handlers.write().any_handlers.push(Arc::new(handler));
    }

    pub fn register_any_filter(&self, filter: impl Fn(&Arc<dyn Connection>, &dyn Message, &MetaSet) -> bool + Send + Sync + 'static) {
        self.handlers.write().any_filters.push(Arc::new(filter));
    }

    /// Writes a complete frame for `msg` into `buf`. `extra_metas` are written after the standard
    ///  and the variant's own metas.
    ///
    /// On failure, `buf` is left as it was.
    pub fn write_frame(&self, buf: &mut BytesMut, msg: &dyn Message, extra_metas: &[MetaItem], strings: Option<&StringTable>) -> anyhow::Result<()> {
        let start = buf.len();
        let result = self.do_write_frame(buf, msg, extra_metas, strings);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn do_write_frame(&self, buf: &mut BytesMut, msg: &dyn Message, extra_metas: &[MetaItem], strings: Option<&StringTable>) -> anyhow::Result<()> {
        let frame_start = buf.len();
        let flags = msg.flags();

        let mut w = DataWriter::new(buf, self, strings);
        if flags.contains(DataFlags::SLIM_HEADER) && strings.is_some() {
            w.write_type_id(msg.data_type())?;
        }
        else {
            w.write_cstr(msg.data_type())?;
        }
        w.write_u16(flags.bits());
        let len_pos = w.position();
        w.write_u16(0);
        let payload_start = w.position();

        let mut metas = Vec::new();
        if !flags.contains(DataFlags::NO_STANDARD_META) {
            match msg.reference() {
                Some(RefIdentity::Global { id, .. }) => metas.push(MetaItem::Ref { id }),
                Some(RefIdentity::Bound { owner_type, owner_id, .. }) => metas.push(MetaItem::BoundRef {
                    owner_type: owner_type.to_string(),
                    owner_id,
                }),
                None => {}
            }
        }
        metas.extend(msg.metas());
        metas.extend_from_slice(extra_metas);
        MetaSet(metas).write(&mut w)?;

        msg.write(&mut w)?;

        let payload_len = w.position() - payload_start;
        if payload_len > u16::MAX as usize {
            bail!("{} has a payload of {} bytes, exceeding the maximum of {}", msg.data_type(), payload_len, u16::MAX);
        }
        let frame_len = w.position() - frame_start;
        if frame_len > u16::MAX as usize {
            bail!("{} has a frame of {} bytes, exceeding the maximum of {}", msg.data_type(), frame_len, u16::MAX);
        }
        w.patch_u16(len_pos, payload_len.prechecked_cast());
        Ok(())
    }

    /// Serializes a message without any connection specific state (string table, ordered update
    ///  sequence), so the result can be sent to many connections as a blob.
    pub fn serialize_blob(&self, msg: &dyn Message) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        self.write_frame(&mut buf, msg, &[], None)?;
        Ok(buf.freeze())
    }

    /// Reads one frame. Unregistered type-IDs become an [UnparsedMessage]; an error means the
    ///  data is malformed.
    pub fn read_frame(&self, r: &mut DataReader<'_>) -> anyhow::Result<Frame> {
        let data_type = r.read_type_id()?;
        let flags = DataFlags::from_bits_retain(r.read_u16()?);
        let len: usize = r.read_u16()?.safe_cast();
        let mut payload = r.sub_reader(len)?;

        let metas = MetaSet::read(&mut payload)?;

        let message = match self.types.get(data_type.as_str()) {
            Some(read_fn) => {
                let message = read_fn(&mut payload, &metas)?;
                if payload.remaining() > 0 {
                    trace!("{} left {} bytes of its payload unread", data_type, payload.remaining());
                }
                message
            }
            None => {
                trace!("received unknown type-ID {:?}", data_type);
                Arc::new(UnparsedMessage {
                    data_type,
                    flags,
                    metas: metas.0.clone(),
                    body: Bytes::copy_from_slice(payload.rest()),
                })
            }
        };
        Ok(Frame { message, metas })
    }

    /// Runs filters, updates reference tables, completes pending requests and runs handlers for
    ///  a received message.
    ///
    /// Returns `Ok(false)` if the message was dropped (stale ordered update, or a filter). An
    ///  error is a protocol violation by the peer.
    pub fn handle(&self, conn: &Arc<dyn Connection>, msg: Arc<dyn Message>, metas: &MetaSet) -> anyhow::Result<bool> {
        let (any_filters, filters, any_handlers, handlers) = {
            let dispatch = self.handlers.read();
            (
                dispatch.any_filters.clone(),
                dispatch.filters.get(msg.data_type()).cloned().unwrap_or_default(),
                dispatch.any_handlers.clone(),
                dispatch.handlers.get(msg.data_type()).cloned().unwrap_or_default(),
            )
        };

        for filter in any_filters.iter().chain(filters.iter()) {
            if !filter(conn, msg.as_ref(), metas) {
                trace!(uid = conn.uid(), "{} was filtered", msg.data_type());
                return Ok(false);
            }
        }

        // filtered updates must not use up a sequence number
        if let Some((entity, seq)) = metas.ordered_update() {
            if !conn.core().accept_ordered(entity, seq) {
                trace!(uid = conn.uid(), "dropping stale update #{} for {} entity {}", seq, msg.data_type(), entity);
                return Ok(false);
            }
        }

        if msg.reference().is_some() {
            self.refs.update(msg.clone())?;
        }

        if let Some(request_id) = metas.response_id() {
            self.requests.complete(conn.id(), request_id, msg.clone());
        }

        for handler in any_handlers.iter().chain(handlers.iter()) {
            if let Err(e) = handler(conn, msg.as_ref(), metas) {
                warn!(uid = conn.uid(), "handler for {} failed: {}", msg.data_type(), e);
            }
        }
        Ok(true)
    }

    /// Sends `msg` as a request; the returned [PendingReply] completes when a message with a
    ///  matching `res` meta arrives on the same connection.
    pub fn request(&self, conn: &Arc<dyn Connection>, msg: Arc<dyn Message>) -> PendingReply {
        let pending = self.requests.register(conn.id());
        debug!(uid = conn.uid(), "sending {} as request {}", msg.data_type(), pending.request_id());
        conn.send_with_metas(msg, vec![MetaItem::Request { id: pending.request_id() }]);
        pending
    }

    /// convenience for sending a request and waiting for a typed reply
    pub async fn request_reply<T: DataType>(&self, conn: &Arc<dyn Connection>, msg: Arc<dyn Message>, timeout: Duration) -> anyhow::Result<Option<Arc<T>>> {
        self.request(conn, msg)
            .await_reply_as::<T>(timeout)
            .await
    }

    /// Sends `msg` as the reply to the request whose metas are `request_metas`
    pub fn reply(&self, conn: &Arc<dyn Connection>, request_metas: &MetaSet, msg: Arc<dyn Message>) -> anyhow::Result<()> {
        let Some(id) = request_metas.request_id() else {
            bail!("cannot reply with {}: the original message is not a request", msg.data_type());
        };
        conn.send_with_metas(msg, vec![MetaItem::Response { id }]);
        Ok(())
    }

    /// cleanup when a connection is gone
    pub fn forget_connection(&self, conn: &dyn Connection) {
        self.requests.forget_connection(conn.id());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use crate::config::StringTableConfig;
    use crate::test_util::connection::TrackingConnection;
    use crate::test_util::message::{test_context, TestAvatar, TestChat, TestEmote, TestPlayer, TestPosition};
    use super::*;

    fn round_trip(ctx: &DataContext, msg: &dyn Message) -> Frame {
        let mut buf = BytesMut::new();
        ctx.write_frame(&mut buf, msg, &[], None).unwrap();
        let mut r = DataReader::new(&buf, ctx, None);
        let frame = ctx.read_frame(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        frame
    }

    #[test]
    fn test_round_trip_plain() {
        let ctx = test_context();
        let msg = TestChat { from: None, text: "hello there".to_string() };
        let frame = round_trip(&ctx, &msg);
        assert_eq!(downcast_ref::<TestChat>(frame.message.as_ref()), Some(&msg));
        assert!(frame.metas.is_empty());
    }

    #[test]
    fn test_round_trip_references() {
        let ctx = test_context();
        let player = Arc::new(TestPlayer { id: 17, name: "Madeline".to_string(), alive: true });

        let frame = round_trip(&ctx, player.as_ref());
        assert_eq!(frame.metas.ref_id(), Some(17));
        assert_eq!(downcast_ref::<TestPlayer>(frame.message.as_ref()), Some(player.as_ref()));

        let avatar = TestAvatar { owner: 17, skin: "red".to_string(), alive: true };
        let frame = round_trip(&ctx, &avatar);
        assert_eq!(frame.metas.bound_ref(), Some((TestPlayer::DATA_TYPE, 17)));
        assert_eq!(downcast_ref::<TestAvatar>(frame.message.as_ref()), Some(&avatar));

        // references inside a body resolve through the ref table
        ctx.refs().update(player.clone()).unwrap();
        let emote = TestEmote { player: player.clone(), text: "wave".to_string() };
        let frame = round_trip(&ctx, &emote);
        assert_eq!(downcast_ref::<TestEmote>(frame.message.as_ref()), Some(&emote));

        let chat = TestChat { from: Some(player), text: "hi".to_string() };
        let frame = round_trip(&ctx, &chat);
        assert_eq!(downcast_ref::<TestChat>(frame.message.as_ref()), Some(&chat));
    }

    #[test]
    fn test_unknown_required_reference_is_an_error() {
        let ctx = test_context();
        let player = Arc::new(TestPlayer { id: 5, name: "Theo".to_string(), alive: true });
        let emote = TestEmote { player: player.clone(), text: "wave".to_string() };

        let mut buf = BytesMut::new();
        ctx.write_frame(&mut buf, &emote, &[], None).unwrap();
        assert!(ctx.read_frame(&mut DataReader::new(&buf, &ctx, None)).is_err());

        // an optional reference resolves to None instead
        let chat = TestChat { from: Some(player), text: "hi".to_string() };
        let frame = round_trip(&ctx, &chat);
        assert_eq!(downcast_ref::<TestChat>(frame.message.as_ref()).unwrap().from, None);
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let ctx = test_context();
        let unparsed = UnparsedMessage {
            data_type: "somethingElse".to_string(),
            flags: DataFlags::UNRELIABLE | DataFlags::from_bits_retain(0x4000),
            metas: vec![MetaItem::Unparsed { meta_type: "custom".to_string(), data: Bytes::from_static(b"\x01\x02") }],
            body: Bytes::from_static(b"opaque body"),
        };

        let frame = round_trip(&ctx, &unparsed);
        assert_eq!(downcast_ref::<UnparsedMessage>(frame.message.as_ref()), Some(&unparsed));

        // relaying the pass-through reproduces the original bytes
        let mut original = BytesMut::new();
        ctx.write_frame(&mut original, &unparsed, &[], None).unwrap();
        let mut relayed = BytesMut::new();
        ctx.write_frame(&mut relayed, frame.message.as_ref(), &[], None).unwrap();
        assert_eq!(original, relayed);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::truncated_header(b"testChat\0\x00")]
    #[case::truncated_length(b"testChat\0\x00\x00\x05")]
    #[case::length_beyond_data(b"testChat\0\x00\x00\x20\x00\x00")]
    #[case::bad_meta_count(b"testChat\0\x00\x00\x01\x00\x03")]
    fn test_malformed_frames(#[case] buf: &[u8]) {
        let ctx = test_context();
        assert!(ctx.read_frame(&mut DataReader::new(buf, &ctx, None)).is_err());
    }

    #[test]
    fn test_write_failure_leaves_buffer_untouched() {
        let ctx = test_context();
        let mut buf = BytesMut::from(&b"prefix"[..]);
        let msg = TestChat { from: None, text: "x".repeat(70_000) };
        assert!(ctx.write_frame(&mut buf, &msg, &[], None).is_err());
        assert_eq!(&buf[..], b"prefix");
    }

    #[test]
    fn test_slim_header_uses_string_table() {
        let ctx = test_context();
        let config = StringTableConfig { promotion_threshold: 1, cleanup_floor: 1, max_promoted: 16, min_string_len: 1 };
        let sender = StringTable::new(config);
        let receiver = StringTable::new(config);
        let msg = TestPosition { player_id: 1, x: 1.0, y: 2.0 };

        let mut buf = BytesMut::new();
        ctx.write_frame(&mut buf, &msg, &[], Some(&sender)).unwrap();
        assert!(buf.starts_with(TestPosition::DATA_TYPE.as_bytes()));
        ctx.read_frame(&mut DataReader::new(&buf, &ctx, Some(&receiver))).unwrap();

        for (value, id) in receiver.promote_read() {
            sender.register_write(value, id);
        }

        let mut buf = BytesMut::new();
        ctx.write_frame(&mut buf, &msg, &[], Some(&sender)).unwrap();
        assert_eq!(&buf[..2], &crate::wire::MAPPED_STRING_MARKER.to_le_bytes());
        let frame = ctx.read_frame(&mut DataReader::new(&buf, &ctx, Some(&receiver))).unwrap();
        assert_eq!(downcast_ref::<TestPosition>(frame.message.as_ref()), Some(&msg));
    }

    #[test]
    fn test_duplicate_registration() {
        assert!(DataContext::builder()
            .register::<TestChat>()
            .register::<TestChat>()
            .build()
            .is_err());
        assert!(DataContext::builder()
            .well_known_strings(&["a", "b", "c", "d", "e", "f", "g", "h"])
            .build()
            .is_err());
    }

    #[test]
    fn test_handle_order_and_filters() {
        let ctx = test_context();
        let tracking = TrackingConnection::new("c1");
        let conn = tracking.dyn_conn();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let l = log.clone();
        ctx.register_handler::<TestChat>(move |_, msg, _| { l.lock().push(format!("typed:{}", msg.text)); Ok(()) });
        let l = log.clone();
        ctx.register_any_handler(move |_, msg, _| { l.lock().push(format!("any:{}", msg.data_type())); Ok(()) });
        ctx.register_filter::<TestChat>(|_, msg, _| msg.text != "spam");

        let metas = MetaSet::new();
        assert!(ctx.handle(&conn, Arc::new(TestChat { from: None, text: "hi".to_string() }), &metas).unwrap());
        assert!(!ctx.handle(&conn, Arc::new(TestChat { from: None, text: "spam".to_string() }), &metas).unwrap());

        assert_eq!(*log.lock(), vec!["any:testChat".to_string(), "typed:hi".to_string()]);
    }

    #[test]
    fn test_handle_updates_refs_before_handlers() {
        let ctx = Arc::new(test_context());
        let tracking = TrackingConnection::new("c1");
        let conn = tracking.dyn_conn();
        let seen = Arc::new(AtomicUsize::new(0));

        let c = ctx.clone();
        let s = seen.clone();
        ctx.register_handler::<TestPlayer>(move |_, msg, _| {
            assert!(c.refs().get_ref::<TestPlayer>(msg.id).is_some());
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let player = Arc::new(TestPlayer { id: 3, name: "Granny".to_string(), alive: true });
        ctx.handle(&conn, player, &MetaSet::new()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // binding to an owner that is not known is a protocol violation
        let avatar = Arc::new(TestAvatar { owner: 99, skin: "blue".to_string(), alive: true });
        assert!(ctx.handle(&conn, avatar, &MetaSet::new()).is_err());
    }

    #[test]
    fn test_stale_ordered_updates_are_dropped() {
        let ctx = test_context();
        let tracking = TrackingConnection::new("c1");
        let conn = tracking.dyn_conn();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        ctx.register_handler::<TestPosition>(move |_, _, _| { c.fetch_add(1, Ordering::SeqCst); Ok(()) });

        let pos = || Arc::new(TestPosition { player_id: 1, x: 0.0, y: 0.0 }) as Arc<dyn Message>;
        let metas = |seq| MetaSet(vec![MetaItem::OrderedUpdate { entity_id: 1, seq }]);

        assert!(ctx.handle(&conn, pos(), &metas(250)).unwrap());
        assert!(ctx.handle(&conn, pos(), &metas(255)).unwrap());
        assert!(!ctx.handle(&conn, pos(), &metas(251)).unwrap());
        assert!(ctx.handle(&conn, pos(), &metas(2)).unwrap()); // wrapped
        assert!(!ctx.handle(&conn, pos(), &metas(2)).unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_filtered_ordered_update_keeps_sequence() {
        let ctx = test_context();
        let tracking = TrackingConnection::new("c1");
        let conn = tracking.dyn_conn();
        ctx.register_filter::<TestPosition>(|_, msg, _| msg.x >= 0.0);

        let pos = |x| Arc::new(TestPosition { player_id: 1, x, y: 0.0 }) as Arc<dyn Message>;
        let metas = |seq| MetaSet(vec![MetaItem::OrderedUpdate { entity_id: 1, seq }]);

        assert!(ctx.handle(&conn, pos(1.0), &metas(1)).unwrap());
        assert!(!ctx.handle(&conn, pos(-1.0), &metas(100)).unwrap());
        assert!(ctx.handle(&conn, pos(2.0), &metas(50)).unwrap());
        assert!(!ctx.handle(&conn, pos(3.0), &metas(20)).unwrap());
    }

    #[tokio::test]
    async fn test_request_reply() {
        let ctx = Arc::new(test_context());
        let tracking = TrackingConnection::new("c1");
        let conn = tracking.dyn_conn();

        let pending = ctx.request(&conn, Arc::new(TestChat { from: None, text: "ping".to_string() }));
        let sent = tracking.take_sent();
        assert_eq!(sent.len(), 1);
        let request_metas = MetaSet(sent[0].metas().to_vec());
        assert_eq!(request_metas.request_id(), Some(pending.request_id()));

        // the peer's reply, as it would arrive
        let reply_metas = MetaSet(vec![MetaItem::Response { id: pending.request_id() }]);
        ctx.handle(&conn, Arc::new(TestChat { from: None, text: "pong".to_string() }), &reply_metas).unwrap();

        let reply = pending.await_reply_as::<TestChat>(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(reply.text, "pong");

        ctx.reply(&conn, &request_metas, Arc::new(TestChat { from: None, text: "pong".to_string() })).unwrap();
        assert_eq!(tracking.take_sent()[0].metas(), &[MetaItem::Response { id: pending_id(&request_metas) }]);
        assert!(ctx.reply(&conn, &MetaSet::new(), Arc::new(TestChat { from: None, text: "x".to_string() })).is_err());
    }

    fn pending_id(metas: &MetaSet) -> u32 {
        metas.request_id().unwrap()
    }

    #[test]
    fn test_serialize_blob_is_readable() {
        let ctx = test_context();
        let blob = ctx.serialize_blob(&TestChat { from: None, text: "broadcast".to_string() }).unwrap();
        let frame = ctx.read_frame(&mut DataReader::new(&blob, &ctx, None)).unwrap();
        assert_eq!(downcast_ref::<TestChat>(frame.message.as_ref()).unwrap().text, "broadcast");
    }
}
