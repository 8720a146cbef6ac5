use std::any::{Any, TypeId};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::connection::{Connection, SendItem};
use crate::wire::message::Message;
use crate::wire::meta::MetaSet;


static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type ReceiveHook = Arc<dyn Fn(&Arc<dyn Connection>, Arc<dyn Message>, &MetaSet) -> anyhow::Result<()> + Send + Sync>;
type DisconnectHook = Box<dyn FnOnce(&Arc<dyn Connection>) + Send>;

/// The part of a connection that does not depend on its channels: identity, liveness, the
///  outbound queue, event hooks, ordered update bookkeeping and typed extensions.
pub struct ConnectionCore {
    id: u64,
    uid: String,
    alive: AtomicBool,
    queue_tx: Sender<SendItem>,
    queue_rx: Receiver<SendItem>,
    ordered_out: Mutex<FxHashMap<u32, u8>>,
    ordered_in: Mutex<FxHashMap<u32, u8>>,
    receive_hooks: RwLock<Vec<ReceiveHook>>,
    disconnect_hooks: Mutex<Vec<DisconnectHook>>,
    extensions: Mutex<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    this: Weak<dyn Connection>,
}

impl Debug for ConnectionCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{id:{},uid:{:?},alive:{}}}", self.id, self.uid, self.is_alive())
    }
}

impl ConnectionCore {
    /// `this` is the connection that owns this core, typically from `Arc::new_cyclic`
    pub fn new(this: Weak<dyn Connection>, uid: impl Into<String>) -> ConnectionCore {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        ConnectionCore {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            uid: uid.into(),
            alive: AtomicBool::new(true),
            queue_tx,
            queue_rx,
            ordered_out: Default::default(),
            ordered_in: Default::default(),
            receive_hooks: Default::default(),
            disconnect_hooks: Default::default(),
            extensions: Default::default(),
            this,
        }
    }

    /// process-unique, never reused
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// returns `true` for the call that actually changed the state
    pub(crate) fn mark_disposed(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    pub fn this(&self) -> Option<Arc<dyn Connection>> {
        self.this.upgrade()
    }

    pub fn push(&self, item: SendItem) {
        // both ends live in self, so the channel cannot be disconnected
        let _ = self.queue_tx.send(item);
    }

    pub fn try_pop(&self) -> Option<SendItem> {
        self.queue_rx.try_recv().ok()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_rx.len()
    }

    /// sequence number for the next outgoing ordered update of `entity_id`
    pub fn next_ordered_seq(&self, entity_id: u32) -> u8 {
        let mut ordered = self.ordered_out.lock();
        let seq = ordered.entry(entity_id)
            .and_modify(|s| *s = s.wrapping_add(1))
            .or_insert(0);
        *seq
    }

    /// Checks an incoming ordered update, returning `false` if it is not newer than the last one
    ///  accepted for the same entity. Sequence numbers wrap around, so "newer" means "less than
    ///  half the number range ahead".
    pub fn accept_ordered(&self, entity_id: u32, seq: u8) -> bool {
        let mut ordered = self.ordered_in.lock();
        match ordered.get(&entity_id) {
            Some(&last) if (seq.wrapping_sub(last) as i8) <= 0 => false,
            _ => {
                ordered.insert(entity_id, seq);
                true
            }
        }
    }

    pub fn on_receive(&self, hook: impl Fn(&Arc<dyn Connection>, Arc<dyn Message>, &MetaSet) -> anyhow::Result<()> + Send + Sync + 'static) {
        self.receive_hooks.write().push(Arc::new(hook));
    }

    /// Passes a received message to all receive hooks. An error means the peer violated the
    ///  protocol.
    pub fn receive(&self, msg: Arc<dyn Message>, metas: &MetaSet) -> anyhow::Result<()> {
        let Some(this) = self.this() else {
            return Ok(());
        };
        let hooks = self.receive_hooks.read().clone();
        for hook in hooks {
            hook(&this, msg.clone(), metas)?;
        }
        Ok(())
    }

    /// Registers a hook that runs once when the connection is disposed. If it is already
    ///  disposed, the hook runs right away.
    pub fn on_disconnect(&self, hook: impl FnOnce(&Arc<dyn Connection>) + Send + 'static) {
        let mut hooks = self.disconnect_hooks.lock();
        if !self.is_alive() {
            drop(hooks);
            if let Some(this) = self.this() {
                hook(&this);
            }
            return;
        }
        hooks.push(Box::new(hook));
    }

    pub(crate) fn fire_disconnect(&self) {
        let hooks = std::mem::take(&mut *self.disconnect_hooks.lock());
        let Some(this) = self.this() else {
            trace!("connection {} was dropped before disconnect hooks could run", self.id);
            return;
        };
        for hook in hooks {
            hook(&this);
        }
    }

    /// Attaches per-connection state of a given type, replacing a previous value of that type
    pub fn insert_extension<T: Any + Send + Sync>(&self, value: T) {
        self.extensions.lock().insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions.lock()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|e| e.downcast::<T>().ok())
    }

    pub fn remove_extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions.lock()
            .remove(&TypeId::of::<T>())
            .and_then(|e| e.downcast::<T>().ok())
    }
}
