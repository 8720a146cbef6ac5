use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::connection::base::ConnectionCore;
use crate::connection::{Connection, SendItem};


/// A [Connection] without a channel: everything that is sent stays in the queue until a test
///  takes it out with [TrackingConnection::take_sent].
pub struct TrackingConnection {
    core: ConnectionCore,
    num_flushes: Mutex<usize>,
}

impl Debug for TrackingConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrackingConnection{{{:?}}}", self.core)
    }
}

impl TrackingConnection {
    pub fn new(uid: &str) -> Arc<TrackingConnection> {
        Arc::new_cyclic(|this: &Weak<TrackingConnection>| {
            let this: Weak<dyn Connection> = this.clone();
            TrackingConnection {
                core: ConnectionCore::new(this, uid),
                num_flushes: Default::default(),
            }
        })
    }

    pub fn dyn_conn(self: &Arc<Self>) -> Arc<dyn Connection> {
        self.clone()
    }

    pub fn take_sent(&self) -> Vec<SendItem> {
        let mut result = Vec::new();
        while let Some(item) = self.core.try_pop() {
            result.push(item);
        }
        result
    }

    pub fn num_flushes(&self) -> usize {
        *self.num_flushes.lock()
    }
}

impl Connection for TrackingConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn trigger_flush(&self, _reliable: bool) {
        *self.num_flushes.lock() += 1;
    }

    fn flush_now(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) {}
}
