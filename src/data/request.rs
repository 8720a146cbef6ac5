use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::wire::message::{downcast_arc, DataType, Message};


type PendingMap = FxHashMap<(u64, u32), oneshot::Sender<Arc<dyn Message>>>;

/// Tracks requests that were sent and are waiting for a reply. Replies are matched by the
///  connection they arrive on and the request ID carried in their `res` meta.
#[derive(Default)]
pub struct RequestTracker {
    next_id: AtomicU32,
    pending: Arc<Mutex<PendingMap>>,
}

impl RequestTracker {
    pub fn new() -> RequestTracker {
        Default::default()
    }

    pub fn register(&self, connection_id: u64) -> PendingReply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((connection_id, id), tx);
        PendingReply {
            connection_id,
            request_id: id,
            rx,
            pending: self.pending.clone(),
        }
    }

    /// Hands a reply to the waiting request, returning `true` if there was one
    pub fn complete(&self, connection_id: u64, request_id: u32, reply: Arc<dyn Message>) -> bool {
        let Some(tx) = self.pending.lock().remove(&(connection_id, request_id)) else {
            trace!("reply to unknown or expired request {} on connection {}", request_id, connection_id);
            return false;
        };
        // the requester may have given up in the meantime
        tx.send(reply).is_ok()
    }

    /// Fails all requests pending on a connection, e.g. because it was closed
    pub fn forget_connection(&self, connection_id: u64) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(conn, _), _| *conn != connection_id);
        if pending.len() < before {
            debug!("dropped {} pending requests for closed connection {}", before - pending.len(), connection_id);
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }
}


/// The receiving end of a request. Dropping it cancels the request, so a late reply is ignored.
pub struct PendingReply {
    connection_id: u64,
    request_id: u32,
    rx: oneshot::Receiver<Arc<dyn Message>>,
    pending: Arc<Mutex<PendingMap>>,
}

impl PendingReply {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Waits for the reply. Returns `Ok(None)` on timeout, and an error if the connection was
    ///  closed while waiting.
    pub async fn await_reply(mut self, timeout: Duration) -> anyhow::Result<Option<Arc<dyn Message>>> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(anyhow!("connection closed while waiting for the reply to request {}", self.request_id)),
            Err(_) => {
                trace!("request {} timed out", self.request_id);
                Ok(None)
            }
        }
    }

    /// Waits for a reply of a specific type. A reply of a different type is an error.
    pub async fn await_reply_as<T: DataType>(self, timeout: Duration) -> anyhow::Result<Option<Arc<T>>> {
        let request_id = self.request_id;
        match self.await_reply(timeout).await? {
            None => Ok(None),
            Some(reply) => {
                let data_type = reply.data_type().to_string();
                downcast_arc::<T>(reply)
                    .map(Some)
                    .ok_or_else(|| anyhow!("reply to request {} is a {}, expected {}", request_id, data_type, T::DATA_TYPE))
            }
        }
    }

    /// Waits for the reply, falling back to `on_timeout` if there is none in time
    pub async fn await_reply_or_else<F, Fut>(self, timeout: Duration, on_timeout: F) -> anyhow::Result<Arc<dyn Message>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<dyn Message>>>,
    {
        match self.await_reply(timeout).await? {
            Some(reply) => Ok(reply),
            None => on_timeout().await,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.pending.lock().remove(&(self.connection_id, self.request_id));
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::message::TestChat;
    use super::*;

    fn chat(text: &str) -> Arc<dyn Message> {
        Arc::new(TestChat { from: None, text: text.to_string() })
    }

    #[tokio::test]
    async fn test_reply_completes_request() {
        let tracker = RequestTracker::new();
        let pending = tracker.register(7);
        let id = pending.request_id();

        assert!(!tracker.complete(8, id, chat("wrong connection")));
        assert!(tracker.complete(7, id, chat("hi")));
        assert!(!tracker.complete(7, id, chat("twice")));

        let reply = pending.await_reply_as::<TestChat>(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(reply.text, "hi");
        assert_eq!(tracker.num_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_fallback() {
        let tracker = RequestTracker::new();

        let pending = tracker.register(1);
        assert!(pending.await_reply(Duration::from_secs(5)).await.unwrap().is_none());
        assert_eq!(tracker.num_pending(), 0);

        let pending = tracker.register(1);
        let reply = pending.await_reply_or_else(Duration::from_secs(5), || async { Ok(chat("fallback")) }).await.unwrap();
        assert_eq!(reply.data_type(), TestChat::DATA_TYPE);
    }

    #[tokio::test]
    async fn test_forget_connection_fails_pending() {
        let tracker = RequestTracker::new();
        let pending = tracker.register(3);
        let other = tracker.register(4);

        tracker.forget_connection(3);
        assert!(pending.await_reply(Duration::from_secs(1)).await.is_err());
        assert_eq!(tracker.num_pending(), 1);
        drop(other);
        assert_eq!(tracker.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_reply_of_wrong_type() {
        let tracker = RequestTracker::new();
        let pending = tracker.register(1);
        tracker.complete(1, pending.request_id(), chat("x"));
        assert!(pending.await_reply_as::<crate::test_util::message::TestPlayer>(Duration::from_secs(1)).await.is_err());
    }
}
