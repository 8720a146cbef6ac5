use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;


type CancelCallback = Box<dyn FnOnce() + Send>;

/// A [CancelToken] is the shared cancellation signal observed by role workers. It is cancelled
///  exactly once; cancellation propagates to all child tokens.
///
/// Workers that block on a syscall register a callback via [CancelToken::on_cancel] that
///  unblocks the call (e.g. shutting down the socket). The callback runs *after* the cancelled
///  flag is set, so a worker that wakes up and checks [CancelToken::is_cancelled] always sees
///  the cancellation.
///
/// For blocking queue consumers, [CancelToken::receiver] returns a channel receiver that
///  becomes disconnected on cancellation, so it can be used in a `crossbeam_channel::select!`.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<CancelCallback>>,
    children: Mutex<Vec<Weak<Inner>>>,
    signal: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancelToken{{cancelled:{}}}", self.is_cancelled())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> CancelToken {
        let (signal, receiver) = crossbeam_channel::bounded(0);
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                callbacks: Default::default(),
                children: Default::default(),
                signal: Mutex::new(Some(signal)),
                receiver,
            }),
        }
    }

    /// Creates a token that is cancelled when this token is cancelled, but can also be
    ///  cancelled on its own without affecting the parent.
    pub fn child_token(&self) -> CancelToken {
        let child = CancelToken::new();

        let mut children = self.inner.children.lock();
        if self.is_cancelled() {
            drop(children);
            child.cancel();
            return child;
        }
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        Inner::cancel(&self.inner);
    }

    /// Registers a callback that runs on cancellation. If the token is already cancelled, the
    ///  callback runs immediately on the calling thread.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.inner.callbacks.lock();
        if self.is_cancelled() {
            drop(callbacks);
            f();
            return;
        }
        callbacks.push(Box::new(f));
    }

    /// A receiver that never yields a value, but disconnects when the token is cancelled
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.receiver
    }

    /// Sleeps for up to `timeout`, returning early with `true` if the token is cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }
}

impl Inner {
    fn cancel(this: &Arc<Inner>) {
        if this.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        // dropping the sender disconnects all receivers
        this.signal.lock().take();

        let callbacks = std::mem::take(&mut *this.callbacks.lock());
        for callback in callbacks {
            callback();
        }

        let children = std::mem::take(&mut *this.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                Inner::cancel(&child);
            }
        }
    }
}
