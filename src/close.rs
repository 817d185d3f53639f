use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

type Subscriber = Box<dyn FnOnce() + Send>;

struct CloseState {
    closed: bool,
    next_key: u64,
    subscribers: Vec<(u64, Subscriber)>,
}

/// Tracks the closed/open state of one connection endpoint and fans out
/// close notifications.
///
/// `close` is idempotent: no matter how many times it is called, each
/// subscriber runs exactly once, in registration order. Subscribers
/// registered after close never run.
#[derive(Clone)]
pub struct CloseController {
    state: Arc<Mutex<CloseState>>,
    notify: Arc<Notify>,
}

impl CloseController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloseState {
                closed: false,
                next_key: 0,
                subscribers: Vec::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Flip to closed and run every subscriber once.
    ///
    /// The subscriber list is taken out of the lock before the callbacks
    /// run, so a subscriber cancelling another subscription mid-fanout
    /// cannot corrupt the iteration.
    pub fn close(&self) {
        let subscribers = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        for (_, subscriber) in subscribers {
            subscriber();
        }
        self.notify.notify_waiters();
        // a permit for tasks that start waiting after the close
        self.notify.notify_one();
    }

    /// Register a close subscriber. Cancel via the returned token; dropping
    /// the token keeps the subscription alive.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) -> CloseSubscription {
        let mut state = self.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        if !state.closed {
            state.subscribers.push((key, Box::new(callback)));
        }
        CloseSubscription {
            key,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Resolves once the controller is closed. Usable from `select!` loops;
    /// completes immediately if already closed.
    pub async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for CloseController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CloseController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseController")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Token for a registered close subscriber.
pub struct CloseSubscription {
    key: u64,
    state: std::sync::Weak<Mutex<CloseState>>,
}

impl CloseSubscription {
    /// Remove the subscriber. A no-op if the controller already closed or
    /// the subscriber already ran.
    pub fn cancel(self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock();
            state.subscribers.retain(|(key, _)| *key != self.key);
        }
    }
}
