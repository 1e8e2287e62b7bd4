//! Session event signalling with explicit observer registration.
//!
//! The bus is deliberately decoupled from any event-loop model: observers
//! get an unbounded channel and consume it however they like (await,
//! poll, or bridge into a stream). Dropping a subscription detaches it;
//! closed subscribers are pruned on the next emit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Model download progress while a session is being created.
    DownloadProgress {
        received: u64,
        total: Option<u64>,
    },

    /// Emitted once per prompt that forced old exchanges out of history.
    ContextOverflow {
        evicted_turns: usize,
        tokens_freed: u32,
    },

    /// The session reached its terminal state.
    Destroyed,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Fan-out registry for [`SessionEvent`]s.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. The returned subscription receives every
    /// event emitted after this call.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_subscribers().push(Subscriber { id, tx });
        EventSubscription { id, rx }
    }

    /// Detach an observer by id. Dropping the subscription works too.
    pub fn unsubscribe(&self, id: u64) {
        self.lock_subscribers().retain(|s| s.id != id);
    }

    /// Deliver an event to every live observer, pruning closed ones.
    pub fn emit(&self, event: SessionEvent) {
        self.lock_subscribers()
            .retain(|s| s.tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One observer's end of the event bus.
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Await the next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for an already-delivered event.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}
