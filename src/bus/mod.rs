use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Topics presentation components can observe without coupling to the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    Message,
    ItemUpdate,
    RateConfig,
    Proportion,
    Voice,
    Error,
}

#[derive(Debug, Clone)]
pub enum Notification {
    Connection(bool),
    Message {
        action: String,
        data: serde_json::Value,
    },
    ItemUpdate(serde_json::Value),
    RateConfig(serde_json::Value),
    Proportion(HashMap<String, f64>),
    Voice(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<Topic, Vec<(SubscriberId, Handler)>>,
}

/// Synchronous in-process fan-out. FIFO per topic; a panicking subscriber is
/// isolated so the remaining handlers for the same emission still run.
#[derive(Default)]
pub struct NotificationBus {
    inner: Mutex<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriberId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = SubscriberId(inner.next_id);
        inner
            .handlers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, topic: Topic, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.handlers.get_mut(&topic) {
            Some(list) => {
                let before = list.len();
                list.retain(|(sid, _)| *sid != id);
                list.len() != before
            }
            None => false,
        }
    }

    pub fn emit(&self, topic: Topic, notification: Notification) {
        // Handlers are invoked outside the lock so a subscriber may
        // re-enter the bus without deadlocking.
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap();
            match inner.handlers.get(&topic) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&notification))).is_err() {
                tracing::warn!(topic = ?topic, "notification handler panicked");
            }
        }
    }
}
