//! Typed event bus: `E` is a plain enum of event payloads, handlers are registered per-bus,
//! and dispatch is synchronous on the producing task. An unsupported event kind is a compile
//! error rather than a runtime lookup failure.

use std::sync::Arc;
use tokio::sync::Mutex;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A synchronous, multi-consumer event bus for one event enum `E`.
///
/// Cloning an `EventBus` shares the same handler list — clone it into every component that
/// needs to emit events rather than constructing a new one per component.
#[derive(Clone)]
pub struct EventBus<E> {
    handlers: Arc<Mutex<Vec<Handler<E>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. There is no notion of an invalid event kind to reject at this
    /// layer — `E`'s variants are the only events this bus can ever carry, so a bad kind is
    /// a compile error, not a runtime one.
    pub async fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.handlers.lock().await.push(Arc::new(handler));
    }

    /// Dispatch `event` to every subscriber in registration order, on the calling task.
    /// A handler that blocks delays every handler registered after it and the caller.
    pub async fn emit(&self, event: E) {
        let handlers = self.handlers.lock().await.clone();
        for h in handlers {
            h(&event);
        }
    }
}

/// Events emitted by the SSDP engine.
#[derive(Debug, Clone)]
pub enum SsdpEvent {
    Started,
    Stopped,
    ReceivedSearch { remote_ip: String, st: String },
    ReceivedNotify { remote_ip: String },
    ReceivedByebye { remote_ip: String },
    SentSearch,
    SentNotify,
    DeviceJoined { remote_ip: String },
    DeviceLeaved { remote_ip: String },
}

/// Events emitted by the Agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Found { ip: String, service_url: String },
    Joined { ip: String },
    Updated { ip: String },
    Online { ip: String },
    Offline { ip: String },
}
