//! Lifecycle event bus.
//!
//! The manager owns one [`EventBus`] and publishes to it after every
//! committed registry mutation. Listeners run synchronously on the
//! publishing task, in registration order.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::queue::QueueHandle;
use crate::worker::WorkerHandle;

/// A subscribed callback.
pub type Listener = Arc<dyn Fn(&ManagerEvent) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&ManagerEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    QueueCreated,
    QueueRemoved,
    WorkerCreated,
    WorkerRemoved,
    NewListener,
    RemoveListener,
    QueueManagerClosed,
}

impl EventKind {
    /// Every event name.
    pub const ALL: [EventKind; 7] = [
        EventKind::QueueCreated,
        EventKind::QueueRemoved,
        EventKind::WorkerCreated,
        EventKind::WorkerRemoved,
        EventKind::NewListener,
        EventKind::RemoveListener,
        EventKind::QueueManagerClosed,
    ];

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::QueueCreated => "queueCreated",
            EventKind::QueueRemoved => "queueRemoved",
            EventKind::WorkerCreated => "workerCreated",
            EventKind::WorkerRemoved => "workerRemoved",
            EventKind::NewListener => "newListener",
            EventKind::RemoveListener => "removeListener",
            EventKind::QueueManagerClosed => "queueManagerClosed",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event with its payload.
#[derive(Clone)]
pub enum ManagerEvent {
    QueueCreated(Arc<QueueHandle>),
    QueueRemoved(Arc<QueueHandle>),
    WorkerCreated(Arc<WorkerHandle>),
    WorkerRemoved(Arc<WorkerHandle>),
    NewListener { event: EventKind, listener: Listener },
    RemoveListener { event: EventKind, listener: Listener },
    QueueManagerClosed,
}

impl ManagerEvent {
    /// The name this event is published under.
    pub fn kind(&self) -> EventKind {
        match self {
            ManagerEvent::QueueCreated(_) => EventKind::QueueCreated,
            ManagerEvent::QueueRemoved(_) => EventKind::QueueRemoved,
            ManagerEvent::WorkerCreated(_) => EventKind::WorkerCreated,
            ManagerEvent::WorkerRemoved(_) => EventKind::WorkerRemoved,
            ManagerEvent::NewListener { .. } => EventKind::NewListener,
            ManagerEvent::RemoveListener { .. } => EventKind::RemoveListener,
            ManagerEvent::QueueManagerClosed => EventKind::QueueManagerClosed,
        }
    }
}

impl fmt::Debug for ManagerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerEvent::QueueCreated(queue) | ManagerEvent::QueueRemoved(queue) => f
                .debug_tuple(self.kind().as_str())
                .field(&queue.name())
                .finish(),
            ManagerEvent::WorkerCreated(worker) | ManagerEvent::WorkerRemoved(worker) => f
                .debug_tuple(self.kind().as_str())
                .field(&worker.queue_name())
                .finish(),
            ManagerEvent::NewListener { event, .. } | ManagerEvent::RemoveListener { event, .. } => {
                f.debug_tuple(self.kind().as_str()).field(event).finish()
            }
            ManagerEvent::QueueManagerClosed => f.write_str(self.kind().as_str()),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Log every publish at debug level
    pub enable_logging: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
        }
    }
}

/// Name-keyed publish/subscribe.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<DashMap<EventKind, Vec<Listener>>>,
    config: Arc<EventBusConfig>,
}

impl EventBus {
    /// Create new event bus
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create event bus with custom config
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Register `listener` for `event`, then announce it with
    /// [`ManagerEvent::NewListener`].
    pub fn subscribe(&self, event: EventKind, listener: Listener) {
        self.listeners
            .entry(event)
            .or_default()
            .push(listener.clone());

        if self.config.enable_logging {
            debug!(event = %event, "Listener subscribed");
        }

        self.publish(ManagerEvent::NewListener { event, listener });
    }

    /// Remove `listener` (matched by identity) from `event`, then announce
    /// it with [`ManagerEvent::RemoveListener`]. The announcement is made
    /// even when the listener was not subscribed, mirroring
    /// [`EventBus::subscribe`]. Returns whether a listener was removed.
    pub fn unsubscribe(&self, event: EventKind, listener: &Listener) -> bool {
        let removed = match self.listeners.get_mut(&event) {
            Some(mut listeners) => match listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
                Some(index) => {
                    listeners.remove(index);
                    true
                }
                None => false,
            },
            None => false,
        };

        if self.config.enable_logging {
            debug!(event = %event, removed, "Listener unsubscribed");
        }
        self.publish(ManagerEvent::RemoveListener {
            event,
            listener: listener.clone(),
        });

        removed
    }

    /// Invoke every listener registered for the event's name. Returns the
    /// number of listeners invoked.
    pub fn publish(&self, event: ManagerEvent) -> usize {
        let kind = event.kind();

        // Snapshot so listeners can subscribe or unsubscribe re-entrantly.
        let listeners = match self.listeners.get(&kind) {
            Some(listeners) => listeners.value().clone(),
            None => return 0,
        };

        if self.config.enable_logging {
            debug!(event = %kind, listeners = listeners.len(), "Publishing event");
        }

        for listener in &listeners {
            listener(&event);
        }

        listeners.len()
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: EventKind) -> usize {
        self.listeners.get(&event).map(|l| l.len()).unwrap_or(0)
    }

    /// Drop every listener without publishing.
    pub fn clear(&self) {
        self.listeners.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(EventKind, usize)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}
