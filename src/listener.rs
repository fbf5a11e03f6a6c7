//! Listener protocol
//!
//! Observers register a [`DownloadListener`] with the queue and are called
//! synchronously, on the task that produced the event, in the order the
//! events happen. Every callback has an empty default body so a listener
//! only implements what it cares about.

use crate::protocol::{PumpingId, QueueEvent};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Observer of queue and pumping lifecycle events
///
/// Callbacks must not block for long: they run on the queue's command path
/// or on a worker task. The queue never holds its registry lock while a
/// listener runs, so calling back into the queue (e.g. `get_by_id`) is fine.
pub trait DownloadListener: Send + Sync {
    fn pumping_add(&self, _id: PumpingId) {}

    fn pumping_delete(&self, _id: PumpingId) {}

    /// Progress, real URL or length of a pumping changed
    fn pumping_update(&self, _id: PumpingId) {}

    fn pumping_state_change(&self, _id: PumpingId) {}

    /// Every pumping was deleted
    fn queue_reset(&self) {}

    fn pumps_invoke(&self) {}

    fn pumps_terminate(&self) {}

    /// Entry point used by the queue. Routes a typed event to the callbacks
    /// above; override it to see the full event (old and new state).
    fn on_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Added { id } => self.pumping_add(*id),
            QueueEvent::Deleted { id } => self.pumping_delete(*id),
            QueueEvent::Updated { id } => self.pumping_update(*id),
            QueueEvent::StateChanged { id, .. } => self.pumping_state_change(*id),
            QueueEvent::Reset => self.queue_reset(),
            QueueEvent::Invoked => self.pumps_invoke(),
            QueueEvent::Terminated => self.pumps_terminate(),
        }
    }
}

/// Handle returned by `add_listener`, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered registry of listeners
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn DownloadListener>)>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener in registration order
    pub(crate) fn emit(&self, event: &QueueEvent) {
        let listeners: Vec<Arc<dyn DownloadListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }
}

/// Listener that republishes every event on a broadcast channel
pub struct EventChannel {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl DownloadListener for EventChannel {
    fn on_event(&self, event: &QueueEvent) {
        // No receivers is fine
        let _ = self.tx.send(event.clone());
    }
}
