//! Typed sync events and the listener registry that dispatches them.
//!
//! Listeners are plain callbacks registered on an [`EventBus`]. Dropping (or
//! explicitly unsubscribing) the returned [`Subscription`] removes the
//! callback from the registry and drops it, so a torn-down consumer leaves
//! nothing behind.

use fieldsync_protocol::AttachmentId;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Engine-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No pass running.
    Idle,
    /// A pass is running.
    Syncing,
    /// The last pass hit an unrecoverable failure.
    Error,
}

impl EngineState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Syncing)
    }
}

/// Summary of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Server snapshots applied locally (including refreshed conflicts).
    pub pulled: usize,
    /// Records accepted by the server.
    pub pushed: usize,
    /// Attachments uploaded and verified.
    pub uploaded: usize,
    /// Records that entered `conflict` during the pass.
    pub conflicts: usize,
    /// Records and attachments whose transfer failed during the pass.
    pub failed: usize,
    /// Wall-clock duration of the pass.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }
}

/// An event emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A pass started.
    Start,
    /// A pass made progress.
    Progress {
        /// Engine state.
        state: EngineState,
        /// What just happened.
        message: String,
        /// Cumulative progress in `0.0..=1.0`.
        progress: f32,
    },
    /// A pass finished.
    Complete(SyncReport),
    /// A pass aborted or was cancelled.
    Error {
        /// Failure description.
        error: String,
    },
    /// Upload progress of one attachment.
    PhotoUploadProgress {
        /// Attachment id.
        attachment_id: AttachmentId,
        /// Fraction of bytes sent, `0.0..=1.0`.
        progress: f32,
    },
}

/// Discriminant of a [`SyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `sync:start`
    Start,
    /// `sync:progress`
    Progress,
    /// `sync:complete`
    Complete,
    /// `sync:error`
    Error,
    /// `photo:upload:progress`
    PhotoUploadProgress,
}

impl EventKind {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Start => "sync:start",
            EventKind::Progress => "sync:progress",
            EventKind::Complete => "sync:complete",
            EventKind::Error => "sync:error",
            EventKind::PhotoUploadProgress => "photo:upload:progress",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SyncEvent {
    /// Returns the event kind.
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Start => EventKind::Start,
            SyncEvent::Progress { .. } => EventKind::Progress,
            SyncEvent::Complete(_) => EventKind::Complete,
            SyncEvent::Error { .. } => EventKind::Error,
            SyncEvent::PhotoUploadProgress { .. } => EventKind::PhotoUploadProgress,
        }
    }

    /// Returns true for events that end a pass.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncEvent::Complete(_) | SyncEvent::Error { .. })
    }
}

type Callback = dyn Fn(&SyncEvent) + Send + Sync;

struct Listener {
    id: u64,
    callback: Arc<Callback>,
}

#[derive(Default)]
struct Registry {
    listeners: RwLock<Vec<Listener>>,
    next_id: RwLock<u64>,
}

impl Registry {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }
}

/// Explicit listener registry for [`SyncEvent`]s.
///
/// Cloning the bus yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    ///
    /// The listener stays registered until the returned subscription is
    /// dropped or unsubscribed.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.registry.next_id.write();
            *next += 1;
            *next
        };
        self.registry.listeners.write().push(Listener {
            id,
            callback: Arc::new(callback),
        });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Delivers an event to every listener, in registration order.
    ///
    /// Listeners are invoked outside the registry lock, so a listener may
    /// subscribe or unsubscribe while handling an event.
    pub fn emit(&self, event: &SyncEvent) {
        let callbacks: Vec<Arc<Callback>> = self
            .registry
            .listeners
            .read()
            .iter()
            .map(|l| Arc::clone(&l.callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry.listeners.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle to a registered listener.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Removes the listener. Returns false if it was already removed.
    pub fn unsubscribe(&mut self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => {
                self.registry = Weak::new();
                registry.remove(self.id)
            }
            None => false,
        }
    }

    /// Returns true while the listener is registered.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|r| r.listeners.read().iter().any(|l| l.id == self.id))
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn wire_names() {
        assert_eq!(SyncEvent::Start.kind().name(), "sync:start");
        assert_eq!(
            SyncEvent::Complete(SyncReport::default()).kind().to_string(),
            "sync:complete"
        );
        assert_eq!(
            SyncEvent::PhotoUploadProgress {
                attachment_id: AttachmentId::new("p1"),
                progress: 0.5
            }
            .kind()
            .name(),
            "photo:upload:progress"
        );
    }

    #[test]
    fn listeners_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |event| sink.lock().push(event.kind()));

        bus.emit(&SyncEvent::Start);
        bus.emit(&SyncEvent::Error {
            error: "offline".into(),
        });

        assert_eq!(*seen.lock(), vec![EventKind::Start, EventKind::Error]);
    }

    #[test]
    fn unsubscribe_drops_the_callback() {
        let bus = EventBus::new();
        let token = Arc::new(());
        let held = Arc::clone(&token);
        let mut sub = bus.subscribe(move |_| {
            let _ = &held;
        });
        assert_eq!(Arc::strong_count(&token), 2);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe(|_| {});
            assert_eq!(bus.listener_count(), 1);
        }
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn subscription_outliving_bus_is_harmless() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(|_| {});
        drop(bus);
        assert!(!sub.unsubscribe());
    }
}
