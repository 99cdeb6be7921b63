//! Connectivity observation.
//!
//! The platform reports reachability changes through
//! [`NetworkMonitor::set_online`]. The monitor publishes the current state on
//! a watch channel and transitions on a broadcast channel. A reconnect only
//! becomes [`NetworkEvent::SyncEligible`] once connectivity has held for the
//! stabilization interval; a flap inside that window cancels the signal.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 16;

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The device regained connectivity.
    WentOnline,
    /// The device lost connectivity.
    WentOffline,
    /// Connectivity held for the stabilization interval.
    SyncEligible,
}

/// Observes device connectivity.
pub struct NetworkMonitor {
    online: watch::Sender<bool>,
    events: broadcast::Sender<NetworkEvent>,
    generation: Arc<AtomicU64>,
    stabilization: Duration,
    transition: Mutex<()>,
}

impl NetworkMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(initially_online: bool, stabilization: Duration) -> Self {
        let (online, _) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            online,
            events,
            generation: Arc::new(AtomicU64::new(0)),
            stabilization,
            transition: Mutex::new(()),
        }
    }

    /// Returns true if the device is currently online.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Returns a receiver of the current connectivity.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Subscribes to connectivity transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Stabilization interval.
    pub fn stabilization(&self) -> Duration {
        self.stabilization
    }

    /// Records a reachability report from the platform.
    ///
    /// Repeated reports of the same state are ignored. Must be called from
    /// within a tokio runtime for the stabilization timer to run; without
    /// one, `SyncEligible` is emitted immediately.
    pub fn set_online(&self, online: bool) {
        let _transition = self.transition.lock();
        if !self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        }) {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !online {
            tracing::info!("network went offline");
            let _ = self.events.send(NetworkEvent::WentOffline);
            return;
        }

        tracing::info!("network went online");
        let _ = self.events.send(NetworkEvent::WentOnline);

        let events = self.events.clone();
        let current = Arc::clone(&self.generation);
        let stabilization = self.stabilization;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(stabilization).await;
                    if current.load(Ordering::SeqCst) == generation {
                        tracing::debug!("connectivity stable, sync eligible");
                        let _ = events.send(NetworkEvent::SyncEligible);
                    }
                });
            }
            Err(_) => {
                let _ = events.send(NetworkEvent::SyncEligible);
            }
        }
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .field("stabilization", &self.stabilization)
            .finish()
    }
}
