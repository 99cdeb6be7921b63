//! Change feed for observing committed status transitions.
//!
//! Every committed write emits [`StoreEvent`]s to subscribers and folds the
//! same transitions into a [`StatusCounts`] watch channel, so UI consumers
//! and the engine observe the store without polling.
//!
//! ```rust,ignore
//! let rx = store.subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(event) = rx.recv() {
//!         println!("change: {event:?}");
//!     }
//! });
//! ```

use crate::model::{AttachmentStatus, StatusCounts, SyncStatus};
use fieldsync_protocol::{AttachmentId, RecordId};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;

/// A committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A record was written.
    Record {
        /// Record id.
        id: RecordId,
        /// Previous status (`None` on insert).
        from: Option<SyncStatus>,
        /// New status.
        to: SyncStatus,
    },
    /// An attachment was written.
    Attachment {
        /// Attachment id.
        id: AttachmentId,
        /// Previous status (`None` on insert).
        from: Option<AttachmentStatus>,
        /// New status.
        to: AttachmentStatus,
    },
    /// A metadata key was written.
    Metadata {
        /// Key.
        key: String,
    },
    /// An audit entry was appended.
    Audit {
        /// Resolved record.
        record_id: RecordId,
    },
}

impl StoreEvent {
    /// Returns true if the event changed a status.
    pub fn is_transition(&self) -> bool {
        match self {
            StoreEvent::Record { from, to, .. } => *from != Some(*to),
            StoreEvent::Attachment { from, to, .. } => *from != Some(*to),
            _ => false,
        }
    }
}

/// Distributes committed changes to subscribers.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<StoreEvent>>>,
    counts: watch::Sender<StatusCounts>,
}

impl ChangeFeed {
    /// Creates a feed seeded with the current counts.
    pub fn new(initial: StatusCounts) -> Self {
        let (counts, _) = watch::channel(initial);
        Self {
            subscribers: RwLock::new(Vec::new()),
            counts,
        }
    }

    /// Subscribes to future events.
    ///
    /// The receiver should be drained regularly; it is unbounded.
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Returns a receiver of live status counts.
    pub fn watch_counts(&self) -> watch::Receiver<StatusCounts> {
        self.counts.subscribe()
    }

    /// Current counts.
    pub fn counts(&self) -> StatusCounts {
        *self.counts.borrow()
    }

    /// Emits the events of one commit, in order.
    pub fn emit_batch(&self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        self.counts.send_if_modified(|counts| {
            let before = *counts;
            for event in &events {
                match event {
                    StoreEvent::Record { from, to, .. } => counts.apply_record(*from, *to),
                    StoreEvent::Attachment { from, to, .. } => {
                        counts.apply_attachment(*from, *to)
                    }
                    _ => {}
                }
            }
            before != *counts
        });

        // Send to subscribers (remove disconnected ones)
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(StatusCounts::default())
    }
}
