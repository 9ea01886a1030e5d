//! Change notifications for the permission matrix
//!
//! Every subscriber owns an unbounded queue, so a slow consumer only delays
//! itself. Publishing happens under one lock, which gives all subscribers the
//! same order. Nothing is replayed: a new subscriber only sees later changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::models::CacheEntry;

/// What caused the snapshot to be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// Full fetch from the permission source
    Refresh,
    /// Administrative matrix replacement
    Update,
    /// Administrative reset to built-in defaults
    Reset,
    /// Single role merged after a role-specific fetch
    RoleLoaded,
}

/// Notification sent once per snapshot replacement
#[derive(Debug, Clone)]
pub struct MatrixChanged {
    /// Publish order, starting at 1
    pub sequence: u64,
    pub source: ChangeSource,
    pub entry: Arc<CacheEntry>,
}

#[derive(Debug, Default)]
struct BusInner {
    subscribers: Mutex<BTreeMap<u64, mpsc::UnboundedSender<MatrixChanged>>>,
    next_id: AtomicU64,
    sequence: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }
}

/// Typed publish/subscribe hub for [`MatrixChanged`] events
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue-backed listener
    ///
    /// The listener unsubscribes itself when dropped.
    #[must_use]
    pub fn subscribe(&self) -> ChangeListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, tx);
        debug!(subscriber_id = id, "Permission change listener registered");

        ChangeListener {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Register a callback run on its own task, once per change, in order
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_change<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(MatrixChanged) + Send + 'static,
    {
        let mut listener = self.subscribe();
        let id = listener.id;
        let task = tokio::spawn(async move {
            while let Some(event) = listener.recv().await {
                handler(event);
            }
        });

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            task,
        }
    }

    /// Deliver a change to every subscriber, returning its sequence number.
    pub fn publish(&self, source: ChangeSource, entry: Arc<CacheEntry>) -> u64 {
        let mut subscribers = self.inner.subscribers.lock();
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let event = MatrixChanged {
            sequence,
            source,
            entry,
        };

        subscribers.retain(|id, tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                trace!(subscriber_id = id, "Dropping closed permission listener");
            }
            delivered
        });

        trace!(
            sequence,
            ?source,
            subscribers = subscribers.len(),
            "Permission change published"
        );
        sequence
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Queue of change notifications for one subscriber
#[derive(Debug)]
pub struct ChangeListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<MatrixChanged>,
    bus: Weak<BusInner>,
}

impl ChangeListener {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Next change; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<MatrixChanged> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MatrixChanged> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Handle of a callback registered with [`EventBus::on_change`]
///
/// Dropping it unsubscribes; events already queued are still delivered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    task: JoinHandle<()>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving and wait for the callback to finish queued events.
    pub async fn unsubscribe(mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
        self.bus = Weak::new();
        if let Err(e) = (&mut self.task).await {
            warn!(subscriber_id = self.id, error = %e, "Permission change callback ended abnormally");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
