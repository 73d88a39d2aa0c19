//! Shelf hub – the live event source shared by every consumer of the view.
//!
//! One connection feeds a process-wide [`EventHub`]; each consumer holds a
//! [`Subscription`] that unregisters itself when cancelled or dropped.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use metrics::counter;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use shelf_core::RawEvent;
use tokio::sync::mpsc;
use tracing::debug;

pub mod transport;

pub use transport::{run_connection, Backoff, Connector, FrameStream, NdjsonConnector, MAX_FRAME_BYTES};

/// What subscribers receive from the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMessage {
    Event(RawEvent),
    /// The transport came back after a disruption; what follows may overlap
    /// with events already delivered and may miss some sent while down.
    Reconnected,
}

type Senders = FxHashMap<u64, mpsc::UnboundedSender<SourceMessage>>;

#[derive(Default)]
struct Inner {
    subs: Mutex<Senders>,
    next_id: AtomicU64,
}

impl Inner {
    fn subs(&self) -> MutexGuard<'_, Senders> {
        self.subs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Inner>,
}

static GLOBAL: Lazy<EventHub> = Lazy::new(EventHub::new);

impl EventHub {
    pub fn new() -> Self { Self::default() }

    /// The process-wide hub.
    pub fn global() -> &'static EventHub { &GLOBAL }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subs().insert(id, tx);
        debug!(sub = id, "hub: subscribed");
        Subscription { id, rx, hub: Arc::downgrade(&self.inner) }
    }

    /// Fan a message out to every live subscriber; returns how many received it.
    pub fn publish(&self, msg: SourceMessage) -> usize {
        let mut subs = self.inner.subs();
        subs.retain(|_, tx| tx.send(msg.clone()).is_ok());
        counter!("shelf_hub_published_total", 1);
        subs.len()
    }

    pub fn subscriber_count(&self) -> usize { self.inner.subs().len() }
}

/// Registration with an [`EventHub`]. Messages arrive in publish order.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SourceMessage>,
    hub: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 { self.id }

    pub async fn recv(&mut self) -> Option<SourceMessage> { self.rx.recv().await }

    /// Unregister now. Dropping the subscription does the same.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.subs().remove(&self.id);
            debug!(sub = self.id, "hub: unsubscribed");
        }
    }
}
