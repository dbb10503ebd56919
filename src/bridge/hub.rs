//! Event fan-out
//!
//! The [`EventHub`] hands every normalized event to each registered
//! [`EventSubscriber`], in publish order. Subscribers run on the publishing
//! task and must return quickly; anything slow belongs behind a queue (see
//! [`ChannelSubscriber`] and the webhook dispatcher).

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::normalize::NormalizedEvent;

/// Receives normalized events. Must not block.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &NormalizedEvent);
}

/// Handle returned by [`EventHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of event subscribers
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn EventSubscriber>)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        debug!(target: "bridge", subscription = id.0, "subscriber added");
        id
    }

    /// Remove a subscriber. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `event` to every subscriber.
    pub fn publish(&self, event: &NormalizedEvent) {
        // Snapshot so subscribers may (un)subscribe from inside on_event
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        trace!(
            target: "bridge",
            kind = %event.kind,
            session_id = %event.session_id,
            subscribers = subscribers.len(),
            "publishing event"
        );
        for subscriber in subscribers {
            subscriber.on_event(event);
        }
    }
}

/// Subscriber that forwards into a bounded channel, dropping on overflow.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<NormalizedEvent>,
    dropped: AtomicU64,
}

impl ChannelSubscriber {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<NormalizedEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Arc::new(Self {
                tx,
                dropped: AtomicU64::new(0),
            }),
            rx,
        )
    }

    /// Events dropped because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSubscriber for ChannelSubscriber {
    fn on_event(&self, event: &NormalizedEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
