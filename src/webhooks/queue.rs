//! Bounded work queue for the dispatcher.
//!
//! Holds two kinds of jobs: events waiting to be fanned out (bounded, with a
//! drop policy) and per-endpoint deliveries split off from an event that was
//! already accepted (unbounded, served first). Producers never wait.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::config::WebhookConfig;
use crate::bridge::NormalizedEvent;

/// Result of submitting an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queued after evicting an older event (its idempotency key)
    QueuedWithEviction { evicted: String },
    /// Queue full of critical events; the non-critical event was dropped
    Rejected,
    /// Dispatcher is stopping or stopped
    Closed,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Queued | Self::QueuedWithEviction { .. })
    }
}

/// One event-to-endpoint delivery
#[derive(Debug, Clone)]
pub(crate) struct DeliveryJob {
    pub event: Arc<NormalizedEvent>,
    pub target: WebhookConfig,
}

#[derive(Debug)]
pub(crate) enum Job {
    Event(Arc<NormalizedEvent>),
    Delivery(DeliveryJob),
}

#[derive(Default)]
struct Inner {
    events: VecDeque<Arc<NormalizedEvent>>,
    deliveries: VecDeque<DeliveryJob>,
}

pub(crate) struct EventQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, event: Arc<NormalizedEvent>) -> SubmitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SubmitOutcome::Closed;
        }

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.events.len() < self.capacity {
                inner.events.push_back(event);
                SubmitOutcome::Queued
            } else {
                let victim = inner
                    .events
                    .iter()
                    .position(|queued| !queued.kind.is_critical())
                    .or_else(|| event.kind.is_critical().then_some(0));
                match victim.and_then(|index| inner.events.remove(index)) {
                    Some(evicted) => {
                        inner.events.push_back(event);
                        SubmitOutcome::QueuedWithEviction {
                            evicted: evicted.idempotency_key.clone(),
                        }
                    }
                    None => SubmitOutcome::Rejected,
                }
            }
        };

        if outcome.is_accepted() {
            self.notify.notify_one();
        }
        outcome
    }

    /// Queue a delivery split off from an accepted event. Allowed while
    /// closing so accepted events still reach every endpoint.
    pub(crate) fn push_delivery(&self, job: DeliveryJob) {
        self.inner.lock().deliveries.push_back(job);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.deliveries.pop_front() {
            return Some(Job::Delivery(job));
        }
        inner.events.pop_front().map(Job::Event)
    }

    /// Next job; `None` once closed and drained.
    pub(crate) async fn next(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop() {
                return Some(job);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub(crate) fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.events.len() + inner.deliveries.len()
    }
}
