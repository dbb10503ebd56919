//! Webhook dispatcher: bounded queue plus a fixed pool of delivery workers.
//!
//! A worker pops an event, resolves the session's active endpoints whose
//! filter matches, hands every endpoint but the first back to the queue as a
//! delivery job and delivers the first itself. Each worker performs one
//! event-to-endpoint delivery at a time, retrying with exponential backoff.

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{WebhookConfig, WebhookConfigStore};
use super::delivery::{
    backoff_delay, DeliveryAttempt, DeliveryError, DeliveryLog, DeliveryOutcome, DeliveryRequest,
    WebhookTransport,
};
use super::queue::{DeliveryJob, EventQueue, Job, SubmitOutcome};
use crate::bridge::{EventSubscriber, NormalizedEvent};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher already running")]
    AlreadyRunning,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Events accepted into the queue
    pub submitted: u64,
    /// Events evicted or rejected under pressure
    pub dropped: u64,
    /// Endpoint deliveries that succeeded
    pub delivered: u64,
    /// Endpoint deliveries that gave up
    pub failed: u64,
    /// HTTP attempts made
    pub attempts: u64,
    /// Jobs currently queued
    pub queued: usize,
}

struct Worker {
    queue: Arc<EventQueue>,
    configs: Arc<dyn WebhookConfigStore>,
    transport: Arc<dyn WebhookTransport>,
    settings: DispatchSettings,
    counters: Arc<Counters>,
    log: Arc<DeliveryLog>,
}

pub struct Dispatcher {
    worker: Arc<Worker>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        settings: DispatchSettings,
        configs: Arc<dyn WebhookConfigStore>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                queue: Arc::new(EventQueue::new(settings.queue_capacity)),
                configs,
                transport,
                settings,
                counters: Arc::new(Counters::default()),
                log: Arc::new(DeliveryLog::default()),
            }),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) -> Result<(), DispatchError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyRunning);
        }
        self.worker.queue.reopen();

        let workers = self.worker.settings.workers.max(1);
        let mut handles = self.handles.lock();
        for id in 0..workers {
            let worker = Arc::clone(&self.worker);
            handles.push(tokio::spawn(async move { worker.run(id).await }));
        }
        info!(target: "dispatch", workers, capacity = self.worker.settings.queue_capacity, "dispatcher started");
        Ok(())
    }

    /// Stop intake and drain, bounded by the shutdown timeout.
    ///
    /// Returns false if workers had to be aborted with work outstanding.
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }
        self.worker.queue.close();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let timeout = self.worker.settings.shutdown_timeout;

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(_) => {
                info!(target: "dispatch", "dispatcher drained");
                true
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                warn!(
                    target: "dispatch",
                    remaining = self.worker.queue.len(),
                    "dispatcher drain timed out, workers aborted"
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Enqueue an event for delivery. Never blocks.
    pub fn submit(&self, event: NormalizedEvent) -> SubmitOutcome {
        let kind = event.kind;
        let session_id = event.session_id.clone();
        let outcome = self.worker.queue.push(Arc::new(event));
        let counters = &self.worker.counters;

        match &outcome {
            SubmitOutcome::Queued => {
                counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            SubmitOutcome::QueuedWithEviction { evicted } => {
                counters.submitted.fetch_add(1, Ordering::Relaxed);
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "dispatch", %kind, %session_id, evicted = %evicted, "queue full, evicted oldest event");
            }
            SubmitOutcome::Rejected => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "dispatch", %kind, %session_id, "queue full of critical events, event dropped");
            }
            SubmitOutcome::Closed => {
                debug!(target: "dispatch", %kind, %session_id, "dispatcher closed, event dropped");
            }
        }
        outcome
    }

    pub fn stats(&self) -> DispatchStats {
        let counters = &self.worker.counters;
        DispatchStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            attempts: counters.attempts.load(Ordering::Relaxed),
            queued: self.worker.queue.len(),
        }
    }

    pub fn delivery_log(&self) -> &DeliveryLog {
        &self.worker.log
    }
}

impl EventSubscriber for Dispatcher {
    fn on_event(&self, event: &NormalizedEvent) {
        self.submit(event.clone());
    }
}

impl Worker {
    async fn run(&self, id: usize) {
        debug!(target: "dispatch", worker = id, "worker started");
        while let Some(job) = self.queue.next().await {
            match job {
                Job::Event(event) => self.fan_out(event).await,
                Job::Delivery(job) => self.deliver(&job.event, &job.target).await,
            }
        }
        debug!(target: "dispatch", worker = id, "worker stopped");
    }

    async fn fan_out(&self, event: Arc<NormalizedEvent>) {
        let configs = match self.configs.active_for_session(&event.session_id).await {
            Ok(configs) => configs,
            Err(e) => {
                error!(target: "dispatch", session_id = %event.session_id, error = %e, "failed to load webhook configs");
                return;
            }
        };

        let mut targets = configs.into_iter().filter(|c| c.accepts(event.kind));
        let Some(first) = targets.next() else {
            debug!(target: "dispatch", kind = %event.kind, session_id = %event.session_id, "no webhook subscribed");
            return;
        };
        for target in targets {
            self.queue.push_delivery(DeliveryJob {
                event: Arc::clone(&event),
                target,
            });
        }
        self.deliver(&event, &first).await;
    }

    async fn deliver(&self, event: &NormalizedEvent, target: &WebhookConfig) {
        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(e) => {
                let err = DeliveryError::Serialization(e.to_string());
                self.record(event, target, 1, DeliveryOutcome::Failed, Some(&err));
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(target: "dispatch", webhook_id = %target.id, error = %err, "cannot serialize event");
                return;
            }
        };

        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            let request = DeliveryRequest {
                body: &body,
                kind: event.kind,
                idempotency_key: &event.idempotency_key,
                attempt,
            };

            let err = match self.transport.post(target, request).await {
                Ok(status) => {
                    self.record_status(event, target, attempt, DeliveryOutcome::Success, status);
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target: "dispatch",
                        webhook_id = %target.id,
                        kind = %event.kind,
                        attempt,
                        status,
                        "webhook delivered"
                    );
                    return;
                }
                Err(err) => err,
            };

            let retry = err.is_retryable() && attempt < max_attempts;
            let outcome = if retry {
                DeliveryOutcome::Pending
            } else {
                DeliveryOutcome::Failed
            };
            self.record(event, target, attempt, outcome, Some(&err));
            warn!(
                target: "dispatch",
                webhook_id = %target.id,
                kind = %event.kind,
                attempt,
                max_attempts,
                error = %err,
                retry,
                "webhook delivery failed"
            );

            if !retry {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            tokio::time::sleep(backoff_delay(
                attempt,
                self.settings.initial_backoff,
                self.settings.max_backoff,
            ))
            .await;
        }
    }

    fn record(
        &self,
        event: &NormalizedEvent,
        target: &WebhookConfig,
        attempt: u32,
        outcome: DeliveryOutcome,
        err: Option<&DeliveryError>,
    ) {
        self.log.record(DeliveryAttempt {
            idempotency_key: event.idempotency_key.clone(),
            webhook_id: target.id.clone(),
            attempt,
            outcome,
            http_status: err.and_then(DeliveryError::status),
            error: err.map(|e| e.to_string()),
            timestamp: Utc::now(),
        });
    }

    fn record_status(
        &self,
        event: &NormalizedEvent,
        target: &WebhookConfig,
        attempt: u32,
        outcome: DeliveryOutcome,
        status: u16,
    ) {
        self.log.record(DeliveryAttempt {
            idempotency_key: event.idempotency_key.clone(),
            webhook_id: target.id.clone(),
            attempt,
            outcome,
            http_status: Some(status),
            error: None,
            timestamp: Utc::now(),
        });
    }
}
