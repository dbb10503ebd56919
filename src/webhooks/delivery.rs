//! Webhook delivery: the HTTP transport port, retry classification and the
//! attempt log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use super::config::WebhookConfig;
use super::signing::{sign_payload, SIGNATURE_HEADER};
use crate::bridge::EventKind;

/// Attempts kept in the in-memory log
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

const USER_AGENT: &str = concat!("wamux/", env!("CARGO_PKG_VERSION"));

/// Why a delivery attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DeliveryError {
    /// Transport failures, timeouts, 5xx, 408 and 429 are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status(status) => *status >= 500 || *status == 408 || *status == 429,
            Self::Transport(_) | Self::Timeout => true,
            Self::Serialization(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }
}

/// One POST to a webhook endpoint
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRequest<'a> {
    pub body: &'a [u8],
    pub kind: EventKind,
    pub idempotency_key: &'a str,
    pub attempt: u32,
}

/// Sends webhook requests. Returns the 2xx status on success.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        target: &WebhookConfig,
        request: DeliveryRequest<'_>,
    ) -> Result<u16, DeliveryError>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        target: &WebhookConfig,
        request: DeliveryRequest<'_>,
    ) -> Result<u16, DeliveryError> {
        let mut req = self
            .client
            .post(&target.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Wamux-Event", request.kind.as_str())
            .header("X-Wamux-Idempotency-Key", request.idempotency_key)
            .header("X-Wamux-Delivery-Attempt", request.attempt.to_string())
            .body(request.body.to_vec());

        if !target.secret.is_empty() {
            let signature = sign_payload(&target.secret, Utc::now().timestamp(), request.body);
            req = req.header(SIGNATURE_HEADER, signature);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(status.as_u16())
                } else {
                    Err(DeliveryError::Status(status.as_u16()))
                }
            }
            Err(e) if e.is_timeout() => Err(DeliveryError::Timeout),
            Err(e) => Err(DeliveryError::Transport(e.to_string())),
        }
    }
}

/// Exponential backoff before attempt `attempt + 1`, capped at `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(factor).min(max)
}

// ============================================================================
// Attempt log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    /// Final failure: non-retryable, or out of attempts
    Failed,
    /// Failed, another attempt is scheduled
    Pending,
}

/// Record of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryAttempt {
    pub idempotency_key: String,
    pub webhook_id: String,
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded log of recent attempts; the oldest entries fall off.
#[derive(Debug)]
pub struct DeliveryLog {
    capacity: usize,
    entries: Mutex<VecDeque<DeliveryAttempt>>,
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, attempt: DeliveryAttempt) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(attempt);
    }

    /// Attempts for one event, in the order they were made
    pub fn for_event(&self, idempotency_key: &str) -> Vec<DeliveryAttempt> {
        self.entries
            .lock()
            .iter()
            .filter(|a| a.idempotency_key == idempotency_key)
            .cloned()
            .collect()
    }

    /// The `limit` most recent attempts, newest last
    pub fn recent(&self, limit: usize) -> Vec<DeliveryAttempt> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
