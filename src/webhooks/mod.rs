//! Event-to-webhook dispatch pipeline
//!
//! - [`config`]: endpoint configuration and the read port the dispatcher uses
//! - [`queue`]: the bounded, non-blocking work queue
//! - [`dispatch`]: worker pool, fan-out and retry
//! - [`delivery`]: HTTP transport, retry classification, attempt log
//! - [`signing`]: HMAC signature helpers for senders and receivers

pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod queue;
pub mod signing;

pub use config::{InMemoryWebhookConfigStore, WebhookConfig, WebhookConfigStore, WebhookStoreError};
pub use delivery::{
    DeliveryAttempt, DeliveryError, DeliveryLog, DeliveryOutcome, DeliveryRequest, HttpTransport,
    WebhookTransport,
};
pub use dispatch::{DispatchError, DispatchSettings, DispatchStats, Dispatcher};
pub use queue::SubmitOutcome;
pub use signing::{sign_payload, verify_signature, SIGNATURE_HEADER};
