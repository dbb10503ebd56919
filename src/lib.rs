//! wamux library
//!
//! Runs many independent messaging sessions in one process, supervises each
//! session's connection lifecycle, and turns inbound protocol events into
//! signed webhook deliveries.
//!
//! The entry points are [`registry::SessionRegistry`] for session operations
//! and [`runtime::Runtime`] for wiring a complete process.

pub mod bridge;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod runtime;
pub mod sessions;
pub mod supervisor;
pub mod webhooks;

pub use bridge::{EventHub, EventKind, EventSubscriber, NormalizedEvent, SubscriptionId};
pub use config::{load_config, Config, ConfigError};
pub use registry::SessionRegistry;
pub use runtime::{Runtime, RuntimeHandle, RuntimePorts, StartupError};
pub use sessions::{ConnectOutcome, ConnectionState, SessionError, SessionInfo};
pub use supervisor::{PairingCode, QrArtifact, SupervisorSettings};
pub use webhooks::{Dispatcher, SubmitOutcome, WebhookConfig};
