//! Messaging protocol port.
//!
//! The wire protocol (noise handshake, framing, signal sessions) lives in an
//! external client library. This module defines the seam the supervisor talks
//! to:
//!
//! - [`ProtocolClient`]: connect / disconnect / logout / pair / send for one
//!   session, plus QR refresh
//! - [`ClientFactory`]: builds a client from a session's stored credential and
//!   proxy settings
//! - [`RawEvent`]: the events a client emits on the [`EventSink`] it was handed
//!   at connect time
//!
//! A client emits events on exactly one sink, in order. The sink is dropped when
//! the connection goes away, which ends the subscription.

pub mod loopback;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::sessions::{DeviceIdentity, ProxyConfig};

/// Sender half of a client's event subscription
pub type EventSink = mpsc::UnboundedSender<RawEvent>;

/// Receiver half of a client's event subscription
pub type EventStream = mpsc::UnboundedReceiver<RawEvent>;

/// Create a new event subscription pair.
pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

// ============================================================================
// Raw events
// ============================================================================

/// Events emitted by the underlying protocol client
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// QR code available for scanning
    QrCode { code: String, timeout: Duration },
    /// Client connected and logged in
    Connected,
    /// Transport lost (not a logout)
    Disconnected { reason: Option<String> },
    /// Incoming text message
    Message {
        chat_jid: String,
        sender_jid: String,
        message_id: String,
        text: Option<String>,
        timestamp: i64,
        is_from_me: bool,
        is_group: bool,
    },
    /// Incoming media message
    MediaMessage {
        chat_jid: String,
        sender_jid: String,
        message_id: String,
        media_type: String,
        caption: Option<String>,
        timestamp: i64,
        is_from_me: bool,
        is_group: bool,
    },
    /// Delivery / read receipt
    Receipt {
        message_ids: Vec<String>,
        chat_jid: String,
        sender_jid: String,
        status: ReceiptStatus,
        timestamp: i64,
    },
    /// Pairing completed; carries the new device credential
    PairSuccess {
        jid: String,
        business_name: String,
        platform: String,
        identity: DeviceIdentity,
    },
    /// Pairing failed
    PairError { error: String },
    /// Logged out from the phone or server side
    LoggedOut { reason: String },
    /// Another client took over the stream
    StreamReplaced,
    /// Temporary ban
    TemporaryBan { reason: String },
    /// Client version rejected by the server
    ClientOutdated,
    /// Connection failure reported by the server
    ConnectFailure { reason: String },
    /// Stream error
    StreamError { reason: String },
    /// Typing indicator
    Typing {
        chat_jid: String,
        user_jid: String,
        is_typing: bool,
    },
    /// Presence update
    Presence {
        user_jid: String,
        is_online: bool,
        last_seen: Option<i64>,
    },
    /// History sync in progress
    HistorySync,
}

impl RawEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::QrCode { .. } => "qr_code",
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Message { .. } => "message",
            Self::MediaMessage { .. } => "media_message",
            Self::Receipt { .. } => "receipt",
            Self::PairSuccess { .. } => "pair_success",
            Self::PairError { .. } => "pair_error",
            Self::LoggedOut { .. } => "logged_out",
            Self::StreamReplaced => "stream_replaced",
            Self::TemporaryBan { .. } => "temporary_ban",
            Self::ClientOutdated => "client_outdated",
            Self::ConnectFailure { .. } => "connect_failure",
            Self::StreamError { .. } => "stream_error",
            Self::Typing { .. } => "typing",
            Self::Presence { .. } => "presence",
            Self::HistorySync => "history_sync",
        }
    }
}

/// Message delivery/read status carried by receipts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Read,
    Played,
}

/// A fresh QR code returned by [`ProtocolClient::refresh_qr`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCode {
    pub code: String,
    pub timeout: Duration,
}

/// A phone pairing code returned by [`ProtocolClient::pair_phone`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairCode {
    pub code: String,
    pub timeout: Duration,
}

// ============================================================================
// Client port
// ============================================================================

/// Protocol client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Pairing error: {0}")]
    PairingError(String),

    #[error("Send error: {0}")]
    SendError(String),

    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

/// Parameters for building a client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub session_id: String,
    pub device_identity: Option<DeviceIdentity>,
    pub proxy: Option<ProxyConfig>,
}

/// One session's connection to the messaging network.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open the connection. Events are emitted on `events` until the client
    /// disconnects or is dropped. A client without a device identity starts
    /// the QR pairing flow by emitting [`RawEvent::QrCode`].
    async fn connect(&self, events: EventSink) -> Result<(), ProtocolError>;

    /// Close the connection, keeping the device credential valid.
    async fn disconnect(&self) -> Result<(), ProtocolError>;

    /// Log out, invalidating the device credential on the server.
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Request a new QR code for the in-flight pairing flow.
    async fn refresh_qr(&self) -> Result<QrCode, ProtocolError>;

    /// Switch the in-flight pairing flow to a numeric phone code.
    async fn pair_phone(&self, phone: &str) -> Result<PairCode, ProtocolError>;

    /// Send a text message; returns the protocol message id.
    async fn send_text(&self, to: &str, text: &str) -> Result<String, ProtocolError>;
}

/// Builds protocol clients for sessions.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, options: ClientOptions) -> Result<Arc<dyn ProtocolClient>, ProtocolError>;
}

/// Normalize a user-supplied address to JID form.
///
/// `+15551234567` becomes `15551234567@s.whatsapp.net`; group ids keep or gain
/// the `@g.us` server.
pub fn normalize_jid(id: &str) -> String {
    let trimmed = id.trim();

    if trimmed.contains('@') {
        return trimmed.to_string();
    }

    let digits = trimmed.trim_start_matches('+');

    if digits.starts_with("120363") {
        format!("{digits}@g.us")
    } else {
        format!("{digits}@s.whatsapp.net")
    }
}
