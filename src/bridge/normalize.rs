//! Normalized events
//!
//! Raw protocol events are turned into [`NormalizedEvent`]s with a typed
//! payload. JSON only appears when a subscriber serializes the event (the
//! webhook body).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::{RawEvent, ReceiptStatus};
use crate::sessions::ConnectionState;

/// Kinds of normalized events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Message,
    Receipt,
    ConnectionState,
    QrUpdate,
    PairingSuccess,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Message,
        EventKind::Receipt,
        EventKind::ConnectionState,
        EventKind::QrUpdate,
        EventKind::PairingSuccess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Receipt => "receipt",
            Self::ConnectionState => "connection-state",
            Self::QrUpdate => "qr-update",
            Self::PairingSuccess => "pairing-success",
        }
    }

    /// Critical events are kept over non-critical ones under queue pressure.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::ConnectionState | Self::PairingSuccess)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagePayload {
    pub message_id: String,
    pub chat_jid: String,
    pub sender_jid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub is_from_me: bool,
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptPayload {
    pub message_ids: Vec<String>,
    pub chat_jid: String,
    pub sender_jid: String,
    pub status: ReceiptStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatePayload {
    pub from: ConnectionState,
    pub to: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QrUpdatePayload {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingSuccessPayload {
    pub jid: String,
    pub business_name: String,
    pub platform: String,
}

/// Kind-specific event data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Message(MessagePayload),
    Receipt(ReceiptPayload),
    ConnectionState(ConnectionStatePayload),
    QrUpdate(QrUpdatePayload),
    PairingSuccess(PairingSuccessPayload),
}

/// An immutable, typed event produced by the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub occurred_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub payload: EventPayload,
}

impl NormalizedEvent {
    fn new(
        kind: EventKind,
        session_id: &str,
        native_id: &str,
        occurred_at: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            occurred_at,
            idempotency_key: idempotency_key(kind, session_id, native_id),
            payload,
        }
    }

    /// Event for a state machine transition. `at` is the transition time,
    /// which makes the key unique per transition.
    pub fn connection_state(
        session_id: &str,
        from: ConnectionState,
        to: ConnectionState,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let native_id = format!(
            "{from}>{to}@{}",
            at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp_micros())
        );
        Self::new(
            EventKind::ConnectionState,
            session_id,
            &native_id,
            at,
            EventPayload::ConnectionState(ConnectionStatePayload { from, to, error }),
        )
    }

    pub fn qr_update(session_id: &str, code: &str, expires_at: DateTime<Utc>) -> Self {
        Self::new(
            EventKind::QrUpdate,
            session_id,
            code,
            Utc::now(),
            EventPayload::QrUpdate(QrUpdatePayload {
                code: code.to_string(),
                expires_at,
            }),
        )
    }

    pub fn pairing_success(session_id: &str, jid: &str, business_name: &str, platform: &str) -> Self {
        Self::new(
            EventKind::PairingSuccess,
            session_id,
            jid,
            Utc::now(),
            EventPayload::PairingSuccess(PairingSuccessPayload {
                jid: jid.to_string(),
                business_name: business_name.to_string(),
                platform: platform.to_string(),
            }),
        )
    }
}

/// Deterministic dedupe key: hex SHA-256 of kind, session and native id.
pub fn idempotency_key(kind: EventKind, session_id: &str, native_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(session_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(native_id.as_bytes());
    hex::encode(hasher.finalize())
}

fn timestamp_or_now(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

/// Normalize a message or receipt event. Lifecycle events return `None`;
/// the bridge handles those against the state machine.
pub fn normalize(session_id: &str, raw: &RawEvent) -> Option<NormalizedEvent> {
    match raw {
        RawEvent::Message {
            chat_jid,
            sender_jid,
            message_id,
            text,
            timestamp,
            is_from_me,
            is_group,
        } => Some(NormalizedEvent::new(
            EventKind::Message,
            session_id,
            message_id,
            timestamp_or_now(*timestamp),
            EventPayload::Message(MessagePayload {
                message_id: message_id.clone(),
                chat_jid: chat_jid.clone(),
                sender_jid: sender_jid.clone(),
                text: text.clone(),
                media_type: None,
                is_from_me: *is_from_me,
                is_group: *is_group,
            }),
        )),
        RawEvent::MediaMessage {
            chat_jid,
            sender_jid,
            message_id,
            media_type,
            caption,
            timestamp,
            is_from_me,
            is_group,
        } => Some(NormalizedEvent::new(
            EventKind::Message,
            session_id,
            message_id,
            timestamp_or_now(*timestamp),
            EventPayload::Message(MessagePayload {
                message_id: message_id.clone(),
                chat_jid: chat_jid.clone(),
                sender_jid: sender_jid.clone(),
                text: caption.clone(),
                media_type: Some(media_type.clone()),
                is_from_me: *is_from_me,
                is_group: *is_group,
            }),
        )),
        RawEvent::Receipt {
            message_ids,
            chat_jid,
            sender_jid,
            status,
            timestamp,
        } => {
            // A receipt is identified by the messages it covers and its status
            let native_id = format!("{}:{}", message_ids.join(","), status_str(*status));
            Some(NormalizedEvent::new(
                EventKind::Receipt,
                session_id,
                &native_id,
                timestamp_or_now(*timestamp),
                EventPayload::Receipt(ReceiptPayload {
                    message_ids: message_ids.clone(),
                    chat_jid: chat_jid.clone(),
                    sender_jid: sender_jid.clone(),
                    status: *status,
                }),
            ))
        }
        _ => None,
    }
}

fn status_str(status: ReceiptStatus) -> &'static str {
    match status {
        ReceiptStatus::Sent => "sent",
        ReceiptStatus::Delivered => "delivered",
        ReceiptStatus::Read => "read",
        ReceiptStatus::Played => "played",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(id: &str) -> RawEvent {
        RawEvent::Message {
            chat_jid: "15551234567@s.whatsapp.net".into(),
            sender_jid: "15551234567@s.whatsapp.net".into(),
            message_id: id.into(),
            text: Some("hello".into()),
            timestamp: 1_700_000_000,
            is_from_me: false,
            is_group: false,
        }
    }

    #[test]
    fn test_event_kind_serde_is_kebab_case() {
        let json = serde_json::to_string(&EventKind::ConnectionState).unwrap();
        assert_eq!(json, "\"connection-state\"");
        let parsed: EventKind = serde_json::from_str("\"qr-update\"").unwrap();
        assert_eq!(parsed, EventKind::QrUpdate);
        assert_eq!("pairing-success".parse::<EventKind>(), Ok(EventKind::PairingSuccess));
        assert!("typing".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_critical_kinds() {
        assert!(EventKind::ConnectionState.is_critical());
        assert!(EventKind::PairingSuccess.is_critical());
        assert!(!EventKind::Message.is_critical());
        assert!(!EventKind::Receipt.is_critical());
        assert!(!EventKind::QrUpdate.is_critical());
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = normalize("s1", &text_message("ABC")).unwrap();
        let b = normalize("s1", &text_message("ABC")).unwrap();
        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_eq!(a.idempotency_key.len(), 64);

        let other_session = normalize("s2", &text_message("ABC")).unwrap();
        assert_ne!(a.idempotency_key, other_session.idempotency_key);

        let other_kind = idempotency_key(EventKind::Receipt, "s1", "ABC");
        assert_ne!(a.idempotency_key, other_kind);
    }

    #[test]
    fn test_message_body_shape() {
        let event = normalize("s1", &text_message("ABC")).unwrap();
        let body = serde_json::to_value(&event).unwrap();
        assert_eq!(body["kind"], "message");
        assert_eq!(body["session_id"], "s1");
        assert_eq!(body["payload"]["message_id"], "ABC");
        assert_eq!(body["payload"]["text"], "hello");
        assert!(body["payload"].get("media_type").is_none());
        assert_eq!(event.occurred_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_media_message_uses_caption() {
        let raw = RawEvent::MediaMessage {
            chat_jid: "c".into(),
            sender_jid: "s".into(),
            message_id: "M1".into(),
            media_type: "image".into(),
            caption: Some("look".into()),
            timestamp: 0,
            is_from_me: true,
            is_group: false,
        };
        let event = normalize("s1", &raw).unwrap();
        match event.payload {
            EventPayload::Message(payload) => {
                assert_eq!(payload.media_type.as_deref(), Some("image"));
                assert_eq!(payload.text.as_deref(), Some("look"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_receipt_key_depends_on_status() {
        let receipt = |status| RawEvent::Receipt {
            message_ids: vec!["A".into(), "B".into()],
            chat_jid: "c".into(),
            sender_jid: "s".into(),
            status,
            timestamp: 0,
        };
        let delivered = normalize("s1", &receipt(ReceiptStatus::Delivered)).unwrap();
        let read = normalize("s1", &receipt(ReceiptStatus::Read)).unwrap();
        assert_eq!(delivered.kind, EventKind::Receipt);
        assert_ne!(delivered.idempotency_key, read.idempotency_key);
    }

    #[test]
    fn test_lifecycle_events_are_not_normalized_here() {
        assert!(normalize("s1", &RawEvent::Connected).is_none());
        assert!(normalize("s1", &RawEvent::HistorySync).is_none());
    }

    #[test]
    fn test_connection_state_keys_differ_per_transition() {
        let t0 = Utc::now();
        let first = NormalizedEvent::connection_state(
            "s1",
            ConnectionState::Connecting,
            ConnectionState::Connected,
            None,
            t0,
        );
        let second = NormalizedEvent::connection_state(
            "s1",
            ConnectionState::Connecting,
            ConnectionState::Connected,
            None,
            t0 + chrono::Duration::seconds(5),
        );
        assert_ne!(first.idempotency_key, second.idempotency_key);

        let body = serde_json::to_value(&first).unwrap();
        assert_eq!(body["kind"], "connection-state");
        assert_eq!(body["payload"]["to"], "connected");
    }
}
