//! Session records and connection state
//!
//! A session is one logical multi-device messaging identity. The registry owns
//! the in-memory copy; the durable copy lives behind [`store::SessionStore`].

pub mod proxy;
pub mod store;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub use proxy::{ProxyConfig, ProxyError, ProxyKind};
pub use store::{FileSessionStore, InMemorySessionStore, SessionStore, StoreError};

/// Maximum accepted session name length
const MAX_NAME_LEN: usize = 64;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Session exists but was never connected
    #[default]
    Created,
    /// A connection is being established
    Connecting,
    /// Waiting for the user to complete pairing (QR scan or phone code)
    QrWait,
    /// Connected and logged in
    Connected,
    /// Disconnected explicitly or by transport loss
    Disconnected,
    /// Unrecoverable connection failure; see `connection_error`
    Error,
    /// Logged out explicitly; device identity was discarded
    LoggedOut,
}

impl ConnectionState {
    /// Whether a live connection attempt or connection exists in this state.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::QrWait | Self::Connected)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Created, Error)
                | (Connecting, QrWait)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Error)
                | (QrWait, Connecting)
                | (QrWait, Disconnected)
                | (QrWait, Error)
                | (Connected, Disconnected)
                | (Connected, LoggedOut)
                | (Connected, Error)
                | (Disconnected, Connecting)
                | (Disconnected, Error)
                | (Error, Connecting)
                | (LoggedOut, Connecting)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connecting => write!(f, "connecting"),
            Self::QrWait => write!(f, "qr_wait"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
            Self::LoggedOut => write!(f, "logged_out"),
        }
    }
}

/// Opaque device credential produced by a successful pairing.
///
/// Serialized as base64. The contents are never inspected by this crate.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity(Vec<u8>);

impl DeviceIdentity {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceIdentity({} bytes)", self.0.len())
    }
}

impl Serialize for DeviceIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for DeviceIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// A persisted session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier (UUID), immutable
    pub id: String,
    /// Human-readable unique name, immutable
    pub name: String,
    /// Credential set once pairing succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identity: Option<DeviceIdentity>,
    /// Last known connection state
    #[serde(default)]
    pub connection_state: ConnectionState,
    /// Last connection error, cleared on successful transitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_error: Option<String>,
    /// Optional egress proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session record in state `Created`.
    pub fn new(name: impl Into<String>, proxy: Option<ProxyConfig>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            device_identity: None,
            connection_state: ConnectionState::Created,
            connection_error: None,
            proxy,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this session has completed pairing at some point.
    pub fn is_paired(&self) -> bool {
        self.device_identity
            .as_ref()
            .is_some_and(|identity| !identity.is_empty())
    }

    /// Read-only view for API consumers.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.connection_state,
            error: self.connection_error.clone(),
            has_device_identity: self.is_paired(),
            proxy: self.proxy.as_ref().map(ProxyConfig::redacted),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Snapshot of a session returned to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub has_device_identity: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection attempt was started
    Started,
    /// A connection was already connecting or connected; nothing was done
    AlreadyInProgress,
}

/// Errors returned by session operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("no QR code available for session {0}")]
    NoQrAvailable(String),

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ProxyError> for SessionError {
    fn from(err: ProxyError) -> Self {
        SessionError::InvalidInput(err.to_string())
    }
}

/// Validate a session name: non-empty, bounded, no control characters.
pub fn validate_name(name: &str) -> Result<(), SessionError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SessionError::InvalidInput("session name required".into()));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(SessionError::InvalidInput(format!(
            "session name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(SessionError::InvalidInput(
            "session name contains control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_default() {
        assert_eq!(ConnectionState::default(), ConnectionState::Created);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::QrWait.to_string(), "qr_wait");
        assert_eq!(ConnectionState::LoggedOut.to_string(), "logged_out");
    }

    #[test]
    fn test_logout_only_from_connected() {
        for state in [
            ConnectionState::Created,
            ConnectionState::Connecting,
            ConnectionState::QrWait,
            ConnectionState::Disconnected,
            ConnectionState::Error,
            ConnectionState::LoggedOut,
        ] {
            assert!(!state.can_transition_to(ConnectionState::LoggedOut), "{state}");
        }
        assert!(ConnectionState::Connected.can_transition_to(ConnectionState::LoggedOut));
    }

    #[test]
    fn test_restartable_states_accept_connecting() {
        for state in [
            ConnectionState::Created,
            ConnectionState::Disconnected,
            ConnectionState::Error,
            ConnectionState::LoggedOut,
            ConnectionState::QrWait,
        ] {
            assert!(state.can_transition_to(ConnectionState::Connecting), "{state}");
        }
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Connecting));
    }

    #[test]
    fn test_qr_wait_cannot_skip_to_connected() {
        assert!(!ConnectionState::QrWait.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn test_is_active() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::QrWait.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(!ConnectionState::Error.is_active());
    }

    #[test]
    fn test_device_identity_serde_base64() {
        let identity = DeviceIdentity::new(vec![1u8, 2, 3, 250]);
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, "\"AQID+g==\"");
        let parsed: DeviceIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, identity);
        assert_eq!(format!("{identity:?}"), "DeviceIdentity(4 bytes)");
    }

    #[test]
    fn test_session_new_defaults() {
        let session = Session::new("sales-bot", None);
        assert_eq!(session.connection_state, ConnectionState::Created);
        assert!(!session.is_paired());
        assert!(Uuid::parse_str(&session.id).is_ok());

        let info = session.info();
        assert_eq!(info.name, "sales-bot");
        assert!(!info.has_device_identity);
    }

    #[test]
    fn test_empty_identity_is_not_paired() {
        let mut session = Session::new("bot", None);
        session.device_identity = Some(DeviceIdentity::new(Vec::new()));
        assert!(!session.is_paired());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("sales-bot").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
        assert!(validate_name("bad\nname").is_err());
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::InvalidState {
            operation: "logout",
            state: ConnectionState::Created,
        };
        assert_eq!(err.to_string(), "cannot logout while session is created");
    }
}
