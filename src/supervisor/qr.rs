//! Pairing bookkeeping: QR artifacts, phone codes and refresh accounting.
//!
//! Every connection epoch starts in QR mode. A phone pairing request switches
//! the epoch to phone mode for good; QR codes arriving afterwards are ignored.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;

use crate::sessions::SessionError;

/// E.164 with optional leading `+`, 7 to 15 digits
static E164_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9]\d{6,14}$").unwrap());

/// A QR code the user can scan, valid until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrArtifact {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl QrArtifact {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A numeric pairing code for phone-number linking
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairingMode {
    Qr,
    Phone,
}

/// Result of offering a new QR code to the pairing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QrAccept {
    /// Stale epoch or phone mode
    Ignored,
    /// Refresh budget used up
    Exhausted,
    Stored {
        artifact: QrArtifact,
        start_refresher: bool,
    },
}

/// Result of looking up the current QR artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QrLookup {
    Valid(QrArtifact),
    Expired,
    Unavailable,
}

#[derive(Debug)]
pub(crate) struct PairingState {
    epoch: u64,
    mode: PairingMode,
    qr: Option<QrArtifact>,
    refreshes: u32,
    refresher_started: bool,
    phone_code: Option<PairingCode>,
}

impl Default for PairingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            mode: PairingMode::Qr,
            qr: None,
            refreshes: 0,
            refresher_started: false,
            phone_code: None,
        }
    }
}

impl PairingState {
    /// Start over for a new connection epoch.
    pub(crate) fn reset(&mut self, epoch: u64) {
        *self = Self {
            epoch,
            ..Self::default()
        };
    }

    /// Forget all artifacts of `epoch` (pairing finished or connection gone).
    pub(crate) fn clear(&mut self, epoch: u64) {
        if self.epoch == epoch {
            self.qr = None;
            self.phone_code = None;
        }
    }

    pub(crate) fn accept_qr(
        &mut self,
        epoch: u64,
        code: String,
        ttl: Duration,
        max_refreshes: u32,
        now: DateTime<Utc>,
    ) -> QrAccept {
        if epoch != self.epoch || self.mode == PairingMode::Phone {
            return QrAccept::Ignored;
        }
        if self.qr.is_some() {
            if self.refreshes >= max_refreshes {
                return QrAccept::Exhausted;
            }
            self.refreshes += 1;
        }

        let artifact = QrArtifact {
            code,
            expires_at: now + to_chrono(ttl),
        };
        self.qr = Some(artifact.clone());

        let start_refresher = !self.refresher_started;
        self.refresher_started = true;
        QrAccept::Stored {
            artifact,
            start_refresher,
        }
    }

    pub(crate) fn lookup(&self, epoch: u64, now: DateTime<Utc>) -> QrLookup {
        if epoch != self.epoch || self.mode == PairingMode::Phone {
            return QrLookup::Unavailable;
        }
        match &self.qr {
            Some(artifact) if artifact.is_valid_at(now) => QrLookup::Valid(artifact.clone()),
            Some(_) => QrLookup::Expired,
            None => QrLookup::Unavailable,
        }
    }

    /// Expiry of the current QR code, if the epoch is still in QR mode.
    pub(crate) fn qr_expiry(&self, epoch: u64) -> Option<DateTime<Utc>> {
        if epoch != self.epoch || self.mode == PairingMode::Phone {
            return None;
        }
        self.qr.as_ref().map(|qr| qr.expires_at)
    }

    pub(crate) fn refreshes_exhausted(&self, max_refreshes: u32) -> bool {
        self.refreshes >= max_refreshes
    }

    /// Switch `epoch` to phone pairing, dropping any QR code.
    pub(crate) fn switch_to_phone(&mut self, epoch: u64, code: PairingCode) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.mode = PairingMode::Phone;
        self.qr = None;
        self.phone_code = Some(code);
        true
    }

    pub(crate) fn phone_code(&self, epoch: u64) -> Option<&PairingCode> {
        (epoch == self.epoch)
            .then_some(self.phone_code.as_ref())
            .flatten()
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Validate and normalize a phone number to `+<digits>`.
pub fn normalize_phone(phone: &str) -> Result<String, SessionError> {
    let compact: String = phone
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    if !E164_PATTERN.is_match(&compact) {
        return Err(SessionError::InvalidInput(format!(
            "phone number must be E.164: {phone}"
        )));
    }
    Ok(if compact.starts_with('+') {
        compact
    } else {
        format!("+{compact}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(20);

    #[test]
    fn test_first_qr_starts_refresher_once() {
        let mut state = PairingState::default();
        state.reset(1);
        let now = Utc::now();

        match state.accept_qr(1, "a".into(), TTL, 3, now) {
            QrAccept::Stored {
                start_refresher, ..
            } => assert!(start_refresher),
            other => panic!("unexpected: {other:?}"),
        }
        match state.accept_qr(1, "b".into(), TTL, 3, now) {
            QrAccept::Stored {
                artifact,
                start_refresher,
            } => {
                assert!(!start_refresher);
                assert_eq!(artifact.code, "b");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_stale_epoch_is_ignored() {
        let mut state = PairingState::default();
        state.reset(2);
        assert_eq!(
            state.accept_qr(1, "a".into(), TTL, 3, Utc::now()),
            QrAccept::Ignored
        );
        assert_eq!(state.lookup(1, Utc::now()), QrLookup::Unavailable);
    }

    #[test]
    fn test_refresh_budget() {
        let mut state = PairingState::default();
        state.reset(1);
        let now = Utc::now();
        state.accept_qr(1, "initial".into(), TTL, 1, now);
        assert!(matches!(
            state.accept_qr(1, "refresh-1".into(), TTL, 1, now),
            QrAccept::Stored { .. }
        ));
        assert!(state.refreshes_exhausted(1));
        assert_eq!(
            state.accept_qr(1, "refresh-2".into(), TTL, 1, now),
            QrAccept::Exhausted
        );
    }

    #[test]
    fn test_expired_artifact_is_not_returned() {
        let mut state = PairingState::default();
        state.reset(1);
        let now = Utc::now();
        state.accept_qr(1, "a".into(), TTL, 3, now);

        assert!(matches!(state.lookup(1, now), QrLookup::Valid(_)));
        assert_eq!(
            state.lookup(1, now + chrono::Duration::seconds(21)),
            QrLookup::Expired
        );
    }

    #[test]
    fn test_phone_mode_cancels_qr() {
        let mut state = PairingState::default();
        state.reset(1);
        let now = Utc::now();
        state.accept_qr(1, "a".into(), TTL, 3, now);

        let code = PairingCode {
            code: "ABCD-EFGH".into(),
            expires_at: now + chrono::Duration::seconds(60),
        };
        assert!(state.switch_to_phone(1, code));
        assert_eq!(state.lookup(1, now), QrLookup::Unavailable);
        assert!(state.qr_expiry(1).is_none());
        assert_eq!(
            state.accept_qr(1, "b".into(), TTL, 3, now),
            QrAccept::Ignored
        );
        assert_eq!(state.phone_code(1).map(|c| c.code.as_str()), Some("ABCD-EFGH"));
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 555 123 4567").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("15551234567").unwrap(), "+15551234567");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("+0123456789").is_err());
        assert!(normalize_phone("call me").is_err());
    }
}
