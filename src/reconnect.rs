//! Startup reconnection
//!
//! Re-establishes connections for sessions that completed pairing before the
//! last shutdown. Sessions that never paired are left alone: connecting them
//! would only start a QR flow nobody is waiting to scan.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::sessions::ConnectOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub enabled: bool,
    /// Wait before the first attempt
    pub settle_delay: Duration,
    /// Wait between consecutive attempts
    pub spacing: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_delay: Duration::from_secs(2),
            spacing: Duration::from_millis(500),
        }
    }
}

/// What one reconnect pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectReport {
    pub attempted: usize,
    pub started: usize,
    pub already_active: usize,
    pub skipped_unpaired: usize,
    pub failed: usize,
    /// The shutdown signal ended the pass early
    pub interrupted: bool,
}

/// Sleep for `duration` unless shutdown is signalled first.
/// Returns false on shutdown.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_err() || !*shutdown.borrow(),
    }
}

/// Connect every paired session, one at a time.
///
/// Failures are logged per session and never stop the pass.
pub async fn reconnect_paired_sessions(
    registry: Arc<SessionRegistry>,
    settings: ReconnectSettings,
    mut shutdown: watch::Receiver<bool>,
) -> ReconnectReport {
    let mut report = ReconnectReport::default();
    if !settings.enabled {
        debug!(target: "reconnect", "startup reconnect disabled");
        return report;
    }

    if !pause(settings.settle_delay, &mut shutdown).await {
        report.interrupted = true;
        return report;
    }

    let sessions = registry.list_sessions();
    let (paired, unpaired): (Vec<_>, Vec<_>) =
        sessions.into_iter().partition(|s| s.has_device_identity);
    report.skipped_unpaired = unpaired.len();
    info!(
        target: "reconnect",
        paired = paired.len(),
        skipped = report.skipped_unpaired,
        "reconnecting paired sessions"
    );

    for (index, session) in paired.iter().enumerate() {
        if index > 0 && !pause(settings.spacing, &mut shutdown).await {
            report.interrupted = true;
            break;
        }

        report.attempted += 1;
        match registry.connect(&session.id).await {
            Ok(ConnectOutcome::Started) => {
                report.started += 1;
                debug!(target: "reconnect", session_id = %session.id, "reconnect started");
            }
            Ok(ConnectOutcome::AlreadyInProgress) => {
                report.already_active += 1;
            }
            Err(e) => {
                report.failed += 1;
                warn!(
                    target: "reconnect",
                    session_id = %session.id,
                    name = %session.name,
                    error = %e,
                    "reconnect failed"
                );
            }
        }
    }

    info!(
        target: "reconnect",
        attempted = report.attempted,
        started = report.started,
        failed = report.failed,
        interrupted = report.interrupted,
        "reconnect pass finished"
    );
    report
}
