//! Event bridge
//!
//! One bridge task runs per live connection. It drains the client's raw event
//! stream in order, applies lifecycle events to the owning supervisor's state
//! machine, and publishes normalized events on the [`EventHub`]. State is
//! always updated before the matching event is published, so a subscriber
//! that reads the session on receipt sees the new state.

pub mod hub;
pub mod normalize;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::{EventStream, RawEvent};
use crate::sessions::SessionError;
use crate::supervisor::SessionSupervisor;

pub use hub::{ChannelSubscriber, EventHub, EventSubscriber, SubscriptionId};
pub use normalize::{
    idempotency_key, normalize, ConnectionStatePayload, EventKind, EventPayload, MessagePayload,
    NormalizedEvent, PairingSuccessPayload, QrUpdatePayload, ReceiptPayload,
};

/// Consume `events` for connection `epoch` until `cancel` fires or the client
/// drops its sink.
pub(crate) async fn run(
    supervisor: Arc<SessionSupervisor>,
    epoch: u64,
    mut events: EventStream,
    cancel: CancellationToken,
) {
    debug!(target: "bridge", session_id = %supervisor.id(), epoch, "bridge started");

    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = events.recv() => match next {
                Some(raw) => raw,
                None => {
                    debug!(target: "bridge", session_id = %supervisor.id(), epoch, "event stream closed");
                    break;
                }
            },
        };
        apply(&supervisor, epoch, raw).await;
    }

    debug!(target: "bridge", session_id = %supervisor.id(), epoch, "bridge stopped");
}

async fn apply(supervisor: &Arc<SessionSupervisor>, epoch: u64, raw: RawEvent) {
    if !supervisor.is_current(epoch) {
        trace!(target: "bridge", session_id = %supervisor.id(), epoch, event = raw.name(), "ignoring event from superseded connection");
        return;
    }
    trace!(target: "bridge", session_id = %supervisor.id(), event = raw.name(), "raw event");

    match raw {
        RawEvent::LoggedOut { .. } | RawEvent::Disconnected { .. }
            if supervisor.is_logging_out(epoch) =>
        {
            debug!(target: "bridge", session_id = %supervisor.id(), epoch, event = raw.name(), "event belongs to local logout");
        }
        RawEvent::QrCode { code, timeout } => supervisor.on_qr_code(epoch, code, timeout).await,
        RawEvent::Connected => supervisor.on_connected(epoch).await,
        RawEvent::Disconnected { reason } => supervisor.on_transport_lost(epoch, reason).await,
        RawEvent::PairSuccess {
            jid,
            business_name,
            platform,
            identity,
        } => {
            supervisor
                .on_pair_success(epoch, identity, &jid, &business_name, &platform)
                .await
        }
        RawEvent::PairError { error } => {
            supervisor
                .fail_connection(epoch, SessionError::PairingFailed(error), false)
                .await
        }
        RawEvent::LoggedOut { reason } => {
            supervisor
                .fail_connection(
                    epoch,
                    SessionError::Protocol(format!("logged out remotely: {reason}")),
                    true,
                )
                .await
        }
        RawEvent::StreamReplaced => {
            supervisor
                .fail_connection(
                    epoch,
                    SessionError::Protocol("stream replaced by another client".into()),
                    false,
                )
                .await
        }
        RawEvent::TemporaryBan { reason } => {
            supervisor
                .fail_connection(
                    epoch,
                    SessionError::Protocol(format!("temporarily banned: {reason}")),
                    false,
                )
                .await
        }
        RawEvent::ClientOutdated => {
            supervisor
                .fail_connection(
                    epoch,
                    SessionError::Protocol("client version rejected by server".into()),
                    false,
                )
                .await
        }
        RawEvent::ConnectFailure { reason } => {
            supervisor
                .fail_connection(
                    epoch,
                    SessionError::Protocol(format!("connect failure: {reason}")),
                    false,
                )
                .await
        }
        RawEvent::StreamError { reason } => {
            supervisor
                .fail_connection(
                    epoch,
                    SessionError::Protocol(format!("stream error: {reason}")),
                    false,
                )
                .await
        }
        raw @ (RawEvent::Message { .. }
        | RawEvent::MediaMessage { .. }
        | RawEvent::Receipt { .. }) => {
            if let Some(event) = normalize(supervisor.id(), &raw) {
                supervisor.hub().publish(&event);
            }
        }
        RawEvent::Typing { .. } | RawEvent::Presence { .. } | RawEvent::HistorySync => {}
    }
}
