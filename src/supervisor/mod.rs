//! Connection supervisor
//!
//! A [`SessionSupervisor`] owns one session's in-memory record and, while
//! connected, its [`ConnectionHandle`]. Lifecycle operations (connect,
//! disconnect, logout, pair, delete) are serialized by a per-session async
//! mutex that guards the handle slot, so at most one live connection exists
//! per session.
//!
//! Each connection gets a fresh epoch. The bridge task and the QR refresher
//! carry the epoch they were started for; state changes requested for a
//! superseded epoch are dropped. Fatal protocol events move the session to
//! `Error` right away and tear the handle down from a separate task, so the
//! bridge never waits on the lifecycle lock.

pub mod qr;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{self, EventHub, NormalizedEvent};
use crate::protocol::{event_channel, normalize_jid, ClientFactory, ClientOptions, ProtocolClient};
use crate::sessions::{
    ConnectOutcome, ConnectionState, DeviceIdentity, ProxyConfig, Session, SessionError,
    SessionInfo, SessionStore,
};

use qr::{PairingState, QrAccept, QrLookup};
pub use qr::{normalize_phone, PairingCode, QrArtifact};

/// Timing knobs for the pairing flow and connection setup
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// QR lifetime used when the client does not advertise one
    pub qr_timeout: Duration,
    /// QR refreshes allowed before pairing times out
    pub qr_max_refreshes: u32,
    /// Pairing code lifetime used when the client does not advertise one
    pub pair_code_timeout: Duration,
    /// Upper bound on `ProtocolClient::connect`
    pub connect_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            qr_timeout: Duration::from_secs(60),
            qr_max_refreshes: 5,
            pair_code_timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Collaborators shared by all supervisors
pub(crate) struct SupervisorContext {
    pub store: Arc<dyn SessionStore>,
    pub factory: Arc<dyn ClientFactory>,
    pub hub: Arc<EventHub>,
    pub settings: SupervisorSettings,
}

/// Runtime-only ownership of one live connection.
pub(crate) struct ConnectionHandle {
    epoch: u64,
    client: Arc<dyn ProtocolClient>,
    cancel: CancellationToken,
    bridge: JoinHandle<()>,
}

/// Client reference for work that runs outside the lifecycle lock
#[derive(Clone)]
struct ActiveConnection {
    epoch: u64,
    client: Arc<dyn ProtocolClient>,
    cancel: CancellationToken,
}

struct Cell {
    session: Session,
    epoch: u64,
    deleted: bool,
}

pub struct SessionSupervisor {
    id: String,
    ctx: Arc<SupervisorContext>,
    cell: RwLock<Cell>,
    /// Orders transitions with their published events
    publish: Mutex<()>,
    lifecycle: AsyncMutex<Option<ConnectionHandle>>,
    active: RwLock<Option<ActiveConnection>>,
    pairing: Mutex<PairingState>,
    qr_refresh: AsyncMutex<()>,
    persist_lock: AsyncMutex<()>,
    next_epoch: AtomicU64,
    /// Epoch with a local logout in flight, 0 if none
    logout_epoch: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

impl SessionSupervisor {
    pub(crate) fn new(ctx: Arc<SupervisorContext>, session: Session) -> Arc<Self> {
        let (state_tx, _) = watch::channel(session.connection_state);
        Arc::new(Self {
            id: session.id.clone(),
            ctx,
            cell: RwLock::new(Cell {
                session,
                epoch: 0,
                deleted: false,
            }),
            publish: Mutex::new(()),
            lifecycle: AsyncMutex::new(None),
            active: RwLock::new(None),
            pairing: Mutex::new(PairingState::default()),
            qr_refresh: AsyncMutex::new(()),
            persist_lock: AsyncMutex::new(()),
            next_epoch: AtomicU64::new(1),
            logout_epoch: AtomicU64::new(0),
            state_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn hub(&self) -> &EventHub {
        &self.ctx.hub
    }

    pub fn state(&self) -> ConnectionState {
        self.cell.read().session.connection_state
    }

    pub fn snapshot(&self) -> Session {
        self.cell.read().session.clone()
    }

    pub fn info(&self) -> SessionInfo {
        self.cell.read().session.info()
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        self.cell.read().session.proxy.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Whether `epoch` is the live connection of a session that still exists
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        let cell = self.cell.read();
        epoch != 0 && cell.epoch == epoch && !cell.deleted
    }

    /// Whether a local logout is running for connection `epoch`
    pub(crate) fn is_logging_out(&self, epoch: u64) -> bool {
        epoch != 0 && self.logout_epoch.load(Ordering::SeqCst) == epoch
    }

    pub(crate) fn has_name(&self, name: &str) -> bool {
        self.cell.read().session.name == name
    }

    fn ensure_present(&self) -> Result<(), SessionError> {
        if self.cell.read().deleted {
            return Err(SessionError::NotFound(self.id.clone()));
        }
        Ok(())
    }

    fn active_client(&self, epoch: u64) -> Option<ActiveConnection> {
        self.active
            .read()
            .as_ref()
            .filter(|active| active.epoch == epoch)
            .cloned()
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    /// Apply a transition and publish it. Returns true if the record changed.
    ///
    /// With `epoch` set, the transition only applies while that connection is
    /// current. Transitions the state machine forbids are dropped.
    fn transition(&self, epoch: Option<u64>, to: ConnectionState, detail: Option<String>) -> bool {
        let _order = self.publish.lock();
        let event = {
            let mut cell = self.cell.write();
            if cell.deleted || epoch.is_some_and(|e| e != cell.epoch) {
                return false;
            }

            let from = cell.session.connection_state;
            if from == to {
                if to == ConnectionState::Error && detail.is_some() {
                    cell.session.connection_error = detail;
                    cell.session.updated_at = Utc::now();
                    return true;
                }
                return false;
            }
            if !from.can_transition_to(to) {
                debug!(target: "supervisor", session_id = %self.id, %from, %to, "transition not allowed");
                return false;
            }

            let now = Utc::now();
            cell.session.connection_state = to;
            match to {
                ConnectionState::Error => cell.session.connection_error = detail.clone(),
                ConnectionState::Connecting | ConnectionState::Connected => {
                    cell.session.connection_error = None
                }
                _ => {}
            }
            cell.session.updated_at = now;

            info!(target: "supervisor", session_id = %self.id, %from, %to, "state transition");
            self.state_tx.send_replace(to);
            NormalizedEvent::connection_state(&self.id, from, to, detail, now)
        };
        self.ctx.hub.publish(&event);
        true
    }

    async fn set_state(
        &self,
        epoch: Option<u64>,
        to: ConnectionState,
        detail: Option<String>,
    ) -> bool {
        let changed = self.transition(epoch, to, detail);
        if changed {
            self.persist().await;
        }
        changed
    }

    /// Write the current record to the store. Failures are logged.
    pub(crate) async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let cell = self.cell.read();
            if cell.deleted {
                return;
            }
            cell.session.clone()
        };
        if let Err(e) = self.ctx.store.update(&snapshot).await {
            warn!(target: "supervisor", session_id = %self.id, error = %e, "failed to persist session");
        }
    }

    /// Record an operational failure without changing state.
    async fn record_error(&self, err: &SessionError) {
        {
            let mut cell = self.cell.write();
            cell.session.connection_error = Some(err.to_string());
            cell.session.updated_at = Utc::now();
        }
        self.persist().await;
    }

    fn begin_epoch(&self) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        self.cell.write().epoch = epoch;
        self.pairing.lock().reset(epoch);
        epoch
    }

    fn invalidate(&self, epoch: u64) {
        {
            let mut cell = self.cell.write();
            if cell.epoch == epoch {
                cell.epoch = 0;
            }
        }
        {
            let mut active = self.active.write();
            if active.as_ref().is_some_and(|a| a.epoch == epoch) {
                *active = None;
            }
        }
        self.pairing.lock().clear(epoch);
    }

    /// Mark the session failed before the connection is torn down (on a
    /// persistence hiccup the in-memory state still flips).
    async fn fail_epoch(&self, epoch: u64, err: &SessionError) {
        warn!(target: "supervisor", session_id = %self.id, epoch, error = %err, "connection failed");
        self.set_state(Some(epoch), ConnectionState::Error, Some(err.to_string()))
            .await;
    }

    /// Release a handle: cancel the bridge, optionally close the client, and
    /// wait for the bridge to finish.
    async fn teardown(&self, handle: ConnectionHandle, disconnect: bool) {
        let epoch = handle.epoch;
        self.invalidate(epoch);
        handle.cancel.cancel();

        if disconnect {
            if let Err(e) = handle.client.disconnect().await {
                warn!(target: "supervisor", session_id = %self.id, epoch, error = %e, "protocol disconnect failed");
            }
        }
        if let Err(e) = handle.bridge.await {
            if e.is_panic() {
                warn!(target: "supervisor", session_id = %self.id, epoch, "bridge task panicked");
            }
        }
        debug!(target: "supervisor", session_id = %self.id, epoch, "connection handle released");
    }

    async fn teardown_epoch(&self, epoch: u64) {
        let mut slot = self.lifecycle.lock().await;
        if slot.as_ref().is_some_and(|h| h.epoch == epoch) {
            if let Some(handle) = slot.take() {
                self.teardown(handle, true).await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------------

    pub async fn connect(self: &Arc<Self>) -> Result<ConnectOutcome, SessionError> {
        let mut slot = self.lifecycle.lock().await;
        self.ensure_present()?;

        let state = self.state();
        if slot.is_some() && state.is_active() {
            debug!(target: "supervisor", session_id = %self.id, %state, "connect ignored, connection in progress");
            return Ok(ConnectOutcome::AlreadyInProgress);
        }
        if let Some(stale) = slot.take() {
            self.teardown(stale, true).await;
        }

        let state = self.state();
        if !state.can_transition_to(ConnectionState::Connecting) {
            return Err(SessionError::InvalidState {
                operation: "connect",
                state,
            });
        }

        let epoch = self.begin_epoch();
        self.set_state(Some(epoch), ConnectionState::Connecting, None)
            .await;

        let options = {
            let cell = self.cell.read();
            ClientOptions {
                session_id: self.id.clone(),
                device_identity: cell.session.device_identity.clone(),
                proxy: cell.session.proxy.clone(),
            }
        };
        let paired = options.device_identity.is_some();

        let client = match self.ctx.factory.create(options).await {
            Ok(client) => client,
            Err(e) => {
                let err = SessionError::Protocol(e.to_string());
                self.fail_epoch(epoch, &err).await;
                self.invalidate(epoch);
                return Err(err);
            }
        };

        let (sink, stream) = event_channel();
        let cancel = CancellationToken::new();
        let bridge = tokio::spawn(bridge::run(
            Arc::clone(self),
            epoch,
            stream,
            cancel.clone(),
        ));
        *self.active.write() = Some(ActiveConnection {
            epoch,
            client: Arc::clone(&client),
            cancel: cancel.clone(),
        });
        *slot = Some(ConnectionHandle {
            epoch,
            client: Arc::clone(&client),
            cancel: cancel.clone(),
            bridge,
        });
        drop(slot);

        info!(target: "supervisor", session_id = %self.id, epoch, paired, "connecting");

        // Runs unlocked; disconnect and delete abort it through the token
        let timeout = self.ctx.settings.connect_timeout;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "supervisor", session_id = %self.id, epoch, "connect abandoned, connection released");
                return Ok(ConnectOutcome::Started);
            }
            result = tokio::time::timeout(timeout, client.connect(sink)) => result,
        };
        let err = match result {
            Ok(Ok(())) => return Ok(ConnectOutcome::Started),
            Ok(Err(e)) => SessionError::Protocol(e.to_string()),
            Err(_) => SessionError::Timeout(format!(
                "connect did not complete within {}s",
                timeout.as_secs_f64()
            )),
        };

        if self.is_current(epoch) {
            self.fail_epoch(epoch, &err).await;
            self.teardown_epoch(epoch).await;
        }
        Err(err)
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let mut slot = self.lifecycle.lock().await;
        self.ensure_present()?;

        let Some(handle) = slot.take() else {
            return Err(SessionError::InvalidState {
                operation: "disconnect",
                state: self.state(),
            });
        };
        self.set_state(Some(handle.epoch), ConnectionState::Disconnected, None)
            .await;
        self.teardown(handle, true).await;

        info!(target: "supervisor", session_id = %self.id, "session disconnected");
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), SessionError> {
        let mut slot = self.lifecycle.lock().await;
        self.ensure_present()?;

        let state = self.state();
        let (epoch, client) = match slot.as_ref() {
            Some(handle) if state == ConnectionState::Connected => {
                (handle.epoch, Arc::clone(&handle.client))
            }
            _ => {
                return Err(SessionError::InvalidState {
                    operation: "logout",
                    state,
                })
            }
        };

        // The server confirms a logout on the event stream; the bridge must
        // not treat that confirmation as a remote unlink.
        self.logout_epoch.store(epoch, Ordering::SeqCst);
        let result = client.logout().await;
        if let Err(e) = result {
            self.logout_epoch.store(0, Ordering::SeqCst);
            let err = SessionError::Protocol(e.to_string());
            warn!(target: "supervisor", session_id = %self.id, error = %err, "logout failed");
            self.record_error(&err).await;
            return Err(err);
        }

        if let Some(handle) = slot.take() {
            {
                let mut cell = self.cell.write();
                cell.session.device_identity = None;
            }
            self.set_state(Some(handle.epoch), ConnectionState::LoggedOut, None)
                .await;
            self.teardown(handle, false).await;
        }
        self.logout_epoch.store(0, Ordering::SeqCst);

        info!(target: "supervisor", session_id = %self.id, "session logged out");
        Ok(())
    }

    /// Tear down any live connection, then remove the persisted record.
    ///
    /// A failing protocol disconnect does not stop the deletion. After this
    /// returns every operation on the supervisor fails with `NotFound`.
    pub(crate) async fn delete(&self) -> Result<(), SessionError> {
        let mut slot = self.lifecycle.lock().await;
        self.ensure_present()?;

        if let Some(handle) = slot.take() {
            self.set_state(Some(handle.epoch), ConnectionState::Disconnected, None)
                .await;
            self.teardown(handle, true).await;
        }

        let _guard = self.persist_lock.lock().await;
        self.cell.write().deleted = true;
        self.ctx.store.delete(&self.id).await?;

        info!(target: "supervisor", session_id = %self.id, "session deleted");
        Ok(())
    }

    /// Close a live connection at process shutdown. The device identity is
    /// kept so the session reconnects on the next start.
    pub(crate) async fn shutdown(&self) {
        let mut slot = self.lifecycle.lock().await;
        if let Some(handle) = slot.take() {
            self.set_state(Some(handle.epoch), ConnectionState::Disconnected, None)
                .await;
            self.teardown(handle, true).await;
        }
    }

    /// Mark a record loaded as live from the store as `Disconnected`.
    pub(crate) async fn mark_stale(&self) {
        self.set_state(None, ConnectionState::Disconnected, None)
            .await;
    }

    pub async fn set_proxy(&self, proxy: Option<ProxyConfig>) -> Result<(), SessionError> {
        if let Some(proxy) = &proxy {
            proxy.validate()?;
        }
        let live = {
            let mut cell = self.cell.write();
            if cell.deleted {
                return Err(SessionError::NotFound(self.id.clone()));
            }
            cell.session.proxy = proxy;
            cell.session.updated_at = Utc::now();
            cell.session.connection_state.is_active()
        };
        if live {
            info!(target: "supervisor", session_id = %self.id, "proxy updated, applies on next connect");
        }
        self.persist().await;
        Ok(())
    }

    pub async fn send_text(&self, to: &str, text: &str) -> Result<String, SessionError> {
        self.ensure_present()?;
        let state = self.state();
        let active = self.active.read().clone();
        let client = match active {
            Some(active) if state == ConnectionState::Connected => active.client,
            _ => {
                return Err(SessionError::InvalidState {
                    operation: "send message",
                    state,
                })
            }
        };
        client
            .send_text(&normalize_jid(to), text)
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))
    }

    // ------------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------------

    pub async fn pair_phone(&self, phone: &str) -> Result<PairingCode, SessionError> {
        let phone = normalize_phone(phone)?;
        let (epoch, client) = {
            let slot = self.lifecycle.lock().await;
            self.ensure_present()?;

            let state = self.state();
            let handle = match slot.as_ref() {
                Some(handle)
                    if matches!(state, ConnectionState::Connecting | ConnectionState::QrWait) =>
                {
                    handle
                }
                _ => {
                    return Err(SessionError::InvalidState {
                        operation: "pair by phone",
                        state,
                    })
                }
            };
            if self.cell.read().session.is_paired() {
                return Err(SessionError::InvalidState {
                    operation: "pair by phone",
                    state,
                });
            }
            (handle.epoch, Arc::clone(&handle.client))
        };

        if let Some(existing) = self.pairing.lock().phone_code(epoch) {
            if existing.expires_at > Utc::now() {
                return Ok(existing.clone());
            }
        }

        let code = match client.pair_phone(&phone).await {
            Ok(code) => code,
            Err(e) => {
                let err = SessionError::PairingFailed(e.to_string());
                warn!(target: "supervisor", session_id = %self.id, error = %err, "phone pairing rejected");
                if self.is_current(epoch) {
                    self.record_error(&err).await;
                }
                return Err(err);
            }
        };

        let ttl = if code.timeout.is_zero() {
            self.ctx.settings.pair_code_timeout
        } else {
            code.timeout
        };
        let pairing = PairingCode {
            code: code.code,
            expires_at: Utc::now() + qr::to_chrono(ttl),
        };
        if !self.pairing.lock().switch_to_phone(epoch, pairing.clone()) {
            return Err(SessionError::PairingFailed(
                "connection changed during pairing".into(),
            ));
        }
        self.set_state(Some(epoch), ConnectionState::QrWait, None)
            .await;

        info!(target: "supervisor", session_id = %self.id, "phone pairing code issued");
        Ok(pairing)
    }

    /// Current QR code. An expired code is replaced before returning.
    pub async fn get_qr_code(self: &Arc<Self>) -> Result<QrArtifact, SessionError> {
        self.ensure_present()?;
        let no_qr = || SessionError::NoQrAvailable(self.id.clone());

        if self.state() != ConnectionState::QrWait {
            return Err(no_qr());
        }
        let epoch = self.cell.read().epoch;
        let lookup = self.pairing.lock().lookup(epoch, Utc::now());
        match lookup {
            QrLookup::Valid(artifact) => Ok(artifact),
            QrLookup::Expired => self.refresh_qr(epoch).await,
            QrLookup::Unavailable => Err(no_qr()),
        }
    }

    async fn refresh_qr(self: &Arc<Self>, epoch: u64) -> Result<QrArtifact, SessionError> {
        let _guard = self.qr_refresh.lock().await;
        let no_qr = || SessionError::NoQrAvailable(self.id.clone());

        // Another caller may have refreshed while we waited
        let lookup = self.pairing.lock().lookup(epoch, Utc::now());
        match lookup {
            QrLookup::Valid(artifact) => return Ok(artifact),
            QrLookup::Unavailable => return Err(no_qr()),
            QrLookup::Expired => {}
        }
        if !self.is_current(epoch) || self.state() != ConnectionState::QrWait {
            return Err(no_qr());
        }

        let max = self.ctx.settings.qr_max_refreshes;
        let exhausted = self.pairing.lock().refreshes_exhausted(max);
        if exhausted {
            let err = SessionError::Timeout(format!("QR code not scanned after {max} refreshes"));
            self.fail_connection(epoch, err.clone(), false).await;
            return Err(err);
        }

        let active = self.active_client(epoch).ok_or_else(no_qr)?;
        let fresh = active
            .client
            .refresh_qr()
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        match self.store_qr(epoch, fresh.code, fresh.timeout).await {
            Some(artifact) => Ok(artifact),
            None => Err(no_qr()),
        }
    }

    /// Store a QR code for `epoch`, enter `QrWait` and announce it.
    async fn store_qr(
        self: &Arc<Self>,
        epoch: u64,
        code: String,
        timeout: Duration,
    ) -> Option<QrArtifact> {
        let ttl = if timeout.is_zero() {
            self.ctx.settings.qr_timeout
        } else {
            timeout
        };
        let max = self.ctx.settings.qr_max_refreshes;
        let accepted = self
            .pairing
            .lock()
            .accept_qr(epoch, code, ttl, max, Utc::now());

        match accepted {
            QrAccept::Ignored => None,
            QrAccept::Exhausted => {
                let err =
                    SessionError::Timeout(format!("QR code not scanned after {max} refreshes"));
                self.fail_connection(epoch, err, false).await;
                None
            }
            QrAccept::Stored {
                artifact,
                start_refresher,
            } => {
                self.set_state(Some(epoch), ConnectionState::QrWait, None)
                    .await;
                if !self.is_current(epoch) {
                    return None;
                }
                self.ctx.hub.publish(&NormalizedEvent::qr_update(
                    &self.id,
                    &artifact.code,
                    artifact.expires_at,
                ));
                debug!(target: "supervisor", session_id = %self.id, expires_at = %artifact.expires_at, "QR code stored");

                if start_refresher {
                    if let Some(active) = self.active_client(epoch) {
                        tokio::spawn(Arc::clone(self).run_qr_refresher(epoch, active.cancel));
                    }
                }
                Some(artifact)
            }
        }
    }

    /// Replace each QR code as it expires until pairing ends one way or another.
    ///
    /// Boxed because refreshing stores the new code, which may start a refresher.
    fn run_qr_refresher(
        self: Arc<Self>,
        epoch: u64,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                let Some(expires_at) = self.pairing.lock().qr_expiry(epoch) else {
                    break;
                };
                let wait = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if !self.is_current(epoch) || self.state() != ConnectionState::QrWait {
                    break;
                }
                match self.refresh_qr(epoch).await {
                    Ok(_) => {}
                    Err(SessionError::NoQrAvailable(_)) | Err(SessionError::Timeout(_)) => break,
                    Err(e) => {
                        self.fail_connection(epoch, e, false).await;
                        break;
                    }
                }
            }
            debug!(target: "supervisor", session_id = %self.id, epoch, "QR refresher stopped");
        })
    }

    // ------------------------------------------------------------------------
    // Bridge callbacks
    // ------------------------------------------------------------------------

    pub(crate) async fn on_qr_code(self: &Arc<Self>, epoch: u64, code: String, timeout: Duration) {
        if self.store_qr(epoch, code, timeout).await.is_none() {
            debug!(target: "supervisor", session_id = %self.id, epoch, "QR code ignored");
        }
    }

    pub(crate) async fn on_connected(&self, epoch: u64) {
        if matches!(
            self.state(),
            ConnectionState::QrWait | ConnectionState::Disconnected
        ) {
            self.transition(Some(epoch), ConnectionState::Connecting, None);
        }
        if self.set_state(Some(epoch), ConnectionState::Connected, None).await {
            self.pairing.lock().clear(epoch);
        }
    }

    /// Transport dropped; the client may reconnect on its own, so the handle stays.
    pub(crate) async fn on_transport_lost(&self, epoch: u64, reason: Option<String>) {
        info!(
            target: "supervisor",
            session_id = %self.id,
            reason = reason.as_deref().unwrap_or("unknown"),
            "transport lost"
        );
        self.set_state(Some(epoch), ConnectionState::Disconnected, reason)
            .await;
    }

    pub(crate) async fn on_pair_success(
        &self,
        epoch: u64,
        identity: DeviceIdentity,
        jid: &str,
        business_name: &str,
        platform: &str,
    ) {
        {
            let mut cell = self.cell.write();
            if cell.epoch != epoch || cell.deleted {
                return;
            }
            cell.session.device_identity = Some(identity);
            cell.session.updated_at = Utc::now();
        }
        self.pairing.lock().clear(epoch);
        info!(target: "supervisor", session_id = %self.id, jid, platform, "pairing succeeded");

        self.transition(Some(epoch), ConnectionState::Connecting, None);
        self.persist().await;
        self.ctx.hub.publish(&NormalizedEvent::pairing_success(
            &self.id,
            jid,
            business_name,
            platform,
        ));
    }

    /// Move to `Error` and release the handle from a separate task.
    pub(crate) async fn fail_connection(
        self: &Arc<Self>,
        epoch: u64,
        err: SessionError,
        clear_identity: bool,
    ) {
        if clear_identity {
            let mut cell = self.cell.write();
            if cell.epoch == epoch {
                cell.session.device_identity = None;
            }
        }
        self.fail_epoch(epoch, &err).await;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.teardown_epoch(epoch).await });
    }
}
