//! In-process loopback protocol client.
//!
//! `LoopbackFactory` builds clients that never touch the network. A paired
//! client reports `Connected` right after `connect`; an unpaired one starts a
//! QR flow. Tests and demos drive the rest of the lifecycle by injecting raw
//! events through [`LoopbackClient::emit`] and friends.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    ClientFactory, ClientOptions, EventSink, PairCode, ProtocolClient, ProtocolError, QrCode,
    RawEvent,
};
use crate::sessions::{DeviceIdentity, ProxyConfig};

/// Default lifetime of a loopback QR code
const DEFAULT_QR_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `logout` lingers after reporting `LoggedOut`
const LOGOUT_EVENT_GRACE: Duration = Duration::from_millis(50);

/// Knobs controlling how loopback clients behave
#[derive(Debug, Clone)]
pub struct LoopbackBehavior {
    /// Delay before `connect` returns
    pub connect_delay: Duration,
    /// If set, `connect` fails with this message
    pub connect_error: Option<String>,
    /// If set, `disconnect` fails with this message (after tearing down)
    pub disconnect_error: Option<String>,
    /// Lifetime advertised for generated QR codes
    pub qr_timeout: Duration,
    /// If set, `logout` reports `LoggedOut` on the event stream before returning
    pub logout_event: bool,
}

impl Default for LoopbackBehavior {
    fn default() -> Self {
        Self {
            connect_delay: Duration::ZERO,
            connect_error: None,
            disconnect_error: None,
            qr_timeout: DEFAULT_QR_TIMEOUT,
            logout_event: false,
        }
    }
}

/// A protocol client backed by nothing but channels.
pub struct LoopbackClient {
    session_id: String,
    identity: Option<DeviceIdentity>,
    proxy: Option<ProxyConfig>,
    behavior: LoopbackBehavior,
    sink: Mutex<Option<EventSink>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    logouts: AtomicUsize,
    sent: Mutex<Vec<(String, String)>>,
}

impl LoopbackClient {
    fn new(options: ClientOptions, behavior: LoopbackBehavior) -> Self {
        Self {
            session_id: options.session_id,
            identity: options.device_identity,
            proxy: options.proxy,
            behavior,
            sink: Mutex::new(None),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Proxy the client was built with
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Push a raw event to the subscriber. Returns false when nobody listens.
    pub fn emit(&self, event: RawEvent) -> bool {
        if matches!(event, RawEvent::Connected) {
            self.connected.store(true, Ordering::SeqCst);
        }
        if matches!(event, RawEvent::Disconnected { .. } | RawEvent::LoggedOut { .. }) {
            self.connected.store(false, Ordering::SeqCst);
        }
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate the phone confirming the pairing: `PairSuccess` then `Connected`.
    pub fn complete_pairing(&self, identity: &[u8]) -> bool {
        let paired = self.emit(RawEvent::PairSuccess {
            jid: format!("{}@s.whatsapp.net", &self.session_id[..8.min(self.session_id.len())]),
            business_name: String::new(),
            platform: "loopback".to_string(),
            identity: DeviceIdentity::new(identity.to_vec()),
        });
        paired && self.emit(RawEvent::Connected)
    }

    /// Simulate transport loss.
    pub fn drop_transport(&self, reason: &str) -> bool {
        self.emit(RawEvent::Disconnected {
            reason: Some(reason.to_string()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    /// Messages passed to `send_text`, as `(to, text)`
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    fn new_qr(&self) -> QrCode {
        QrCode {
            code: format!("2@{}", Uuid::new_v4().simple()),
            timeout: self.behavior.qr_timeout,
        }
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.sink.lock().take();
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn connect(&self, events: EventSink) -> Result<(), ProtocolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.connect_delay.is_zero() {
            tokio::time::sleep(self.behavior.connect_delay).await;
        }
        if let Some(err) = &self.behavior.connect_error {
            return Err(ProtocolError::ConnectionError(err.clone()));
        }

        *self.sink.lock() = Some(events);

        if self.identity.as_ref().is_some_and(|i| !i.is_empty()) {
            self.emit(RawEvent::Connected);
        } else {
            let qr = self.new_qr();
            self.emit(RawEvent::QrCode {
                code: qr.code,
                timeout: qr.timeout,
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.close();
        match &self.behavior.disconnect_error {
            Some(err) => Err(ProtocolError::ConnectionError(err.clone())),
            None => Ok(()),
        }
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        self.logouts.fetch_add(1, Ordering::SeqCst);
        if self.behavior.logout_event {
            self.emit(RawEvent::LoggedOut {
                reason: "logout".to_string(),
            });
            // Let the subscriber see the event while the call is still pending
            tokio::time::sleep(LOGOUT_EVENT_GRACE).await;
        }
        self.close();
        Ok(())
    }

    async fn refresh_qr(&self) -> Result<QrCode, ProtocolError> {
        if self.sink.lock().is_none() {
            return Err(ProtocolError::NotConnected);
        }
        Ok(self.new_qr())
    }

    async fn pair_phone(&self, phone: &str) -> Result<PairCode, ProtocolError> {
        if self.sink.lock().is_none() {
            return Err(ProtocolError::NotConnected);
        }
        if phone.chars().filter(char::is_ascii_digit).count() < 7 {
            return Err(ProtocolError::PairingError(format!(
                "phone number rejected: {phone}"
            )));
        }
        let raw = Uuid::new_v4().simple().to_string().to_uppercase();
        Ok(PairCode {
            code: format!("{}-{}", &raw[..4], &raw[4..8]),
            timeout: self.behavior.qr_timeout,
        })
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<String, ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        if text.is_empty() {
            return Err(ProtocolError::SendError("text must not be empty".into()));
        }
        self.sent.lock().push((to.to_string(), text.to_string()));
        Ok(format!("3EB0{}", Uuid::new_v4().simple().to_string().to_uppercase()))
    }
}

/// Factory producing [`LoopbackClient`]s and remembering the latest one per session.
#[derive(Default)]
pub struct LoopbackFactory {
    behavior: RwLock<LoopbackBehavior>,
    clients: RwLock<HashMap<String, Arc<LoopbackClient>>>,
    created: AtomicUsize,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: LoopbackBehavior) -> Self {
        Self {
            behavior: RwLock::new(behavior),
            ..Self::default()
        }
    }

    /// Change behavior for clients created from now on.
    pub fn set_behavior(&self, behavior: LoopbackBehavior) {
        *self.behavior.write() = behavior;
    }

    /// Most recently created client for a session
    pub fn client(&self, session_id: &str) -> Option<Arc<LoopbackClient>> {
        self.clients.read().get(session_id).cloned()
    }

    /// Total number of clients created
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for LoopbackFactory {
    async fn create(
        &self,
        options: ClientOptions,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        let behavior = self.behavior.read().clone();
        let session_id = options.session_id.clone();
        let client = Arc::new(LoopbackClient::new(options, behavior));
        self.clients.write().insert(session_id, client.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event_channel;

    fn options(identity: Option<&[u8]>) -> ClientOptions {
        ClientOptions {
            session_id: "session-1".into(),
            device_identity: identity.map(|i| DeviceIdentity::new(i.to_vec())),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_unpaired_client_emits_qr() {
        let factory = LoopbackFactory::new();
        let client = factory.create(options(None)).await.unwrap();
        let (tx, mut rx) = event_channel();
        client.connect(tx).await.unwrap();

        match rx.recv().await.unwrap() {
            RawEvent::QrCode { code, .. } => assert!(code.starts_with("2@")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paired_client_connects() {
        let factory = LoopbackFactory::new();
        let client = factory.create(options(Some(b"creds"))).await.unwrap();
        let (tx, mut rx) = event_channel();
        client.connect(tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), RawEvent::Connected);
        assert!(factory.client("session-1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_connect_error() {
        let factory = LoopbackFactory::with_behavior(LoopbackBehavior {
            connect_error: Some("refused".into()),
            ..Default::default()
        });
        let client = factory.create(options(None)).await.unwrap();
        let (tx, _rx) = event_channel();
        assert_eq!(
            client.connect(tx).await,
            Err(ProtocolError::ConnectionError("refused".into()))
        );
    }

    #[tokio::test]
    async fn test_refresh_qr_yields_new_code() {
        let factory = LoopbackFactory::new();
        let client = factory.create(options(None)).await.unwrap();
        let (tx, _rx) = event_channel();
        client.connect(tx).await.unwrap();

        let a = client.refresh_qr().await.unwrap();
        let b = client.refresh_qr().await.unwrap();
        assert_ne!(a.code, b.code);
    }

    #[tokio::test]
    async fn test_disconnect_closes_sink() {
        let factory = LoopbackFactory::new();
        let client = factory.create(options(Some(b"creds"))).await.unwrap();
        let (tx, _rx) = event_channel();
        client.connect(tx).await.unwrap();
        client.disconnect().await.unwrap();

        let loopback = factory.client("session-1").unwrap();
        assert_eq!(loopback.disconnect_count(), 1);
        assert!(!loopback.emit(RawEvent::Connected));
    }

    #[tokio::test]
    async fn test_pair_phone_code_format() {
        let factory = LoopbackFactory::new();
        let client = factory.create(options(None)).await.unwrap();
        let (tx, _rx) = event_channel();
        client.connect(tx).await.unwrap();

        let code = client.pair_phone("+15551234567").await.unwrap();
        assert_eq!(code.code.len(), 9);
        assert_eq!(&code.code[4..5], "-");
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let factory = LoopbackFactory::new();
        let client = factory.create(options(None)).await.unwrap();
        assert_eq!(
            client.send_text("123", "hi").await,
            Err(ProtocolError::NotConnected)
        );
    }
}
