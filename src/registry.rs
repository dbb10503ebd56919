//! Session registry
//!
//! The single entry point for session operations. Maps session ids to their
//! [`SessionSupervisor`]s and delegates lifecycle calls to them; the
//! supervisor's own lock provides the per-session exclusion.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::bridge::EventHub;
use crate::protocol::ClientFactory;
use crate::sessions::{
    validate_name, ConnectOutcome, ConnectionState, ProxyConfig, Session, SessionError,
    SessionInfo, SessionStore,
};
use crate::supervisor::{
    PairingCode, QrArtifact, SessionSupervisor, SupervisorContext, SupervisorSettings,
};

pub struct SessionRegistry {
    ctx: Arc<SupervisorContext>,
    supervisors: RwLock<HashMap<String, Arc<SessionSupervisor>>>,
    /// Serializes the name check with the insert
    create_lock: AsyncMutex<()>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn ClientFactory>,
        hub: Arc<EventHub>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(SupervisorContext {
                store,
                factory,
                hub,
                settings,
            }),
            supervisors: RwLock::new(HashMap::new()),
            create_lock: AsyncMutex::new(()),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.ctx.hub
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.ctx.store
    }

    /// Load persisted sessions. Sessions recorded as live are marked
    /// `Disconnected`, since no connection survives a restart.
    pub async fn hydrate(&self) -> Result<usize, SessionError> {
        let sessions = self.ctx.store.list().await?;
        let count = sessions.len();

        for session in sessions {
            let was_live = session.connection_state.is_active();
            let supervisor = SessionSupervisor::new(Arc::clone(&self.ctx), session);
            if was_live {
                supervisor.mark_stale().await;
            }
            self.supervisors
                .write()
                .insert(supervisor.id().to_string(), supervisor);
        }

        info!(target: "supervisor", count, "sessions loaded");
        Ok(count)
    }

    fn supervisor(&self, id: &str) -> Result<Arc<SessionSupervisor>, SessionError> {
        self.supervisors
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn create_session(
        &self,
        name: &str,
        proxy: Option<ProxyConfig>,
    ) -> Result<SessionInfo, SessionError> {
        validate_name(name)?;
        if let Some(proxy) = &proxy {
            proxy.validate()?;
        }
        let name = name.trim();

        let _guard = self.create_lock.lock().await;
        let taken = self
            .supervisors
            .read()
            .values()
            .any(|s| s.has_name(name));
        if taken || self.ctx.store.get_by_name(name).await?.is_some() {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }

        let session = Session::new(name, proxy);
        self.ctx.store.create(&session).await?;

        let info = session.info();
        let supervisor = SessionSupervisor::new(Arc::clone(&self.ctx), session);
        self.supervisors
            .write()
            .insert(info.id.clone(), supervisor);

        info!(target: "supervisor", session_id = %info.id, name = %info.name, "session created");
        Ok(info)
    }

    pub async fn connect(&self, id: &str) -> Result<ConnectOutcome, SessionError> {
        self.supervisor(id)?.connect().await
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), SessionError> {
        self.supervisor(id)?.disconnect().await
    }

    pub async fn logout(&self, id: &str) -> Result<(), SessionError> {
        self.supervisor(id)?.logout().await
    }

    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let supervisor = self.supervisor(id)?;
        let result = supervisor.delete().await;

        if matches!(result, Err(SessionError::NotFound(_))) {
            return result;
        }

        // The in-memory entry goes even if the store refused the delete
        {
            let mut supervisors = self.supervisors.write();
            if supervisors
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, &supervisor))
            {
                supervisors.remove(id);
            }
        }
        if let Err(e) = &result {
            warn!(target: "supervisor", session_id = %id, error = %e, "persisted record not removed");
        }
        result
    }

    pub async fn get_qr_code(&self, id: &str) -> Result<QrArtifact, SessionError> {
        self.supervisor(id)?.get_qr_code().await
    }

    pub async fn pair_phone(&self, id: &str, phone: &str) -> Result<PairingCode, SessionError> {
        self.supervisor(id)?.pair_phone(phone).await
    }

    pub fn get_session_info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        Ok(self.supervisor(id)?.info())
    }

    pub async fn set_proxy(&self, id: &str, proxy: Option<ProxyConfig>) -> Result<(), SessionError> {
        self.supervisor(id)?.set_proxy(proxy).await
    }

    pub fn get_proxy(&self, id: &str) -> Result<Option<ProxyConfig>, SessionError> {
        Ok(self.supervisor(id)?.proxy())
    }

    /// All sessions, oldest first
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.supervisors.read().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub async fn send_text(&self, id: &str, to: &str, text: &str) -> Result<String, SessionError> {
        self.supervisor(id)?.send_text(to, text).await
    }

    pub fn subscribe_state(&self, id: &str) -> Result<watch::Receiver<ConnectionState>, SessionError> {
        Ok(self.supervisor(id)?.subscribe_state())
    }

    /// Close every live connection, keeping credentials for the next start.
    pub async fn shutdown(&self) {
        let supervisors: Vec<_> = self.supervisors.read().values().cloned().collect();
        for supervisor in supervisors {
            supervisor.shutdown().await;
        }
        info!(target: "supervisor", "all sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::loopback::LoopbackFactory;
    use crate::sessions::{DeviceIdentity, InMemorySessionStore, ProxyKind};

    fn registry_with(store: Arc<InMemorySessionStore>) -> (SessionRegistry, Arc<LoopbackFactory>) {
        let factory = Arc::new(LoopbackFactory::new());
        let registry = SessionRegistry::new(
            store,
            factory.clone(),
            Arc::new(EventHub::new()),
            SupervisorSettings::default(),
        );
        (registry, factory)
    }

    fn registry() -> (SessionRegistry, Arc<LoopbackFactory>) {
        registry_with(Arc::new(InMemorySessionStore::new()))
    }

    #[tokio::test]
    async fn test_create_session() {
        let (registry, factory) = registry();
        let info = registry.create_session("sales-bot", None).await.unwrap();
        assert_eq!(info.state, ConnectionState::Created);
        assert!(!info.has_device_identity);
        assert_eq!(registry.list_sessions().len(), 1);
        // Creating does not connect
        assert_eq!(factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let (registry, _) = registry();
        registry.create_session("sales-bot", None).await.unwrap();
        assert_eq!(
            registry.create_session("sales-bot", None).await.unwrap_err(),
            SessionError::AlreadyExists("sales-bot".into())
        );
        // Surrounding whitespace does not make a new name
        assert_eq!(
            registry.create_session("  sales-bot ", None).await.unwrap_err(),
            SessionError::AlreadyExists("sales-bot".into())
        );
        assert!(registry.create_session("sales-bot-2", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.create_session("", None).await,
            Err(SessionError::InvalidInput(_))
        ));
        let bad_proxy = ProxyConfig {
            kind: ProxyKind::Socks5,
            host: String::new(),
            port: 1080,
            username: None,
            password: None,
        };
        assert!(matches!(
            registry.create_session("bot", Some(bad_proxy)).await,
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.connect("missing").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.get_session_info("missing"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete("missing").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_proxy_roundtrip_applies_on_next_connect() {
        let (registry, factory) = registry();
        let info = registry.create_session("bot", None).await.unwrap();
        assert_eq!(registry.get_proxy(&info.id).unwrap(), None);

        let proxy = ProxyConfig::parse("socks5://10.0.0.1:1080").unwrap();
        registry
            .set_proxy(&info.id, Some(proxy.clone()))
            .await
            .unwrap();
        assert_eq!(registry.get_proxy(&info.id).unwrap(), Some(proxy.clone()));

        registry.connect(&info.id).await.unwrap();
        let client = factory.client(&info.id).unwrap();
        assert_eq!(client.proxy(), Some(&proxy));
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let (registry, _) = registry();
        let info = registry.create_session("bot", None).await.unwrap();
        registry.delete(&info.id).await.unwrap();
        assert!(registry.list_sessions().is_empty());
        assert!(matches!(
            registry.connect(&info.id).await,
            Err(SessionError::NotFound(_))
        ));
        // The name is free again
        registry.create_session("bot", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_hydrate_resets_live_states() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut live = Session::new("live", None);
        live.connection_state = ConnectionState::Connected;
        live.device_identity = Some(DeviceIdentity::new(b"creds".to_vec()));
        store.create(&live).await.unwrap();
        let mut failed = Session::new("failed", None);
        failed.connection_state = ConnectionState::Error;
        store.create(&failed).await.unwrap();

        let (registry, _) = registry_with(store.clone());
        assert_eq!(registry.hydrate().await.unwrap(), 2);

        let info = registry.get_session_info(&live.id).unwrap();
        assert_eq!(info.state, ConnectionState::Disconnected);
        assert!(info.has_device_identity);
        assert_eq!(
            store.get(&live.id).await.unwrap().unwrap().connection_state,
            ConnectionState::Disconnected
        );
        assert_eq!(
            registry.get_session_info(&failed.id).unwrap().state,
            ConnectionState::Error
        );
    }
}
