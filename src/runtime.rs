//! Process wiring.
//!
//! [`Runtime`] builds the session registry, the event hub and the webhook
//! dispatcher from a [`Config`] and a set of ports, then starts the
//! background work. [`RuntimeHandle`] gives access to the running pieces and
//! shuts them down in order.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::{EventHub, SubscriptionId};
use crate::config::{Config, ConfigError};
use crate::protocol::ClientFactory;
use crate::reconnect::{reconnect_paired_sessions, ReconnectReport};
use crate::registry::SessionRegistry;
use crate::sessions::{FileSessionStore, SessionError, SessionStore, StoreError};
use crate::webhooks::{
    DeliveryError, DispatchError, Dispatcher, HttpTransport, InMemoryWebhookConfigStore,
    WebhookConfigStore, WebhookStoreError, WebhookTransport,
};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to load sessions: {0}")]
    Session(#[from] SessionError),
    #[error("webhook config error: {0}")]
    WebhookStore(#[from] WebhookStoreError),
    #[error("failed to build webhook transport: {0}")]
    Transport(#[from] DeliveryError),
    #[error("failed to start dispatcher: {0}")]
    Dispatch(#[from] DispatchError),
}

/// External collaborators the runtime is built on
pub struct RuntimePorts {
    pub sessions: Arc<dyn SessionStore>,
    pub webhooks: Arc<dyn WebhookConfigStore>,
    pub factory: Arc<dyn ClientFactory>,
    /// HTTP transport built from the config when `None`
    pub transport: Option<Arc<dyn WebhookTransport>>,
}

impl RuntimePorts {
    /// File-backed session store in the configured state directory and
    /// webhook endpoints from `webhooks.file`, if set.
    pub fn from_config(
        config: &Config,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self, StartupError> {
        let sessions = FileSessionStore::open(config.sessions.resolve_state_dir())?;
        let webhooks = match config.webhooks.file.as_deref() {
            Some(path) => InMemoryWebhookConfigStore::load_from_file(path)?,
            None => InMemoryWebhookConfigStore::new(),
        };
        Ok(Self {
            sessions: Arc::new(sessions),
            webhooks: Arc::new(webhooks),
            factory,
            transport: None,
        })
    }
}

pub struct Runtime {
    config: Config,
    ports: RuntimePorts,
}

impl Runtime {
    pub fn new(config: Config, ports: RuntimePorts) -> Self {
        Self { config, ports }
    }

    /// Load sessions, start the dispatcher and kick off startup reconnects.
    pub async fn start(self) -> Result<RuntimeHandle, StartupError> {
        let Runtime { config, ports } = self;
        config.validate()?;

        let hub = Arc::new(EventHub::new());
        let registry = Arc::new(SessionRegistry::new(
            ports.sessions,
            ports.factory,
            hub.clone(),
            config.sessions.supervisor_settings(),
        ));
        registry.hydrate().await?;

        let transport = match ports.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.webhooks.request_timeout())?),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            config.webhooks.dispatch_settings(),
            ports.webhooks,
            transport,
        ));
        dispatcher.start()?;
        let subscription = hub.subscribe(dispatcher.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconnect = tokio::spawn(reconnect_paired_sessions(
            registry.clone(),
            config.reconnect.settings(),
            shutdown_rx,
        ));

        info!(
            target: "supervisor",
            sessions = registry.list_sessions().len(),
            "runtime started"
        );

        Ok(RuntimeHandle {
            registry,
            dispatcher,
            hub,
            subscription,
            shutdown_tx,
            reconnect,
        })
    }
}

/// Handle to a running runtime. Returned by [`Runtime::start`].
pub struct RuntimeHandle {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    hub: Arc<EventHub>,
    subscription: SubscriptionId,
    shutdown_tx: watch::Sender<bool>,
    reconnect: JoinHandle<ReconnectReport>,
}

impl RuntimeHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Stop reconnects, close every connection (credentials are kept), then
    /// drain the dispatcher.
    pub async fn shutdown(self) -> Option<ReconnectReport> {
        let _ = self.shutdown_tx.send(true);

        let report = match self.reconnect.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(target: "reconnect", error = %e, "reconnect task failed");
                None
            }
        };

        self.registry.shutdown().await;
        self.hub.unsubscribe(self.subscription);

        if !self.dispatcher.stop().await {
            warn!(target: "dispatch", "dispatcher stopped with work outstanding");
        }
        info!(target: "supervisor", "runtime stopped");
        report
    }
}
