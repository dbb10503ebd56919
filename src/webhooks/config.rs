//! Webhook endpoint configuration and its read-only port.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use url::Url;

use crate::bridge::EventKind;

/// One webhook endpoint attached to a session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: String,
    pub session_id: String,
    pub url: String,
    /// HMAC key; an empty secret sends unsigned requests
    #[serde(default)]
    pub secret: String,
    /// Event kinds to deliver; empty means all
    #[serde(default)]
    pub events: Vec<EventKind>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("url", &self.url)
            .field("secret", &if self.secret.is_empty() { "" } else { "***" })
            .field("events", &self.events)
            .field("active", &self.active)
            .finish()
    }
}

impl WebhookConfig {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            url: url.into(),
            secret: String::new(),
            events: Vec::new(),
            active: true,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = EventKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    /// Whether events of `kind` pass this endpoint's filter
    pub fn accepts(&self, kind: EventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }

    pub fn validate(&self) -> Result<(), WebhookStoreError> {
        if self.id.trim().is_empty() {
            return Err(WebhookStoreError::Invalid("webhook id required".into()));
        }
        let url = Url::parse(&self.url)
            .map_err(|e| WebhookStoreError::Invalid(format!("{}: {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookStoreError::Invalid(format!(
                "webhook url must be http(s): {}",
                self.url
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookStoreError {
    #[error("invalid webhook config: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Read access to webhook configs for the dispatcher.
#[async_trait]
pub trait WebhookConfigStore: Send + Sync {
    /// Active configs attached to `session_id`
    async fn active_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<WebhookConfig>, WebhookStoreError>;
}

/// Config store held in memory, optionally seeded from a JSON5 file.
#[derive(Debug, Default)]
pub struct InMemoryWebhookConfigStore {
    configs: RwLock<Vec<WebhookConfig>>,
}

impl InMemoryWebhookConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an array of configs from a JSON/JSON5 file.
    pub fn load_from_file(path: &Path) -> Result<Self, WebhookStoreError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| WebhookStoreError::Io(e.to_string()))?;
        let configs: Vec<WebhookConfig> =
            json5::from_str(&content).map_err(|e| WebhookStoreError::Parse(e.to_string()))?;

        let store = Self::new();
        for config in configs {
            store.upsert(config)?;
        }
        info!(target: "dispatch", path = %path.display(), count = store.len(), "webhook configs loaded");
        Ok(store)
    }

    /// Insert or replace a config by id.
    pub fn upsert(&self, config: WebhookConfig) -> Result<(), WebhookStoreError> {
        config.validate()?;
        let mut configs = self.configs.write();
        match configs.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config,
            None => configs.push(config),
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut configs = self.configs.write();
        let before = configs.len();
        configs.retain(|c| c.id != id);
        configs.len() != before
    }

    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.read().is_empty()
    }
}

#[async_trait]
impl WebhookConfigStore for InMemoryWebhookConfigStore {
    async fn active_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<WebhookConfig>, WebhookStoreError> {
        Ok(self
            .configs
            .read()
            .iter()
            .filter(|c| c.active && c.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_filter_accepts_everything() {
        let config = WebhookConfig::new("w1", "s1", "http://localhost/hook");
        for kind in EventKind::ALL {
            assert!(config.accepts(kind));
        }
    }

    #[test]
    fn test_filter() {
        let config = WebhookConfig::new("w1", "s1", "http://localhost/hook")
            .with_events([EventKind::Message, EventKind::ConnectionState]);
        assert!(config.accepts(EventKind::Message));
        assert!(!config.accepts(EventKind::QrUpdate));
    }

    #[test]
    fn test_validate_rejects_non_http() {
        let config = WebhookConfig::new("w1", "s1", "ftp://localhost/hook");
        assert!(config.validate().is_err());
        let config = WebhookConfig::new("w1", "s1", "not a url");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = WebhookConfig::new("w1", "s1", "http://localhost/hook").with_secret("hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_active_for_session() {
        let store = InMemoryWebhookConfigStore::new();
        store
            .upsert(WebhookConfig::new("w1", "s1", "http://localhost/a"))
            .unwrap();
        let mut inactive = WebhookConfig::new("w2", "s1", "http://localhost/b");
        inactive.active = false;
        store.upsert(inactive).unwrap();
        store
            .upsert(WebhookConfig::new("w3", "s2", "http://localhost/c"))
            .unwrap();

        let configs = store.active_for_session("s1").await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, "w1");

        assert!(store.remove("w1"));
        assert!(store.active_for_session("s1").await.unwrap().is_empty());
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let store = InMemoryWebhookConfigStore::new();
        store
            .upsert(WebhookConfig::new("w1", "s1", "http://localhost/a"))
            .unwrap();
        store
            .upsert(WebhookConfig::new("w1", "s1", "http://localhost/b"))
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("webhooks.json5");
        std::fs::write(
            &path,
            r#"[
                // CRM integration
                { id: "crm", session_id: "s1", url: "https://crm.example.com/hook",
                  secret: "k", events: ["message", "receipt"] },
                { id: "audit", session_id: "s1", url: "https://audit.example.com/hook" },
            ]"#,
        )
        .unwrap();

        let store = InMemoryWebhookConfigStore::load_from_file(&path).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_load_from_file_rejects_bad_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("webhooks.json5");
        std::fs::write(&path, r#"[{ id: "x", session_id: "s1", url: "nope" }]"#).unwrap();
        assert!(matches!(
            InMemoryWebhookConfigStore::load_from_file(&path),
            Err(WebhookStoreError::Invalid(_))
        ));
    }
}
