//! Session persistence port
//!
//! [`SessionStore`] is the durable home of session records. Two
//! implementations ship with the crate: an in-memory map and a file-backed
//! store that keeps one JSON document per session.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::Session;

/// File extension for persisted session records
const SESSION_EXTENSION: &str = "json";

/// Error types for session store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Durable storage for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new record. Fails if the id or the name is taken.
    async fn create(&self, session: &Session) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn get_by_name(&self, name: &str) -> Result<Option<Session>, StoreError>;
    async fn list(&self) -> Result<Vec<Session>, StoreError>;
    /// Replace an existing record.
    async fn update(&self, session: &Session) -> Result<(), StoreError>;
    /// Remove a record. Removing an unknown id is not an error.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

fn check_unique(
    sessions: &HashMap<String, Session>,
    candidate: &Session,
) -> Result<(), StoreError> {
    if sessions.contains_key(&candidate.id) {
        return Err(StoreError::AlreadyExists(candidate.id.clone()));
    }
    if sessions.values().any(|s| s.name == candidate.name) {
        return Err(StoreError::AlreadyExists(candidate.name.clone()));
    }
    Ok(())
}

fn sorted(mut sessions: Vec<Session>) -> Vec<Session> {
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    sessions
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store, used in tests and for ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        check_unique(&sessions, session)?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        Ok(sorted(self.sessions.read().values().cloned().collect()))
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(session.id.clone())),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.write().remove(id);
        Ok(())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// File-based store: `<base_path>/<session-id>.json`.
///
/// Records are cached in memory after the initial scan. Writes go to a
/// temporary file that is renamed over the target, so a crash never leaves a
/// truncated record behind.
#[derive(Debug)]
pub struct FileSessionStore {
    base_path: PathBuf,
    cache: RwLock<HashMap<String, Session>>,
}

impl FileSessionStore {
    /// Open (or create) a store rooted at `base_path` and load existing records.
    ///
    /// Unreadable records are skipped with a warning.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        let mut cache = HashMap::new();
        for entry in fs::read_dir(&base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_EXTENSION) {
                continue;
            }
            match read_record(&path) {
                Ok(session) => {
                    cache.insert(session.id.clone(), session);
                }
                Err(e) => {
                    warn!(target: "store", path = %path.display(), error = %e, "skipping unreadable session record");
                }
            }
        }
        debug!(target: "store", path = %base_path.display(), count = cache.len(), "session store opened");

        Ok(Self {
            base_path,
            cache: RwLock::new(cache),
        })
    }

    /// Directory holding the records
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{id}.{SESSION_EXTENSION}"))
    }

    fn write_record(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.record_path(&session.id);
        let tmp = path.with_extension(format!(
            "{SESSION_EXTENSION}.{}.tmp",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let json = serde_json::to_vec_pretty(session)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Session, StoreError> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        validate_id(&session.id)?;
        let mut cache = self.cache.write();
        check_unique(&cache, session)?;
        self.write_record(session)?;
        cache.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.cache.read().get(id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .cache
            .read()
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        Ok(sorted(self.cache.read().values().cloned().collect()))
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        let mut cache = self.cache.write();
        if !cache.contains_key(&session.id) {
            return Err(StoreError::NotFound(session.id.clone()));
        }
        self.write_record(session)?;
        cache.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        let mut cache = self.cache.write();
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        cache.remove(id);
        Ok(())
    }
}
