//! [`SessionStore`] implementations: in-memory and a JSON file on disk.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{SessionStore, SessionStoreError};

/// Process-local session store. Sessions do not survive a restart.
#[derive(Clone, Debug, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, user_id: &str) -> Result<Option<String>, SessionStoreError> {
        Ok(self.inner.read().await.get(user_id).cloned())
    }

    async fn store_session(&self, user_id: &str, session_id: &str) -> Result<(), SessionStoreError> {
        self.inner
            .write()
            .await
            .insert(user_id.to_owned(), session_id.to_owned());
        Ok(())
    }

    async fn clear_session(&self, user_id: &str) -> Result<(), SessionStoreError> {
        self.inner.write().await.remove(user_id);
        Ok(())
    }
}

/// Session ids persisted as a `{ userId: sessionId }` JSON object.
///
/// Each write rewrites the whole file via a temporary sibling and a rename.
/// A missing file reads as empty.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<HashMap<String, String>, SessionStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, sessions: &HashMap<String, String>) -> Result<(), SessionStoreError> {
        let bytes = serde_json::to_vec_pretty(sessions)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get_session(&self, user_id: &str) -> Result<Option<String>, SessionStoreError> {
        Ok(self.load().await?.remove(user_id))
    }

    async fn store_session(&self, user_id: &str, session_id: &str) -> Result<(), SessionStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load().await?;
        sessions.insert(user_id.to_owned(), session_id.to_owned());
        self.save(&sessions).await
    }

    async fn clear_session(&self, user_id: &str) -> Result<(), SessionStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load().await?;
        if sessions.remove(user_id).is_some() {
            self.save(&sessions).await?;
        }
        Ok(())
    }
}
