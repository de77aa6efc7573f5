//! Session identity: the (user, session, auth token) triple behind every KMS
//! call and every generated encryption context.

pub mod store;

pub use store::{FileSessionStore, MemorySessionStore};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Errors raised by a [`SessionStore`].
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for the session id of each user.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, user_id: &str) -> Result<Option<String>, SessionStoreError>;

    async fn store_session(&self, user_id: &str, session_id: &str) -> Result<(), SessionStoreError>;

    async fn clear_session(&self, user_id: &str) -> Result<(), SessionStoreError>;
}

/// Identity triple for one running client.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub session_id: String,
    pub auth_token: Option<String>,
}

impl SessionContext {
    /// Restore the persisted session for `user_id`, or start a new one.
    ///
    /// Nothing is written back here; call [`persist`](Self::persist) once the
    /// session has a data key, so a failed start never leaves a fresh id in
    /// the store.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read.
    pub async fn initialize(
        store: &dyn SessionStore,
        user_id: &str,
        auth_token: Option<String>,
    ) -> Result<Self, SessionStoreError> {
        let session_id = match store.get_session(user_id).await? {
            Some(existing) => {
                debug!(user_id, "restored persisted session");
                existing
            }
            None => {
                info!(user_id, "no persisted session; starting a new one");
                generate_session_id()
            }
        };

        Ok(Self {
            user_id: user_id.to_owned(),
            session_id,
            auth_token,
        })
    }

    /// Write this session id back to `store` under the user id.
    pub async fn persist(&self, store: &dyn SessionStore) -> Result<(), SessionStoreError> {
        store.store_session(&self.user_id, &self.session_id).await
    }

    /// Same user and token under a freshly generated session id.
    pub fn with_new_session_id(&self) -> Self {
        Self {
            session_id: generate_session_id(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restores_existing_session() {
        let store = MemorySessionStore::new();
        store.store_session("u1", "persisted").await.unwrap();

        let session = SessionContext::initialize(&store, "u1", None).await.unwrap();
        assert_eq!(session.session_id, "persisted");
    }

    #[tokio::test]
    async fn new_session_is_persisted_only_on_request() {
        let store = MemorySessionStore::new();
        let session = SessionContext::initialize(&store, "u1", Some("tok".into()))
            .await
            .unwrap();
        assert_eq!(session.session_id.len(), 32);
        assert!(store.get_session("u1").await.unwrap().is_none());

        session.persist(&store).await.unwrap();
        assert_eq!(
            store.get_session("u1").await.unwrap().as_deref(),
            Some(session.session_id.as_str())
        );
    }

    #[tokio::test]
    async fn read_failure_is_reported() {
        let mut store = MockSessionStore::new();
        store
            .expect_get_session()
            .returning(|_| Err(SessionStoreError::Unavailable("disk gone".into())));

        let err = SessionContext::initialize(&store, "u1", None).await.unwrap_err();
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn new_session_id_differs() {
        let session = SessionContext {
            user_id: "u1".into(),
            session_id: generate_session_id(),
            auth_token: Some("tok".into()),
        };
        let rotated = session.with_new_session_id();
        assert_ne!(rotated.session_id, session.session_id);
        assert_eq!(rotated.user_id, "u1");
        assert_eq!(rotated.auth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn debug_redacts_token() {
        let session = SessionContext {
            user_id: "u1".into(),
            session_id: "s1".into(),
            auth_token: Some("super-secret".into()),
        };
        assert!(!format!("{session:?}").contains("super-secret"));
    }
}
