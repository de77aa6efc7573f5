//! [`EnvelopeClient`]: the lifecycle state machine tying sessions, data keys
//! and payload encryption together.
//!
//! ```text
//! Uninitialized ──initialize──▶ Initializing ──▶ Ready ──rotate──▶ Rotating ──▶ Ready
//!       ▲                            │
//!       └────────── failure ─────────┘            any ──cleanup──▶ Cleaned
//! ```
//!
//! `initialize`, `rotate_data_key` and `cleanup` are serialised by a mutex.
//! A new key and the session it belongs to are installed together while the
//! state write lock is held (lock order: state, then active key).
//! `encrypt`/`decrypt` only take the active key's read lock and bind payloads
//! to the user recorded in that key's context, so a key is never paired with
//! another user's identity. They keep working with the previous key while a
//! rotation waits on the KMS.

use std::sync::Arc;
use std::time::Duration;

use common::protocol::{
    ApiHealth, CacheHealth, CacheStats, ClientStatus, EncryptionResult, HealthReport,
};
use common::{ClientError, EncryptionContext};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::crypto::CryptoEngine;
use crate::dek::manager::DEFAULT_KMS_TIMEOUT;
use crate::dek::{CacheConfig, DataKey, DataKeyCache, DekBytes, KeyManager};
use crate::kms::KmsClient;
use crate::session::{SessionContext, SessionStore};

/// Phase of the client lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Rotating,
    Cleaned,
}

/// Tunables for an [`EnvelopeClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub cache: CacheConfig,
    pub kms_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            kms_timeout: DEFAULT_KMS_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct ClientState {
    phase: LifecycleState,
    session: Option<SessionContext>,
}

/// Client-side envelope encryption for one user session.
pub struct EnvelopeClient {
    sessions: Arc<dyn SessionStore>,
    keys: KeyManager,
    state: RwLock<ClientState>,
    lifecycle: Mutex<()>,
}

impl EnvelopeClient {
    pub fn new(
        kms: Arc<dyn KmsClient>,
        sessions: Arc<dyn SessionStore>,
        options: ClientOptions,
    ) -> Self {
        let cache = DataKeyCache::with_config(options.cache);
        Self {
            sessions,
            keys: KeyManager::new(kms, cache, options.kms_timeout),
            state: RwLock::new(ClientState {
                phase: LifecycleState::Uninitialized,
                session: None,
            }),
            lifecycle: Mutex::new(()),
        }
    }

    /// Establish the session for `user_id` and generate its first data key.
    ///
    /// Callable from any state, including after [`cleanup`](Self::cleanup).
    /// While it runs, a previously established key keeps serving payload
    /// operations.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Initialization`] if the session store fails or
    /// no data key can be generated. The client is then `Uninitialized` with
    /// no session and no key.
    pub async fn initialize(
        &self,
        user_id: &str,
        auth_token: Option<String>,
    ) -> Result<(), ClientError> {
        let _guard = self.lifecycle.lock().await;
        self.state.write().await.phase = LifecycleState::Initializing;

        match self.bootstrap(user_id, auth_token).await {
            Ok((session, key)) => {
                let mut state = self.state.write().await;
                // The retired key is wiped as it goes out of scope.
                let _retired = self.keys.replace_active(key).await;
                if let Some(mut previous) = state.session.replace(session) {
                    wipe_token(&mut previous);
                }
                state.phase = LifecycleState::Ready;
                info!(user_id, "client-side encryption initialised");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.write().await;
                self.keys.clear_active_key().await;
                if let Some(mut previous) = state.session.take() {
                    wipe_token(&mut previous);
                }
                state.phase = LifecycleState::Uninitialized;
                warn!(user_id, error = %e, "client-side encryption initialisation failed");
                Err(e)
            }
        }
    }

    /// Restore or start the session, generate its key, then persist the
    /// session id. Nothing is installed; the caller swaps both in at once.
    async fn bootstrap(
        &self,
        user_id: &str,
        auth_token: Option<String>,
    ) -> Result<(SessionContext, DataKey), ClientError> {
        let session = SessionContext::initialize(self.sessions.as_ref(), user_id, auth_token)
            .await
            .map_err(|e| ClientError::Initialization(e.to_string()))?;
        let key = self
            .keys
            .generate_data_key(&session)
            .await
            .map_err(|e| ClientError::Initialization(e.to_string()))?;
        session
            .persist(self.sessions.as_ref())
            .await
            .map_err(|e| ClientError::Initialization(e.to_string()))?;
        Ok((session, key))
    }

    /// Encrypt `plaintext` with the active data key, binding the user id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotInitialized`] without an active key and user.
    pub async fn encrypt(&self, plaintext: &str) -> Result<EncryptionResult, ClientError> {
        self.keys
            .with_active_key(|key| {
                let user_id = key.user_id().ok_or(ClientError::NotInitialized)?;
                CryptoEngine::new(&key.plaintext, user_id)
                    .encrypt(plaintext)
                    .map_err(|e| ClientError::Encryption(e.to_string()))
            })
            .await
            .unwrap_or(Err(ClientError::NotInitialized))
    }

    /// Verify and decrypt an envelope produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotInitialized`] without an active key and user,
    /// and [`ClientError::Decryption`] if the envelope does not verify.
    pub async fn decrypt(&self, envelope: &EncryptionResult) -> Result<String, ClientError> {
        self.keys
            .with_active_key(|key| {
                let user_id = key.user_id().ok_or(ClientError::NotInitialized)?;
                CryptoEngine::new(&key.plaintext, user_id)
                    .decrypt(envelope)
                    .map_err(|e| ClientError::Decryption(e.to_string()))
            })
            .await
            .unwrap_or(Err(ClientError::NotInitialized))
    }

    /// Recover a data key's plaintext, cache first, using the session's token.
    pub async fn decrypt_data_key(
        &self,
        encrypted_form: &str,
        context: &EncryptionContext,
    ) -> Result<DekBytes, ClientError> {
        let auth_token = {
            let state = self.state.read().await;
            state.session.as_ref().and_then(|s| s.auth_token.clone())
        };
        self.keys
            .decrypt_data_key(encrypted_form, context, auth_token.as_deref())
            .await
    }

    /// Replace the active key with one generated under a new session id.
    ///
    /// The current key stays active, and usable by concurrent callers, until
    /// the new key is installed; it is wiped at the swap.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] when no user is established and
    /// [`ClientError::KeyGeneration`] when the KMS fails. On failure the
    /// previous key and session id remain in effect.
    pub async fn rotate_data_key(&self) -> Result<(), ClientError> {
        let _guard = self.lifecycle.lock().await;

        let next = {
            let mut state = self.state.write().await;
            let Some(current) = state.session.as_ref() else {
                return Err(ClientError::InvalidState(
                    "no user id established; call initialize first".into(),
                ));
            };
            let next = current.with_new_session_id();
            state.phase = LifecycleState::Rotating;
            next
        };
        info!(user_id = %next.user_id, "rotating data key");

        let result = self.keys.generate_data_key(&next).await;

        let mut state = self.state.write().await;
        state.phase = LifecycleState::Ready;
        match result {
            Ok(key) => {
                let _retired = self.keys.replace_active(key).await;
                if let Some(mut previous) = state.session.replace(next) {
                    wipe_token(&mut previous);
                }
                info!("data key rotated");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "data key rotation failed; previous key retained");
                Err(e)
            }
        }
    }

    /// Erase all key material and drop the session.
    ///
    /// Wipes the active key, drops the auth token, clears the cache and its
    /// statistics, and with `clear_session` also forgets the persisted session
    /// id. Failure to clear the persisted session is logged, not returned.
    pub async fn cleanup(&self, clear_session: bool) {
        let _guard = self.lifecycle.lock().await;
        info!("cleaning up client-side encryption resources");

        let session = {
            let mut state = self.state.write().await;
            state.phase = LifecycleState::Cleaned;
            self.keys.clear_active_key().await;
            state.session.take()
        };
        self.keys.cache().clear(true).await;

        if let Some(mut session) = session {
            if clear_session {
                match self.sessions.clear_session(&session.user_id).await {
                    Ok(()) => info!(user_id = %session.user_id, "persisted session cleared"),
                    Err(e) => warn!(error = %e, "failed to clear persisted session"),
                }
            }
            wipe_token(&mut session);
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.state.read().await.phase
    }

    pub async fn status(&self) -> ClientStatus {
        let (user_id, session_id) = {
            let state = self.state.read().await;
            match state.session.as_ref() {
                Some(s) => (Some(s.user_id.clone()), Some(s.session_id.clone())),
                None => (None, None),
            }
        };
        let has_valid_key = self.keys.has_active_key().await;
        ClientStatus {
            initialized: has_valid_key && user_id.is_some(),
            user_id,
            session_id,
            has_valid_key,
        }
    }

    /// Report client, cache and KMS health. Never fails and changes nothing.
    pub async fn health_check(&self) -> HealthReport {
        let status = self.status().await;
        let cache = self.keys.cache();
        let cache_health = CacheHealth {
            stats: cache.stats(),
            size: cache.len().await,
            max_size: cache.max_entries(),
        };

        let ping = self.keys.ping_kms().await;
        let api = ApiHealth {
            reachable: ping.is_ok(),
            endpoint: self.keys.kms_endpoint(),
            error: ping.err().map(|e| e.to_string()),
        };

        let healthy = status.initialized && api.reachable;
        HealthReport {
            status: if healthy { "healthy" } else { "degraded" }.into(),
            initialized: status.initialized,
            has_valid_key: status.has_valid_key,
            user_id: status.user_id,
            session_id: status.session_id,
            cache: cache_health,
            api,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.keys.cache().stats()
    }

    /// Wipe every cached key; optionally reset the hit/miss counters.
    pub async fn clear_cache(&self, reset_stats: bool) {
        self.keys.cache().clear(reset_stats).await;
    }
}

fn wipe_token(session: &mut SessionContext) {
    if let Some(token) = session.auth_token.as_mut() {
        token.zeroize();
    }
    session.auth_token = None;
}
