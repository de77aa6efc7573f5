//! [`KeyManager`]: owns the active data key and mediates every KMS call.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::protocol::{DecryptDataKeyRequest, GenerateDataKeyRequest, GenerateDataKeyResponse};
use common::{ClientError, EncryptionContext};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::cache::DataKeyCache;
use super::key::{DataKey, DekBytes, DekError};
use crate::crypto::KEY_LEN;
use crate::kms::{KmsClient, KmsError};
use crate::session::SessionContext;

/// Default upper bound on a single KMS round trip.
pub const DEFAULT_KMS_TIMEOUT: Duration = Duration::from_secs(10);

/// Generates, decrypts, caches and holds data keys for one client.
///
/// The active key sits behind a `RwLock`: payload operations take short read
/// locks, while installing a new key takes the write lock only for the swap.
/// KMS calls never run under that lock, so the previous key keeps serving
/// readers until its replacement is ready.
pub struct KeyManager {
    kms: Arc<dyn KmsClient>,
    cache: DataKeyCache,
    active: RwLock<Option<DataKey>>,
    kms_timeout: Duration,
}

impl KeyManager {
    pub fn new(kms: Arc<dyn KmsClient>, cache: DataKeyCache, kms_timeout: Duration) -> Self {
        Self {
            kms,
            cache,
            active: RwLock::new(None),
            kms_timeout,
        }
    }

    pub fn cache(&self) -> &DataKeyCache {
        &self.cache
    }

    pub fn kms_endpoint(&self) -> String {
        self.kms.endpoint()
    }

    /// Probe the KMS, bounded by the configured timeout.
    pub async fn ping_kms(&self) -> Result<(), KmsError> {
        self.call(self.kms.ping()).await
    }

    /// Generate a data key for `session` and make it the active key.
    ///
    /// The previously active key, if any, is only retired (and wiped) once the
    /// new key is fully established.
    ///
    /// # Errors
    ///
    /// See [`generate_data_key`](Self::generate_data_key). The active key is
    /// unchanged on error.
    pub async fn generate_new_data_key(&self, session: &SessionContext) -> Result<(), ClientError> {
        let key = self.generate_data_key(session).await?;
        // The retired key is wiped as it goes out of scope.
        let _retired = self.replace_active(key).await;
        Ok(())
    }

    /// Generate and cache a data key for `session` without installing it.
    ///
    /// Callers that must pair the new key with other state install it
    /// themselves through [`replace_active`](Self::replace_active).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::KeyGeneration`] if the KMS call fails, times out,
    /// reports `success: false`, or returns key material that is not a
    /// [`KEY_LEN`]-byte AES-256 key.
    pub async fn generate_data_key(&self, session: &SessionContext) -> Result<DataKey, ClientError> {
        let context = EncryptionContext::for_session(&session.user_id, &session.session_id, now_ms());
        let request = GenerateDataKeyRequest {
            encryption_context: context.clone(),
            auth_token: session.auth_token.clone(),
        };

        let response = self
            .call(self.kms.generate_data_key(request))
            .await
            .map_err(|e| {
                warn!(error = %e, "data key generation failed");
                ClientError::KeyGeneration(e.to_string())
            })?;
        let key = data_key_from_response(response, context).map_err(|reason| {
            warn!(error = %reason, "data key generation failed");
            ClientError::KeyGeneration(reason)
        })?;

        if let Err(e) = self
            .cache
            .put(&key.encrypted_form, &key.context, &key.plaintext)
            .await
        {
            warn!(error = %e, "failed to cache generated data key");
        }
        info!(user_id = %session.user_id, "new data key generated and cached");
        Ok(key)
    }

    /// Recover the plaintext of `encrypted_form`, cache first.
    ///
    /// A cache hit returns without contacting the KMS. On a miss the KMS
    /// result is cached before being returned. Cache failures only cost a KMS
    /// round trip.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::KeyDecryption`] if the KMS call fails, times out,
    /// reports `success: false`, or returns empty or non-base64 key material.
    /// The key length is whatever the KMS issued; only keys that become the
    /// active key must be [`KEY_LEN`] bytes.
    pub async fn decrypt_data_key(
        &self,
        encrypted_form: &str,
        context: &EncryptionContext,
        auth_token: Option<&str>,
    ) -> Result<DekBytes, ClientError> {
        match self.cache.get(encrypted_form, context).await {
            Ok(Some(key)) => {
                debug!("data key served from cache");
                return Ok(key);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "data key cache lookup failed; falling back to KMS"),
        }

        debug!("data key cache miss; calling KMS decrypt");
        let request = DecryptDataKeyRequest {
            encrypted_data_key: encrypted_form.to_owned(),
            encryption_context: context.clone(),
            auth_token: auth_token.map(str::to_owned),
        };
        let mut response = self
            .call(self.kms.decrypt_data_key(request))
            .await
            .map_err(|e| {
                warn!(error = %e, "data key decryption failed");
                ClientError::KeyDecryption(e.to_string())
            })?;

        if !response.success {
            let reason = response
                .error
                .take()
                .unwrap_or_else(|| "KMS reported failure without a reason".into());
            warn!(error = %reason, "data key decryption refused by KMS");
            return Err(ClientError::KeyDecryption(reason));
        }
        let encoded = Zeroizing::new(
            response
                .plaintext_data_key
                .take()
                .ok_or_else(|| ClientError::KeyDecryption(DekError::MissingPlaintext.to_string()))?,
        );
        let key = DekBytes::from_base64(&encoded)
            .map_err(|e| ClientError::KeyDecryption(e.to_string()))?;

        if let Err(e) = self.cache.put(encrypted_form, context, &key).await {
            warn!(error = %e, "failed to cache decrypted data key");
        }
        debug!("data key decrypted and cached");
        Ok(key)
    }

    pub async fn has_active_key(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Run `f` against the active key while holding a read lock.
    ///
    /// Returns `None` when no key is active.
    pub async fn with_active_key<R>(&self, f: impl FnOnce(&DataKey) -> R) -> Option<R> {
        let guard = self.active.read().await;
        guard.as_ref().map(f)
    }

    /// Wipe and drop the active key. Returns `true` if one was present.
    pub async fn clear_active_key(&self) -> bool {
        let retired = self.active.write().await.take();
        match retired {
            Some(mut key) => {
                key.plaintext.erase();
                true
            }
            None => false,
        }
    }

    /// Install `key` as the active key, returning the retired one already wiped.
    ///
    /// Keys come from [`generate_data_key`](Self::generate_data_key), which
    /// guarantees an AES-256 key.
    pub(crate) async fn replace_active(&self, key: DataKey) -> Option<DataKey> {
        let mut retired = self.active.write().await.replace(key);
        if let Some(old) = retired.as_mut() {
            old.plaintext.erase();
        }
        retired
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, KmsError>>,
    ) -> Result<T, KmsError> {
        tokio::time::timeout(self.kms_timeout, fut)
            .await
            .map_err(|_| KmsError::Timeout(self.kms_timeout))?
    }
}

/// Validate a generate response and decode its key material.
///
/// The base64 plaintext is wiped whether or not decoding succeeds.
fn data_key_from_response(
    mut response: GenerateDataKeyResponse,
    context: EncryptionContext,
) -> Result<DataKey, String> {
    let encoded = response.plaintext_data_key.take().map(Zeroizing::new);
    if !response.success {
        return Err(response
            .error
            .take()
            .unwrap_or_else(|| "KMS reported failure without a reason".into()));
    }
    let encoded = encoded.ok_or_else(|| DekError::MissingPlaintext.to_string())?;
    let encrypted_form = response
        .encrypted_data_key
        .take()
        .ok_or_else(|| DekError::MissingEncryptedKey.to_string())?;
    let plaintext = DekBytes::from_base64(&encoded).map_err(|e| e.to_string())?;
    if plaintext.len() != KEY_LEN {
        return Err(DekError::InvalidLength(plaintext.len()).to_string());
    }
    Ok(DataKey::new(plaintext, encrypted_form, context))
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::fake::FakeKms;
    use crate::kms::MockKmsClient;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use common::protocol::{DecryptDataKeyResponse, GenerateDataKeyResponse};

    fn session(session_id: &str) -> SessionContext {
        SessionContext {
            user_id: "u1".into(),
            session_id: session_id.into(),
            auth_token: Some("tok".into()),
        }
    }

    fn manager(kms: Arc<dyn KmsClient>) -> KeyManager {
        KeyManager::new(kms, DataKeyCache::new(), DEFAULT_KMS_TIMEOUT)
    }

    async fn active_bytes(keys: &KeyManager) -> Option<Vec<u8>> {
        keys.with_active_key(|k| k.plaintext.as_bytes().to_vec()).await
    }

    #[tokio::test]
    async fn generate_installs_and_caches_key() {
        let kms = Arc::new(FakeKms::new());
        let keys = manager(kms.clone());
        keys.generate_new_data_key(&session("s1")).await.unwrap();

        assert!(keys.has_active_key().await);
        assert_eq!(active_bytes(&keys).await.unwrap(), vec![1u8; KEY_LEN]);

        let (blob, ctx) = keys
            .with_active_key(|k| (k.encrypted_form.clone(), k.context.clone()))
            .await
            .unwrap();
        assert_eq!(ctx.get("sessionId"), Some("s1"));
        assert_eq!(ctx.get("purpose"), Some("client-side-encryption"));
        assert!(keys.cache().contains(&blob, &ctx).await);
        assert_eq!(kms.generate_calls(), 1);
    }

    #[tokio::test]
    async fn second_decrypt_is_served_from_cache() {
        let kms = Arc::new(FakeKms::new());
        let ctx = EncryptionContext::for_session("u1", "s1", 42);
        let issued = kms
            .generate_data_key(GenerateDataKeyRequest {
                encryption_context: ctx.clone(),
                auth_token: None,
            })
            .await
            .unwrap();
        let blob = issued.encrypted_data_key.clone().unwrap();

        let keys = manager(kms.clone());
        let first = keys.decrypt_data_key(&blob, &ctx, Some("tok")).await.unwrap();
        let second = keys.decrypt_data_key(&blob, &ctx, Some("tok")).await.unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(kms.decrypt_calls(), 1);
        let stats = keys.cache().stats();
        assert_eq!((stats.total_requests, stats.hits, stats.misses), (2, 1, 1));
    }

    #[tokio::test]
    async fn decrypt_with_other_context_goes_to_kms() {
        let kms = Arc::new(FakeKms::new());
        let keys = manager(kms.clone());
        keys.generate_new_data_key(&session("s1")).await.unwrap();
        let blob = keys
            .with_active_key(|k| k.encrypted_form.clone())
            .await
            .unwrap();

        let wrong = EncryptionContext::for_session("u1", "other", 1);
        let err = keys.decrypt_data_key(&blob, &wrong, None).await.unwrap_err();
        assert_eq!(err, ClientError::KeyDecryption("encryption context mismatch".into()));
        assert_eq!(kms.decrypt_calls(), 1);
    }

    #[tokio::test]
    async fn failed_generation_keeps_previous_key() {
        let kms = Arc::new(FakeKms::new());
        let keys = manager(kms.clone());
        keys.generate_new_data_key(&session("s1")).await.unwrap();

        kms.fail_generate_with(Some("quota exceeded"));
        let err = keys.generate_new_data_key(&session("s2")).await.unwrap_err();
        assert_eq!(err, ClientError::KeyGeneration("quota exceeded".into()));
        assert_eq!(active_bytes(&keys).await.unwrap(), vec![1u8; KEY_LEN]);
    }

    #[tokio::test]
    async fn transport_error_is_key_generation_error() {
        let mut kms = MockKmsClient::new();
        kms.expect_generate_data_key()
            .times(1)
            .returning(|_| Err(KmsError::Transport("connection reset".into())));
        let keys = manager(Arc::new(kms));

        let err = keys.generate_new_data_key(&session("s1")).await.unwrap_err();
        assert!(matches!(&err, ClientError::KeyGeneration(r) if r.contains("connection reset")));
        assert!(!keys.has_active_key().await);
    }

    #[tokio::test]
    async fn short_key_is_rejected() {
        let mut kms = MockKmsClient::new();
        kms.expect_generate_data_key()
            .returning(|_| Ok(GenerateDataKeyResponse::ok(STANDARD.encode([1u8; 16]), "blob")));
        let keys = manager(Arc::new(kms));

        let err = keys.generate_new_data_key(&session("s1")).await.unwrap_err();
        assert!(matches!(&err, ClientError::KeyGeneration(r) if r.contains("invalid length")));
        assert!(!keys.has_active_key().await);
    }

    #[tokio::test]
    async fn missing_encrypted_key_is_rejected() {
        let mut kms = MockKmsClient::new();
        kms.expect_generate_data_key().returning(|_| {
            Ok(GenerateDataKeyResponse {
                success: true,
                plaintext_data_key: Some(STANDARD.encode([1u8; KEY_LEN])),
                ..Default::default()
            })
        });
        let keys = manager(Arc::new(kms));
        assert!(keys.generate_new_data_key(&session("s1")).await.is_err());
    }

    #[tokio::test]
    async fn refused_decrypt_is_not_cached() {
        let mut kms = MockKmsClient::new();
        kms.expect_decrypt_data_key()
            .times(2)
            .returning(|_| Ok(DecryptDataKeyResponse::failure("AccessDenied")));
        let keys = manager(Arc::new(kms));
        let ctx = EncryptionContext::for_session("u1", "s1", 1);

        for _ in 0..2 {
            let err = keys.decrypt_data_key("blob", &ctx, None).await.unwrap_err();
            assert_eq!(err, ClientError::KeyDecryption("AccessDenied".into()));
        }
        assert!(keys.cache().is_empty().await);
    }

    #[tokio::test]
    async fn replace_active_wipes_retired_key() {
        let keys = manager(Arc::new(FakeKms::new()));
        let first = DataKey::new(
            DekBytes::from_slice(&[0xAA; KEY_LEN]).unwrap(),
            "blob-1".into(),
            EncryptionContext::new(),
        );
        let second = DataKey::new(
            DekBytes::from_slice(&[0xBB; KEY_LEN]).unwrap(),
            "blob-2".into(),
            EncryptionContext::new(),
        );

        assert!(keys.replace_active(first).await.is_none());
        let retired = keys.replace_active(second).await.unwrap();
        assert_eq!(retired.encrypted_form, "blob-1");
        assert!(retired.plaintext.is_erased());
        assert_eq!(active_bytes(&keys).await.unwrap(), vec![0xBB; KEY_LEN]);
    }

    #[tokio::test]
    async fn clear_active_key_reports_presence() {
        let keys = manager(Arc::new(FakeKms::new()));
        assert!(!keys.clear_active_key().await);
        keys.generate_new_data_key(&session("s1")).await.unwrap();
        assert!(keys.clear_active_key().await);
        assert!(!keys.has_active_key().await);
    }

    #[tokio::test]
    async fn generate_data_key_does_not_install() {
        let kms = Arc::new(FakeKms::new());
        let keys = manager(kms.clone());

        let key = keys.generate_data_key(&session("s1")).await.unwrap();
        assert!(!keys.has_active_key().await);
        assert_eq!(key.user_id(), Some("u1"));
        assert!(keys.cache().contains(&key.encrypted_form, &key.context).await);

        assert!(keys.replace_active(key).await.is_none());
        assert_eq!(active_bytes(&keys).await.unwrap(), vec![1u8; KEY_LEN]);
    }

    #[tokio::test]
    async fn decrypt_returns_kms_chosen_key_length() {
        let mut kms = MockKmsClient::new();
        kms.expect_decrypt_data_key()
            .times(1)
            .returning(|_| Ok(DecryptDataKeyResponse::ok(STANDARD.encode([5u8; 16]))));
        let keys = manager(Arc::new(kms));
        let ctx = EncryptionContext::for_session("u1", "s1", 1);

        let key = keys.decrypt_data_key("blob", &ctx, None).await.unwrap();
        assert_eq!(key.as_bytes(), &[5u8; 16]);
        // Served from cache the second time.
        let again = keys.decrypt_data_key("blob", &ctx, None).await.unwrap();
        assert_eq!(again.len(), 16);
    }

    #[tokio::test]
    async fn decrypt_rejects_empty_key() {
        let mut kms = MockKmsClient::new();
        kms.expect_decrypt_data_key()
            .returning(|_| Ok(DecryptDataKeyResponse::ok("")));
        let keys = manager(Arc::new(kms));
        let ctx = EncryptionContext::for_session("u1", "s1", 1);

        let err = keys.decrypt_data_key("blob", &ctx, None).await.unwrap_err();
        assert!(matches!(&err, ClientError::KeyDecryption(r) if r.contains("invalid length")));
        assert!(keys.cache().is_empty().await);
    }

    struct StalledKms;

    #[async_trait]
    impl KmsClient for StalledKms {
        async fn generate_data_key(
            &self,
            _request: GenerateDataKeyRequest,
        ) -> Result<GenerateDataKeyResponse, KmsError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(GenerateDataKeyResponse::failure("unreachable"))
        }

        async fn decrypt_data_key(
            &self,
            _request: DecryptDataKeyRequest,
        ) -> Result<DecryptDataKeyResponse, KmsError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(DecryptDataKeyResponse::failure("unreachable"))
        }

        fn endpoint(&self) -> String {
            "stalled://kms".into()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn kms_timeout_surfaces_as_typed_error() {
        let keys = KeyManager::new(Arc::new(StalledKms), DataKeyCache::new(), Duration::from_secs(5));

        let err = keys.generate_new_data_key(&session("s1")).await.unwrap_err();
        assert!(matches!(&err, ClientError::KeyGeneration(r) if r.contains("timed out")));

        let ctx = EncryptionContext::for_session("u1", "s1", 1);
        let err = keys.decrypt_data_key("blob", &ctx, None).await.unwrap_err();
        assert!(matches!(&err, ClientError::KeyDecryption(r) if r.contains("timed out")));
        assert!(!keys.has_active_key().await);
        assert!(keys.cache().is_empty().await);
    }
}
