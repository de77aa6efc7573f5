//! Request and response types exchanged with collaborators.
//!
//! The KMS records mirror the JSON contract of the key service; the
//! [`EncryptionResult`] envelope is the storage format for encrypted payloads.
//! All records serialise with camelCase field names.

use serde::{Deserialize, Serialize};

use crate::context::EncryptionContext;

// ---------------------------------------------------------------------------
// KMS: generate data key
// ---------------------------------------------------------------------------

/// Request for a fresh data key bound to `encryption_context`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateDataKeyRequest {
    pub encryption_context: EncryptionContext,
    pub auth_token: Option<String>,
}

/// KMS reply to [`GenerateDataKeyRequest`].
///
/// On success both key fields are populated: the plaintext key as base64 and
/// the encrypted key as an opaque string.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateDataKeyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plaintext_data_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerateDataKeyResponse {
    pub fn ok(plaintext_data_key: impl Into<String>, encrypted_data_key: impl Into<String>) -> Self {
        Self {
            success: true,
            plaintext_data_key: Some(plaintext_data_key.into()),
            encrypted_data_key: Some(encrypted_data_key.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for GenerateDataKeyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateDataKeyResponse")
            .field("success", &self.success)
            .field("plaintext_data_key", &self.plaintext_data_key.as_ref().map(|_| "[REDACTED]"))
            .field("encrypted_data_key", &self.encrypted_data_key)
            .field("error", &self.error)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// KMS: decrypt data key
// ---------------------------------------------------------------------------

/// Request to recover the plaintext of a previously generated data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptDataKeyRequest {
    pub encrypted_data_key: String,
    pub encryption_context: EncryptionContext,
    pub auth_token: Option<String>,
}

/// KMS reply to [`DecryptDataKeyRequest`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptDataKeyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plaintext_data_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DecryptDataKeyResponse {
    pub fn ok(plaintext_data_key: impl Into<String>) -> Self {
        Self {
            success: true,
            plaintext_data_key: Some(plaintext_data_key.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            plaintext_data_key: None,
            error: Some(error.into()),
        }
    }
}

impl std::fmt::Debug for DecryptDataKeyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptDataKeyResponse")
            .field("success", &self.success)
            .field("plaintext_data_key", &self.plaintext_data_key.as_ref().map(|_| "[REDACTED]"))
            .field("error", &self.error)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Encryption envelope
// ---------------------------------------------------------------------------

/// Authenticated-encryption envelope produced by `encrypt` and consumed by
/// `decrypt`. All binary fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionResult {
    /// Ciphertext without the authentication tag.
    pub encrypted: String,
    /// Algorithm identifier, e.g. `"AES-256-GCM-SIV"`.
    pub algorithm: String,
    /// Per-message nonce.
    pub iv: String,
    /// Authentication tag.
    pub tag: String,
}

// ---------------------------------------------------------------------------
// Status and health
// ---------------------------------------------------------------------------

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// `hits / total_requests * 100`, rounded to two decimals; `0` when idle.
    pub hit_rate: f64,
}

/// Lightweight client status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub initialized: bool,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub has_valid_key: bool,
}

/// Cache section of a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub size: usize,
    pub max_size: usize,
}

/// KMS reachability section of a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    pub reachable: bool,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a health check. Produced without side effects and never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `"healthy"` when a key is active and the KMS answers, else `"degraded"`.
    pub status: String,
    pub initialized: bool,
    pub has_valid_key: bool,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub cache: CacheHealth,
    pub api: ApiHealth,
}
