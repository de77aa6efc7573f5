//! Configuration loading and validation for the envelope client binary.
//!
//! All values are read from `ENVELOPE_`-prefixed environment variables at
//! startup. The process exits with a clear error message if any required
//! variable is missing or invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::client::ClientOptions;
use crate::dek::CacheConfig;

/// Validated client configuration.
#[derive(Clone, Deserialize)]
pub struct ClientConfig {
    /// User whose session and data key the client operates under. **Required.**
    pub user_id: String,

    /// Bearer token forwarded to the KMS with every request.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// KMS key ID or alias that wraps generated data keys. **Required.**
    pub kms_key_id: String,

    /// Override for the KMS endpoint (emulator, VPC endpoint).
    #[serde(default)]
    pub kms_endpoint_url: Option<String>,

    /// Upper bound (seconds) on a single KMS call.
    #[serde(default = "default_kms_timeout")]
    pub kms_timeout_secs: u64,

    /// Lifetime (seconds) of a cached data key.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cached data keys.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// JSON file holding persisted session ids.
    #[serde(default = "default_session_store_path")]
    pub session_store_path: String,

    /// OTLP collector endpoint; spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_kms_timeout() -> u64 {
    10
}
fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}
fn default_cache_max_entries() -> usize {
    100
}
fn default_session_store_path() -> String {
    ".envelope-sessions.json".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl ClientConfig {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("ENVELOPE"))
            .build()
            .context("failed to build configuration from environment")?;

        let c: ClientConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Tunables handed to [`crate::EnvelopeClient::new`].
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            cache: CacheConfig {
                ttl: Duration::from_secs(self.cache_ttl_secs),
                max_entries: self.cache_max_entries,
            },
            kms_timeout: Duration::from_secs(self.kms_timeout_secs),
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.user_id, "ENVELOPE_USER_ID")?;
        ensure_non_empty(&self.kms_key_id, "ENVELOPE_KMS_KEY_ID")?;
        ensure_non_empty(&self.session_store_path, "ENVELOPE_SESSION_STORE_PATH")?;

        if self.kms_timeout_secs == 0 {
            anyhow::bail!("ENVELOPE_KMS_TIMEOUT_SECS must be > 0");
        }
        if self.cache_ttl_secs == 0 {
            anyhow::bail!("ENVELOPE_CACHE_TTL_SECS must be > 0");
        }
        if self.cache_max_entries == 0 {
            anyhow::bail!("ENVELOPE_CACHE_MAX_ENTRIES must be > 0");
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user_id", &self.user_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("kms_key_id", &self.kms_key_id)
            .field("kms_endpoint_url", &self.kms_endpoint_url)
            .field("kms_timeout_secs", &self.kms_timeout_secs)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("cache_max_entries", &self.cache_max_entries)
            .field("session_store_path", &self.session_store_path)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
