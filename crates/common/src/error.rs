//! Common error types shared across crates.

use thiserror::Error;

/// Top-level client error type.
///
/// Every public operation of the envelope client fails with one of these
/// variants. The carried string preserves the underlying reason (KMS message,
/// store failure, cipher failure) but never contains key material.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Session bootstrap failed: the session store could not be read or
    /// written, or the first data key could not be established.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// The KMS could not generate a data key, or returned unusable material.
    #[error("data key generation failed: {0}")]
    KeyGeneration(String),

    /// The KMS could not decrypt an encrypted data key.
    #[error("data key decryption failed: {0}")]
    KeyDecryption(String),

    /// A crypto operation was attempted with no active data key or user.
    #[error("client-side encryption is not initialized")]
    NotInitialized,

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A payload could not be encrypted with the active key.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// An envelope failed authentication or could not be parsed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The data key cache failed. The client absorbs these internally; code
    /// driving a cache directly converts its cache error into this variant.
    #[error("cache error: {0}")]
    Cache(String),
}

impl ClientError {
    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Initialization(_) => "initialization_error",
            ClientError::KeyGeneration(_) => "key_generation_error",
            ClientError::KeyDecryption(_) => "key_decryption_error",
            ClientError::NotInitialized => "not_initialized",
            ClientError::InvalidState(_) => "invalid_state",
            ClientError::Encryption(_) => "encryption_error",
            ClientError::Decryption(_) => "decryption_error",
            ClientError::Cache(_) => "cache_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let all = [
            ClientError::Initialization("x".into()),
            ClientError::KeyGeneration("x".into()),
            ClientError::KeyDecryption("x".into()),
            ClientError::NotInitialized,
            ClientError::InvalidState("x".into()),
            ClientError::Encryption("x".into()),
            ClientError::Decryption("x".into()),
            ClientError::Cache("x".into()),
        ];
        let mut codes: Vec<_> = all.iter().map(ClientError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn display_includes_reason() {
        let e = ClientError::KeyGeneration("AccessDeniedException".into());
        assert!(e.to_string().contains("AccessDeniedException"));
    }
}
