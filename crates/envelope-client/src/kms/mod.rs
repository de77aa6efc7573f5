//! KMS capability used to generate and decrypt data keys.
//!
//! The key service is reached over the network, so every call may suspend,
//! fail in transit, or time out. A call that reaches the service but is
//! refused comes back as a response with `success: false`; a call that never
//! completes is a [`KmsError`].

pub mod aws;

pub use aws::AwsKmsClient;

use async_trait::async_trait;
use common::protocol::{
    DecryptDataKeyRequest, DecryptDataKeyResponse, GenerateDataKeyRequest,
    GenerateDataKeyResponse,
};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors raised when a KMS call does not produce a response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KmsError {
    /// The request could not be delivered or the reply could not be read.
    #[error("KMS transport error: {0}")]
    Transport(String),

    /// The call did not complete within the configured timeout.
    #[error("KMS call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Narrow interface to the key-management service.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Ask the KMS for a fresh data key bound to the request's context.
    async fn generate_data_key(
        &self,
        request: GenerateDataKeyRequest,
    ) -> Result<GenerateDataKeyResponse, KmsError>;

    /// Ask the KMS to decrypt an encrypted data key under the given context.
    async fn decrypt_data_key(
        &self,
        request: DecryptDataKeyRequest,
    ) -> Result<DecryptDataKeyResponse, KmsError>;

    /// Cheap reachability probe used by health checks.
    async fn ping(&self) -> Result<(), KmsError> {
        Ok(())
    }

    /// Human-readable description of where requests are sent.
    fn endpoint(&self) -> String;
}
