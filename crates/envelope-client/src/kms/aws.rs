//! [`KmsClient`] backed by AWS KMS.
//!
//! Data keys are generated with `GenerateDataKey` (`AES_256`) and recovered
//! with `Decrypt`, both passing the encryption context so that KMS enforces
//! the binding. Binary blobs cross the [`KmsClient`] boundary as standard
//! base64 strings. Authentication uses the standard AWS credential chain, so
//! the per-request auth token is not forwarded.

use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::error::{DisplayErrorContext, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::protocol::{
    DecryptDataKeyRequest, DecryptDataKeyResponse, GenerateDataKeyRequest,
    GenerateDataKeyResponse,
};
use tracing::{instrument, warn};

use super::{KmsClient, KmsError};

/// AWS KMS client bound to one customer master key.
#[derive(Clone, Debug)]
pub struct AwsKmsClient {
    client: aws_sdk_kms::Client,
    key_id: String,
    endpoint: String,
}

impl AwsKmsClient {
    /// Initialise the SDK client.
    ///
    /// `endpoint_url` overrides the regional endpoint (for example a local
    /// KMS emulator or a VPC endpoint).
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible so endpoint validation can be added
    /// without changing callers.
    pub async fn init(key_id: &str, endpoint_url: Option<&str>) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let mut builder = aws_sdk_kms::config::Builder::from(&config);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url);
        }
        let endpoint = match endpoint_url {
            Some(url) => url.to_owned(),
            None => format!(
                "aws-kms:{}",
                config.region().map(|r| r.as_ref()).unwrap_or("default-region")
            ),
        };

        Ok(Self {
            client: aws_sdk_kms::Client::from_conf(builder.build()),
            key_id: key_id.to_owned(),
            endpoint,
        })
    }
}

/// Service-side refusals become `success: false`; anything else is transport.
fn classify<E, R>(err: SdkError<E, R>) -> Result<String, KmsError>
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(_) => Ok(message),
        _ => Err(KmsError::Transport(message)),
    }
}

#[async_trait]
impl KmsClient for AwsKmsClient {
    #[instrument(skip_all, fields(kms = "aws"))]
    async fn generate_data_key(
        &self,
        request: GenerateDataKeyRequest,
    ) -> Result<GenerateDataKeyResponse, KmsError> {
        let result = self
            .client
            .generate_data_key()
            .key_id(&self.key_id)
            .key_spec(DataKeySpec::Aes256)
            .set_encryption_context(Some(request.encryption_context.to_hash_map()))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let reason = classify(e)?;
                warn!(error = %reason, "AWS KMS GenerateDataKey refused");
                return Ok(GenerateDataKeyResponse::failure(reason));
            }
        };

        match (output.plaintext(), output.ciphertext_blob()) {
            (Some(plaintext), Some(ciphertext)) => Ok(GenerateDataKeyResponse::ok(
                STANDARD.encode(plaintext.as_ref()),
                STANDARD.encode(ciphertext.as_ref()),
            )),
            _ => Ok(GenerateDataKeyResponse::failure(
                "GenerateDataKey response missing key material",
            )),
        }
    }

    #[instrument(skip_all, fields(kms = "aws"))]
    async fn decrypt_data_key(
        &self,
        request: DecryptDataKeyRequest,
    ) -> Result<DecryptDataKeyResponse, KmsError> {
        let Ok(ciphertext) = STANDARD.decode(&request.encrypted_data_key) else {
            return Ok(DecryptDataKeyResponse::failure(
                "encrypted data key is not valid base64",
            ));
        };

        let result = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(ciphertext))
            .set_encryption_context(Some(request.encryption_context.to_hash_map()))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let reason = classify(e)?;
                warn!(error = %reason, "AWS KMS Decrypt refused");
                return Ok(DecryptDataKeyResponse::failure(reason));
            }
        };

        match output.plaintext() {
            Some(plaintext) => Ok(DecryptDataKeyResponse::ok(STANDARD.encode(plaintext.as_ref()))),
            None => Ok(DecryptDataKeyResponse::failure(
                "KMS decrypt response contained no plaintext",
            )),
        }
    }

    async fn ping(&self) -> Result<(), KmsError> {
        self.client
            .describe_key()
            .key_id(&self.key_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| KmsError::Transport(DisplayErrorContext(&e).to_string()))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}
