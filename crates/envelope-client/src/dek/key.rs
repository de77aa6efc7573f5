//! [`DekBytes`] and [`DataKey`]: owned plaintext key material that wipes itself.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::context::USER_ID;
use common::EncryptionContext;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Errors produced while turning KMS output into key material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DekError {
    /// The KMS reported success but sent no plaintext key.
    #[error("KMS response contained no plaintext data key")]
    MissingPlaintext,

    /// The KMS reported success but sent no encrypted key.
    #[error("KMS response contained no encrypted data key")]
    MissingEncryptedKey,

    /// The plaintext key is not valid base64.
    #[error("plaintext data key is not valid base64")]
    InvalidEncoding,

    /// The decoded key material is empty, or the wrong size for its use.
    #[error("data key has invalid length: {0} bytes")]
    InvalidLength(usize),
}

/// Heap buffer holding plaintext key material of whatever length the KMS
/// issued.
///
/// Every clone is an independent heap allocation. When a value is dropped or
/// [`erase`](Self::erase)d, its bytes are overwritten with zeroes. Keys used
/// for payload encryption must additionally be
/// [`KEY_LEN`](crate::crypto::KEY_LEN) bytes; that is checked where a key
/// becomes the active key.
#[derive(Clone)]
pub struct DekBytes(Box<[u8]>);

impl DekBytes {
    /// Copy `bytes` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::InvalidLength`] if the slice is empty.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DekError> {
        if bytes.is_empty() {
            return Err(DekError::InvalidLength(0));
        }
        Ok(Self(bytes.into()))
    }

    /// Decode a base64 key as delivered by the KMS.
    ///
    /// The intermediate decode buffer is wiped before returning, on success
    /// and on error.
    pub fn from_base64(encoded: &str) -> Result<Self, DekError> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|_| DekError::InvalidEncoding)?,
        );
        Self::from_slice(&decoded)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite the key with zeroes in place.
    pub fn erase(&mut self) {
        let bytes: &mut [u8] = &mut self.0;
        bytes.zeroize();
    }

    /// Returns `true` if every byte of the buffer is zero.
    pub fn is_erased(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Drop for DekBytes {
    fn drop(&mut self) {
        self.erase();
    }
}

impl std::fmt::Debug for DekBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("DekBytes([REDACTED])")
    }
}

/// A data key in both forms, plus the context it was generated under.
#[derive(Debug)]
pub struct DataKey {
    pub plaintext: DekBytes,
    /// Opaque blob returned by the KMS; safe to store and transmit.
    pub encrypted_form: String,
    pub context: EncryptionContext,
}

impl DataKey {
    pub fn new(plaintext: DekBytes, encrypted_form: String, context: EncryptionContext) -> Self {
        Self {
            plaintext,
            encrypted_form,
            context,
        }
    }

    /// The user this key was generated for, taken from its context.
    ///
    /// Payloads sealed with the key are bound to this user, so the pairing
    /// travels with the key itself.
    pub fn user_id(&self) -> Option<&str> {
        self.context.get(USER_ID)
    }
}
