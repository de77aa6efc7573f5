//! AES-256-GCM-SIV encryption and decryption of caller payloads.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant,
//! so an accidental nonce repeat leaks only plaintext equality rather than the
//! authentication key. A fresh random nonce is still drawn per message.

use aes_gcm_siv::{
    aead::{AeadInPlace, KeyInit, OsRng},
    Aes256GcmSiv, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::protocol::EncryptionResult;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::dek::DekBytes;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag.
pub const TAG_LEN: usize = 16;

/// Identifier written into the `algorithm` field of every envelope.
pub const ALGORITHM: &str = "AES-256-GCM-SIV";

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The data key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid data key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// Encryption failed, or decryption failed authentication (wrong key,
    /// wrong user, or tampered envelope).
    #[error("aead operation failed")]
    AeadFailure,

    /// The envelope names an algorithm this engine does not implement.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// An envelope field is not valid base64 or has the wrong length.
    #[error("malformed envelope field: {0}")]
    InvalidFormat(&'static str),

    /// The authenticated plaintext is not UTF-8.
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Encrypts and decrypts payloads for one user under one data key.
///
/// Built per operation while the caller holds the active key, so the key is
/// never copied out of its owner.
pub struct CryptoEngine<'a> {
    key: &'a DekBytes,
    user_id: &'a str,
}

impl<'a> CryptoEngine<'a> {
    pub fn new(key: &'a DekBytes, user_id: &'a str) -> Self {
        Self { key, user_id }
    }

    /// Encrypt a UTF-8 payload into an envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptionResult, CipherError> {
        self.encrypt_bytes(plaintext.as_bytes())
    }

    /// Encrypt raw bytes into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] for a malformed key and
    /// [`CipherError::AeadFailure`] on an internal AEAD error (unreachable with
    /// a valid key and nonce).
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<EncryptionResult, CipherError> {
        let cipher = build_cipher(self.key.as_bytes())?;

        use aes_gcm_siv::aead::rand_core::RngCore;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut buffer = plaintext.to_vec();
        let tag = match cipher.encrypt_in_place_detached(nonce, self.user_id.as_bytes(), &mut buffer) {
            Ok(tag) => tag,
            Err(_) => {
                // The buffer may still hold plaintext.
                drop(Zeroizing::new(buffer));
                return Err(CipherError::AeadFailure);
            }
        };

        Ok(EncryptionResult {
            encrypted: STANDARD.encode(&buffer),
            algorithm: ALGORITHM.to_owned(),
            iv: STANDARD.encode(nonce_bytes),
            tag: STANDARD.encode(tag),
        })
    }

    /// Verify and decrypt an envelope into a UTF-8 string.
    pub fn decrypt(&self, envelope: &EncryptionResult) -> Result<String, CipherError> {
        let mut plaintext = self.decrypt_bytes(envelope)?;
        String::from_utf8(std::mem::take(&mut *plaintext)).map_err(|e| {
            drop(Zeroizing::new(e.into_bytes()));
            CipherError::InvalidUtf8
        })
    }

    /// Verify and decrypt an envelope into raw bytes.
    ///
    /// Nothing is returned unless the tag verifies against the ciphertext,
    /// nonce, and this engine's user id.
    pub fn decrypt_bytes(&self, envelope: &EncryptionResult) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        if envelope.algorithm != ALGORITHM {
            return Err(CipherError::UnsupportedAlgorithm(envelope.algorithm.clone()));
        }
        let nonce_bytes = decode_field(&envelope.iv, "iv")?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CipherError::InvalidFormat("iv"));
        }
        let tag_bytes = decode_field(&envelope.tag, "tag")?;
        if tag_bytes.len() != TAG_LEN {
            return Err(CipherError::InvalidFormat("tag"));
        }
        let mut buffer = Zeroizing::new(decode_field(&envelope.encrypted, "encrypted")?);

        let cipher = build_cipher(self.key.as_bytes())?;
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce_bytes),
                self.user_id.as_bytes(),
                &mut buffer,
                Tag::from_slice(&tag_bytes),
            )
            .map_err(|_| CipherError::AeadFailure)?;
        Ok(buffer)
    }
}

fn decode_field(value: &str, field: &'static str) -> Result<Vec<u8>, CipherError> {
    STANDARD
        .decode(value)
        .map_err(|_| CipherError::InvalidFormat(field))
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}
