//! AES-256-GCM-SIV payload encryption with the active data key.
//!
//! This module is intentionally free of KMS and session dependencies.
//!
//! # Envelope format
//!
//! ```text
//! { "encrypted": b64(ciphertext), "algorithm": "AES-256-GCM-SIV",
//!   "iv": b64(nonce), "tag": b64(tag) }
//! ```
//!
//! The user id is bound as associated data, so an envelope produced for one
//! user does not decrypt for another even under the same data key.

pub mod cipher;

pub use cipher::{CipherError, CryptoEngine, ALGORITHM, KEY_LEN};
