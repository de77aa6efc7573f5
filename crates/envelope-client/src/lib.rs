//! Client-side envelope encryption.
//!
//! An [`EnvelopeClient`] holds one KMS-generated data key per user session and
//! uses it to seal payloads with AES-256-GCM-SIV, binding every ciphertext to
//! the user id. Data keys are cached by encrypted form and encryption context
//! so repeated decryptions avoid KMS round trips.

pub mod client;
pub mod config;
pub mod crypto;
pub mod dek;
pub mod kms;
pub mod session;
pub mod telemetry;

pub use client::{ClientOptions, EnvelopeClient, LifecycleState};
pub use common::protocol::{CacheStats, ClientStatus, EncryptionResult, HealthReport};
pub use common::{ClientError, EncryptionContext};
pub use kms::{KmsClient, KmsError};
pub use session::{SessionContext, SessionStore};
