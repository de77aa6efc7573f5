//! Data key lifecycle: KMS generation and decryption, in-memory caching, and
//! the single active key of a session.
//!
//! # Lifecycle
//!
//! 1. [`KeyManager::generate_data_key`] asks the KMS for a key bound to a
//!    fresh encryption context and caches it. The key is then installed as the
//!    active key, either by [`KeyManager::generate_new_data_key`] or by the
//!    client together with the session it belongs to.
//! 2. [`KeyManager::decrypt_data_key`] serves previously seen encrypted keys
//!    from the [`DataKeyCache`], falling back to the KMS on a miss.
//! 3. Rotation and cleanup retire the active key; retired keys are wiped.
//!
//! # Security invariants
//!
//! - Plaintext keys are **never** written to disk, logged, or included in traces.
//! - Every buffer holding a plaintext key is a [`DekBytes`] and is zeroed on drop.

pub mod cache;
pub mod key;
pub mod manager;

pub use cache::{CacheConfig, CacheError, DataKeyCache, CACHE_TTL, MAX_CACHE_SIZE};
pub use key::{DataKey, DekBytes, DekError};
pub use manager::KeyManager;
