//! Common types, protocol definitions, and errors shared across the `envelope-client` crates.

pub mod context;
pub mod error;
pub mod protocol;

pub use context::EncryptionContext;
pub use error::ClientError;
