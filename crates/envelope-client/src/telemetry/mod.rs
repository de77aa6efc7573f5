//! Tracing setup: structured JSON logs, plus OTLP span export when configured.
//!
//! # Telemetry invariants
//!
//! - **No key material or auth tokens** may appear in any span attribute or
//!   log field. Key types redact themselves in `Debug` output.
//! - Log level is configurable via `ENVELOPE_LOG_LEVEL` (default: `info`), and
//!   `RUST_LOG` takes precedence when set.

pub mod init;

pub use init::init_telemetry;
