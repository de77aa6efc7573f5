//! `envelope-client` command-line entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`ClientConfig`] from environment variables.
//! 2. Initialise telemetry (JSON logs on stderr, optional OTLP export).
//! 3. Build the AWS KMS client and the file-backed session store.
//! 4. Initialise the [`EnvelopeClient`] for the configured user.
//! 5. Run the requested command, then wipe all key material.
//!
//! Commands:
//! - `encrypt`: read stdin line by line and print one JSON envelope per line.
//! - `decrypt`: read JSON envelopes line by line and print the plaintexts.
//! - `health` (default): print a JSON health report.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use envelope_client::config::ClientConfig;
use envelope_client::kms::AwsKmsClient;
use envelope_client::session::FileSessionStore;
use envelope_client::{EncryptionResult, EnvelopeClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Encrypt,
    Decrypt,
    Health,
}

impl Command {
    fn parse(arg: Option<&str>) -> Result<Self> {
        match arg {
            Some("encrypt") => Ok(Self::Encrypt),
            Some("decrypt") => Ok(Self::Decrypt),
            Some("health") | None => Ok(Self::Health),
            Some(other) => anyhow::bail!("unknown command {other:?} (expected encrypt, decrypt or health)"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let arg = std::env::args().nth(1);
    let command = Command::parse(arg.as_deref())?;

    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = ClientConfig::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    envelope_client::telemetry::init_telemetry(
        cfg.otel_exporter_otlp_endpoint.as_deref(),
        &cfg.log_level,
    )?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?command,
        "envelope-client starting"
    );

    // -----------------------------------------------------------------------
    // 3. Collaborators
    // -----------------------------------------------------------------------
    let kms = AwsKmsClient::init(&cfg.kms_key_id, cfg.kms_endpoint_url.as_deref()).await?;
    let sessions = FileSessionStore::new(&cfg.session_store_path);
    let client = EnvelopeClient::new(Arc::new(kms), Arc::new(sessions), cfg.client_options());

    // -----------------------------------------------------------------------
    // 4. Session + first data key
    // -----------------------------------------------------------------------
    let outcome = match client
        .initialize(&cfg.user_id, cfg.auth_token.clone())
        .await
    {
        Ok(()) => run(&client, command).await,
        Err(e) => Err(e.into()),
    };

    // -----------------------------------------------------------------------
    // 5. Cleanup, whatever happened above
    // -----------------------------------------------------------------------
    client.cleanup(false).await;

    if let Err(e) = &outcome {
        error!(error = %e, "envelope-client failed");
    }
    outcome
}

async fn run(client: &EnvelopeClient, command: Command) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    match command {
        Command::Health => {
            let report = client.health_check().await;
            let json = serde_json::to_string_pretty(&report)?;
            stdout.write_all(json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        Command::Encrypt => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let envelope = client.encrypt(&line).await?;
                let json = serde_json::to_string(&envelope)?;
                stdout.write_all(json.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
        }
        Command::Decrypt => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut line_no = 0usize;
            while let Some(line) = lines.next_line().await? {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let envelope: EncryptionResult = serde_json::from_str(&line)
                    .with_context(|| format!("line {line_no} is not a JSON envelope"))?;
                let plaintext = client.decrypt(&envelope).await?;
                stdout.write_all(plaintext.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
        }
    }
    stdout.flush().await?;

    let stats = client.cache_stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate,
        "command finished"
    );
    Ok(())
}
