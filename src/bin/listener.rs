//! sqs-listener: container worker entrypoint
//!
//! Overview
//! --------
//! Boots the consumer runtime: configures logging, builds the SQS client,
//! registers the listeners, and drives the poll → dispatch → settle loop
//! with graceful drain on SIGTERM/SIGINT.
//!
//! Error Model
//! -----------
//! - Startup failures exit 1.
//! - A clean drain exits 0; an exceeded grace period exits 2.
//! - Per-message failures are logged and never terminate the process.

use std::io::IsTerminal;
use std::process;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sqs_listener::client::SqsQueueClient;
use sqs_listener::config::ListenerOverrides;
use sqs_listener::errors::ListenerError;
use sqs_listener::message::{BatchResult, Message};
use sqs_listener::registry::Registry;
use sqs_listener::supervisor::{run_all, RunConfig, Shutdown};

pub fn init_logging() {
    let filter = std::env::var("LOG_LEVEL")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::from_default_env());
    // ANSI only when asked for and stdout is a terminal; CloudWatch
    // renders best without color codes.
    let use_color = std::env::var("LOG_USE_COLOR")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(true)
        && std::io::stdout().is_terminal();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_ansi(use_color))
        .with(ErrorLayer::default())
        .init();
}

/// Default handler: log each JSON payload, fail the ones that do not
/// parse so they redeliver.
async fn handle_batch(messages: Vec<Message>) -> Result<BatchResult, ListenerError> {
    let mut result = BatchResult::ok();
    for msg in &messages {
        let (data, err) = msg.try_json();
        if let Some(err) = err {
            warn!(message_id = %msg.message_id(), error = %err, "invalid JSON payload");
            result.mark_failed(msg.receipt_handle());
            continue;
        }
        info!(message_id = %msg.message_id(), payload = ?data, "processing message");
    }
    Ok(result)
}

#[tokio::main]
async fn main() {
    init_logging();
    info!("listener starting");

    let client = Arc::new(SqsQueueClient::from_env().await);
    let shutdown = Arc::new(Shutdown::new());
    shutdown.listen_for_signals();

    let registry = match Registry::new().add_batch(ListenerOverrides::default(), handle_batch) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "listener registration failed");
            process::exit(1);
        }
    };

    let run_cfg = RunConfig {
        strict: std::env::args().any(|a| a == "--strict"),
        ..RunConfig::default()
    };

    match run_all(client, registry, run_cfg, shutdown).await {
        Ok(outcome) => process::exit(outcome.exit_code()),
        Err(e) => {
            error!(error = %e, "fatal startup error");
            process::exit(1);
        }
    }
}
