//! Drover consumer runtime.
//!
//! Container entrypoint: builds a listener for `QUEUE_URL` from the
//! environment, runs it until SIGTERM/SIGINT, and drains gracefully.
//!
//! The handler registered here logs each message body; it exists to
//! smoke-test a deployment (queue reachability, IAM, redrive policy)
//! before an application links the runtime crates and registers its own
//! handlers.
//!
//! ## Environment
//!
//! - `QUEUE_URL` (required): the queue to consume
//! - `MODE`: `batch` (default) or `per_message`
//! - `WAIT_TIME`, `BATCH_SIZE`, `VISIBILITY_SECS`, `MAX_EXTEND`,
//!   `WORKER_THREADS`, `IDLE_SLEEP_MAX`: listener knobs
//! - `GRACE_PERIOD`: drain grace in seconds (default 60)
//! - `SQS_ENDPOINT_URL`: override for LocalStack-style emulators
//! - `LOG_FORMAT`, `LOG_LEVEL`, `LOG_USE_COLOR`: logging
//!
//! ## Exit codes
//!
//! 0 on clean shutdown, 1 on a fatal startup error, 2 when the grace
//! period expired with work still in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::signal;
use tracing::info;

use drover_common::logging::{init_logging, LogOptions};
use drover_common::{BatchResult, Message};
use drover_consumer::{
    BatchHandler, Handler, Listener, ListenerConfig, MessageHandler, Registry, ShutdownToken,
    Supervisor, SupervisorOptions,
};
use drover_queue::sqs::SqsQueueClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present, for local development against an emulator.
    let _ = dotenvy::dotenv();

    init_logging(&LogOptions::from_env());

    let strict_startup = std::env::args().any(|arg| arg == "--strict");

    let queue_url = std::env::var("QUEUE_URL").context("QUEUE_URL is required")?;
    let mode = std::env::var("MODE").unwrap_or_else(|_| "batch".to_string());

    let config = ListenerConfig::builder()
        .build()
        .context("invalid listener configuration")?;

    let grace_period = std::env::var("GRACE_PERIOD")
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| SupervisorOptions::default().grace_period);

    info!(
        queue_url = %queue_url,
        mode = %mode,
        workers = config.worker_threads,
        batch_size = config.batch_size,
        visibility_seconds = config.visibility_timeout_seconds,
        max_extend_seconds = config.max_extend_seconds,
        grace_seconds = grace_period.as_secs(),
        strict = strict_startup,
        "starting drover"
    );

    let sqs_client = build_sqs_client().await;
    let client = Arc::new(SqsQueueClient::new(sqs_client));

    let handler = match mode.as_str() {
        "batch" => Handler::Batch(Arc::new(LogHandler)),
        "per_message" => Handler::PerMessage(Arc::new(LogHandler)),
        other => anyhow::bail!("unknown MODE {other:?}, expected \"batch\" or \"per_message\""),
    };

    let registry = Registry::new().listener(Listener {
        queue_url,
        handler,
        config,
    });

    let supervisor = Supervisor::with_options(
        client,
        registry,
        SupervisorOptions {
            grace_period,
            strict_startup,
        },
    );

    let shutdown = supervisor.shutdown_token();
    tokio::spawn(drain_on_signal(shutdown));

    let outcome = supervisor.run_all().await?;
    info!(exit_code = outcome.exit_code(), "drover stopped");
    std::process::exit(outcome.exit_code());
}

async fn build_sqs_client() -> aws_sdk_sqs::Client {
    // SQS_ENDPOINT_URL points the client at a compatible emulator for local
    // development; unset, the default AWS endpoint resolution applies.
    match std::env::var("SQS_ENDPOINT_URL") {
        Ok(endpoint_url) if !endpoint_url.is_empty() => {
            info!(endpoint = %endpoint_url, "using custom SQS endpoint");
            let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .endpoint_url(&endpoint_url)
                .load()
                .await;
            aws_sdk_sqs::Client::new(&config)
        }
        _ => {
            let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            aws_sdk_sqs::Client::new(&config)
        }
    }
}

/// Wait for a termination signal, then ask the supervisor to drain.
///
/// Handlers are not cancelled by the drain; they run to completion within
/// the supervisor's grace period.
async fn drain_on_signal(shutdown: ShutdownToken) {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => info!(signal = "SIGINT", "termination signal received, draining"),
            _ = sigterm.recv() => info!(signal = "SIGTERM", "termination signal received, draining"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!(signal = "SIGINT", "termination signal received, draining");
    }

    shutdown.drain();
}

/// Logs every message it sees and settles it as handled.
struct LogHandler;

#[async_trait]
impl BatchHandler for LogHandler {
    async fn handle(&self, messages: &[Message]) -> Result<BatchResult> {
        for message in messages {
            log_message(message);
        }
        Ok(BatchResult::ok())
    }
}

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, message: &Message) -> Result<bool> {
        log_message(message);
        Ok(true)
    }
}

fn log_message(message: &Message) {
    match message.try_json() {
        Some(json) => info!(
            message_id = %message.message_id(),
            body = %json,
            attributes = message.attributes().len(),
            "received message"
        ),
        None => info!(
            message_id = %message.message_id(),
            body = %message.body(),
            attributes = message.attributes().len(),
            "received non-JSON message"
        ),
    }
}
