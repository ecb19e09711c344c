//! Structured logging for the consumer runtime.
//!
//! Runtime events carry structured fields (queue_url, receipt_handle,
//! poller) and are formatted either as JSON lines for log aggregation or
//! as text for a terminal. All knobs resolve from the environment once,
//! into [`LogOptions`], so the binary can inspect and log its effective
//! logging configuration.
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: "json" for JSON lines, anything else for text
//! - `LOG_LEVEL`: filter directive, e.g. `debug` or `drover_consumer=trace`
//!   (falls back to `RUST_LOG`, then "info")
//! - `LOG_USE_COLOR`: force ANSI color on ("1"/"true"/"yes") or off
//!   ("0"/"false"/"no"); unset or unrecognized, color follows whether
//!   stdout is a terminal

use std::io::IsTerminal;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resolved logging configuration.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Filter directive, e.g. "info" or "drover_consumer=debug".
    pub directive: String,
    /// ANSI color in text mode.
    pub color: bool,
}

impl LogOptions {
    /// Resolve the options from the environment.
    pub fn from_env() -> Self {
        let json = std::env::var("LOG_FORMAT")
            .map(|value| value.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let directive = std::env::var("LOG_LEVEL")
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| std::env::var("RUST_LOG").ok().filter(|value| !value.is_empty()))
            .unwrap_or_else(|| "info".to_string());
        let color = std::env::var("LOG_USE_COLOR")
            .ok()
            .and_then(|value| parse_color(&value))
            .unwrap_or_else(|| std::io::stdout().is_terminal());
        Self {
            json,
            directive,
            color,
        }
    }
}

/// Install the global subscriber. Call once, before the runtime starts.
pub fn init_logging(options: &LogOptions) {
    let filter =
        EnvFilter::try_new(&options.directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if options.json {
        // Flattened events keep the structured fields at the top level of
        // each line, where log pipelines index them.
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(options.color))
            .init();
    }
}

fn parse_color(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
