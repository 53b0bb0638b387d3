//! # Structured Logging Module
//!
//! Environment-aware structured logging for the worker. Containers get JSON
//! lines; terminals get the pretty formatter with ANSI colours.
//!
//! `RUST_LOG` always wins over the configured level. Initialization happens
//! once per process and never panics when a global subscriber already exists
//! (tests, embedders).

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing for the process
pub fn init_tracing(config: &LoggingConfig, environment: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let level = config
            .level
            .clone()
            .unwrap_or_else(|| default_level(environment).to_string());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

        let registry = tracing_subscriber::registry().with(filter);
        let result = match config.format {
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_current_span(true)
                        .with_span_list(false),
                )
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_ansi(std::io::stdout().is_terminal()),
                )
                .try_init(),
        };

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            environment = %environment,
            level = %level,
            format = ?config.format,
            "Structured logging initialized"
        );
    });
}

/// Log level used when neither `RUST_LOG` nor `logging.level` is set
pub fn default_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}
