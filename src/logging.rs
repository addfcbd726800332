//! `tracing-subscriber` setup.
//!
//! Everything goes to stderr so `rs-onyx ids` and `rs-onyx status` keep a
//! clean stdout. `RUST_LOG`, when set, replaces the configured level.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config, std::env::var("RUST_LOG").ok())?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .context("Failed to initialize logging")
}

/// Our crate at the configured level, noisy dependencies at warn.
fn build_filter(config: &LoggingConfig, env: Option<String>) -> Result<EnvFilter> {
    let directives = match env.filter(|s| !s.trim().is_empty()) {
        Some(env) => env,
        None => format!(
            "{lib}={level},rs_onyx={level},h2=warn,hyper=warn,reqwest=warn,sqlx=warn",
            lib = env!("CARGO_CRATE_NAME"),
            level = config.level.trim()
        ),
    };
    EnvFilter::try_new(&directives).with_context(|| format!("Invalid log filter: {}", directives))
}
