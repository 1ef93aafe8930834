//! Structured logging setup, mirroring this workspace's `logging::init` helper.

use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("invalid log format '{s}', expected 'plain' or 'json'"),
        }
    }
}

/// Initialize the global tracing subscriber. Call once, at process start.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default());

    match format {
        LogFormat::Plain => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).init(),
    }

    replace_panic_hook_with_tracing_panic_hook();
    Ok(())
}

/// Route panics through `tracing::error!` so they show up in structured logs
/// instead of raw stderr, matching this workspace's startup sequence.
fn replace_panic_hook_with_tracing_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("{panic_info}");
        default_hook(panic_info);
    }));
}
