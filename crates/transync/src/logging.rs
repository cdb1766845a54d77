//! Tracing subscriber setup.
//!
//! Respects `RUST_LOG` (default `info`). `log` records from the storage
//! layer are bridged into the same subscriber.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (compact_layer, json_layer) = match format {
        LogFormat::Compact => (
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .compact(),
            ),
            None,
        ),
        LogFormat::Json => (None, Some(fmt::layer().with_writer(std::io::stderr).json())),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(compact_layer)
        .with(json_layer);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }
    let _ = tracing_log::LogTracer::init();

    tracing::debug!(?format, "Logging initialized");
}
