//! Logging setup and span helpers

use std::io;
use std::str::FromStr;
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-oriented output
    #[default]
    Pretty,
    /// Single-line, human-oriented output
    Compact,
    /// One JSON object per line, for log collectors
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unknown log format '{}', expected pretty, compact or json",
                other
            )),
        }
    }
}

/// Initialize the global subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence over `default_level`. Only the first call has
/// any effect.
pub fn init_logging(format: LogFormat, default_level: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(io::stderr))
                    .init();
            }
            LogFormat::Compact => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().compact().with_writer(io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(io::stderr))
                    .init();
            }
        }
    });
}

/// Span covering the ingestion of one date folder
#[must_use]
pub fn date_span(date: &str) -> Span {
    tracing::info_span!("ingest_date", date = date)
}

/// Span covering one participant folder
#[must_use]
pub fn folder_span(folder: &str) -> Span {
    tracing::info_span!("participant_folder", folder = folder)
}
