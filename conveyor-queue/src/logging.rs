//! Environment-configured log output.
//!
//! Library code only emits `tracing` events; call [`init`] from a binary
//! to print them.
//!
//! - `CONVEYOR_LOG` - filter directive (default `info`)
//! - `CONVEYOR_DEBUG=1` - shorthand for `CONVEYOR_LOG=debug`
//! - `CONVEYOR_LOG_FORMAT=json|pretty|compact` - output format (default `json`)

use std::env;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Multi-line, human readable
    Pretty,
    /// Single-line, human readable
    Compact,
}

impl LogFormat {
    /// Parse a format name, case-insensitively.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `conveyor_queue=debug`
    pub filter: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Read the configuration from the environment.
    pub fn from_env() -> Self {
        let debug = env::var("CONVEYOR_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let filter = env::var("CONVEYOR_LOG")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        let format = env::var("CONVEYOR_LOG_FORMAT")
            .ok()
            .and_then(|s| LogFormat::from_name(&s))
            .unwrap_or_default();

        Self { filter, format }
    }
}

/// Install a global subscriber configured from the environment.
///
/// Returns `false` when a subscriber was already installed, by this
/// function or by the host application.
pub fn init() -> bool {
    init_with(&LogConfig::from_env())
}

/// Install a global subscriber with `config`.
pub fn init_with(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };

    installed.is_ok()
}
