//! Tracing initialisation.
//!
//! One `fmt` layer (pretty, compact or JSON) behind an `EnvFilter`. `RUST_LOG` overrides the
//! configured level when set.
//!
//! # Example
//! ```no_run
//! use servo_line::{config::LineConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LineConfig::load_validated("line.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!(line = %config.application.name, "Line starting");
//! # Ok(())
//! # }
//! ```

use crate::config::LineConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored (for development)
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// JSON objects (for log aggregation)
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted.
    pub level: Level,
    /// Line format.
    pub format: OutputFormat,
    /// Emit span open/close events (request spans from `#[instrument]`)
    pub with_span_events: bool,
    /// Include source locations.
    pub with_file_and_line: bool,
    /// Include thread names.
    pub with_thread_names: bool,
    /// Only honoured by the pretty format
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Settings from the `[application]` table of a line configuration.
    pub fn from_line_config(config: &LineConfig) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Override the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber from a line configuration.
pub fn init_from_config(config: &LineConfig) -> Result<(), String> {
    init(LoggingConfig::from_line_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`, which keeps it safe
/// to call from tests and from embedding applications.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // expected in tests and when the host application set up tracing first
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {}", e)),
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_from_line_config() {
        let mut line = LineConfig::default();
        line.application.log_level = "error".to_string();
        let config = LoggingConfig::from_line_config(&line).unwrap();
        assert_eq!(config.level, Level::ERROR);
        assert_eq!(config.format, OutputFormat::Pretty);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config.with_format(OutputFormat::Json)).is_ok());
    }
}
