//! Log subscriber setup for the `hwctl` binary and embedding applications.
//!
//! Everything in the crate logs through `tracing` macros; this module only
//! installs a `tracing-subscriber` fmt layer. The configured level applies to
//! this crate, other crates are held at `warn`. `RUST_LOG`, when set, replaces
//! the whole filter.
//!
//! ```no_run
//! use rust_hwctl::{config::AppConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(instrument = "PSU", "ready");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use crate::error::{HwError, HwResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Targets that follow the configured level.
const CRATE_TARGETS: [&str; 2] = ["rust_hwctl", "hwctl"];

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored; for a terminal.
    Pretty,
    /// One line per event, no colors.
    #[default]
    Compact,
    /// One JSON object per event, with the current span's fields.
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for this crate.
    pub level: Level,
    /// Rendering.
    pub format: OutputFormat,
    /// Also log span open/close (exposer sessions).
    pub span_events: bool,
}

impl LoggingConfig {
    /// Compact output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            span_events: false,
        }
    }

    /// Settings from the `[application]` table.
    pub fn from_app_config(config: &AppConfig) -> HwResult<Self> {
        Ok(Self {
            format: config.application.log_format,
            ..Self::new(parse_log_level(&config.application.log_level)?)
        })
    }

    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_lowercase();
        CRATE_TARGETS
            .iter()
            .fold("warn".to_string(), |acc, target| format!("{},{}={}", acc, target, level))
    }
}

/// Install the subscriber described by the `[application]` table.
pub fn init_from_config(config: &AppConfig) -> HwResult<()> {
    init(LoggingConfig::from_app_config(config)?)
}

/// Install the global subscriber. Does nothing if one is already installed.
pub fn init(config: LoggingConfig) -> HwResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer().with_span_events(span_events);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| HwError::Configuration(format!("cannot install log subscriber: {}", e)))
}

/// `trace`, `debug`, `info`, `warn` or `error`, case-insensitive.
pub fn parse_log_level(level: &str) -> HwResult<Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(HwError::Configuration(format!(
            "Invalid log level '{}' (expected trace, debug, info, warn or error)",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("verbose"),
            Err(HwError::Configuration(msg)) if msg.contains("verbose")
        ));
    }

    #[test]
    fn test_directives_scope_level_to_crate() {
        assert_eq!(
            LoggingConfig::new(Level::DEBUG).directives(),
            "warn,rust_hwctl=debug,hwctl=debug"
        );
    }

    #[test]
    fn test_from_app_config() {
        let mut app = AppConfig::default();
        app.application.log_level = "TRACE".into();
        app.application.log_format = OutputFormat::Json;

        let logging = LoggingConfig::from_app_config(&app).unwrap();
        assert_eq!(logging.level, Level::TRACE);
        assert_eq!(logging.format, OutputFormat::Json);
        assert!(!logging.span_events);

        app.application.log_level = "loud".into();
        assert!(LoggingConfig::from_app_config(&app).is_err());
    }
}
