//! Logging setup shared by the library consumers and the operator CLI
//!
//! Output always goes to stderr so that command output on stdout stays
//! pipeable. The format and level are read from `AUTOPOST_LOG_FORMAT` and
//! `AUTOPOST_LOG_LEVEL`; `RUST_LOG` still wins when it is set.
//!
//! ```no_run
//! use libautopost::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "debug").init();
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const FORMAT_ENV: &str = "AUTOPOST_LOG_FORMAT";
pub const LEVEL_ENV: &str = "AUTOPOST_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain single-line output
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line with colors
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>) -> Self {
        Self {
            format,
            level: level.into(),
        }
    }

    /// Read the configuration from the environment
    ///
    /// Unknown formats fall back to text, a missing level to `info`.
    pub fn from_env() -> Self {
        let format = std::env::var(FORMAT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let level = std::env::var(LEVEL_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());

        Self { format, level }
    }

    /// Install the global subscriber
    ///
    /// Returns `false` when a subscriber was already installed, which happens
    /// when several tests in one binary initialize logging.
    pub fn init(&self) -> bool {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(false)
                .try_init(),
        };

        result.is_ok()
    }
}

/// Initialize logging from `AUTOPOST_LOG_FORMAT` / `AUTOPOST_LOG_LEVEL`
pub fn init_default() -> bool {
    LoggingConfig::from_env().init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" PRETTY ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);

        let result = "syslog".parse::<LogFormat>();
        assert!(result.unwrap_err().contains("Invalid log format: 'syslog'"));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::remove_var(FORMAT_ENV);
        std::env::remove_var(LEVEL_ENV);

        let config = LoggingConfig::from_env();
        assert_eq!(config, LoggingConfig::new(LogFormat::Text, "info"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_both_variables() {
        std::env::set_var(FORMAT_ENV, "json");
        std::env::set_var(LEVEL_ENV, "libautopost=debug");

        let config = LoggingConfig::from_env();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "libautopost=debug");

        std::env::remove_var(FORMAT_ENV);
        std::env::remove_var(LEVEL_ENV);
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_unknown_format() {
        std::env::set_var(FORMAT_ENV, "xml");
        assert_eq!(LoggingConfig::from_env().format, LogFormat::Text);
        std::env::remove_var(FORMAT_ENV);
    }

    #[test]
    fn test_second_init_reports_already_installed() {
        let config = LoggingConfig::new(LogFormat::Text, "warn");
        config.init();
        assert!(!config.init());
    }
}
