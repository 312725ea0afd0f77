//! Logging setup shared by the Cadence binaries
//!
//! Output goes to stderr so stdout stays clean for command results. The
//! format and level come from the `[logging]` config section and may be
//! overridden with `CADENCE_LOG_FORMAT` and `CADENCE_LOG_LEVEL`; `RUST_LOG`
//! still wins for per-module filtering.
//!
//! ```no_run
//! use libcadence::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "info".to_string(), false).init();
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain lines without colors
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line colored output for development
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
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        f.write_str(name)
    }
}

pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Build from the config file section, then apply environment overrides.
    ///
    /// An unparseable format in the file falls back to text.
    pub fn from_section(section: &LoggingSection, verbose: bool) -> Self {
        let format = std::env::var("CADENCE_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .or_else(|| section.format.parse().ok())
            .unwrap_or(LogFormat::Text);

        let level = std::env::var("CADENCE_LOG_LEVEL").unwrap_or_else(|_| section.level.clone());

        Self::new(format, level, verbose)
    }

    fn filter(&self) -> EnvFilter {
        let fallback = if self.verbose { "debug" } else { &self.level };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    }

    /// Install the global subscriber.
    ///
    /// A second call is a no-op; the first subscriber stays in place.
    pub fn init(&self) {
        let filter = self.filter();

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

        if result.is_err() {
            tracing::debug!("logging already initialized");
        }
    }
}

/// Initialize logging from environment variables only
pub fn init_default() {
    LoggingConfig::from_section(&LoggingSection::default(), false).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_from_str_invalid() {
        let err = "xml".parse::<LogFormat>().unwrap_err();
        assert!(err.contains("Invalid log format: 'xml'"));
    }

    #[test]
    fn test_log_format_display() {
        assert_eq!(LogFormat::Json.to_string(), "json");
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
    }

    #[test]
    #[serial]
    fn test_from_section_env_override() {
        std::env::set_var("CADENCE_LOG_FORMAT", "json");
        std::env::set_var("CADENCE_LOG_LEVEL", "warn");

        let config = LoggingConfig::from_section(&LoggingSection::default(), false);

        std::env::remove_var("CADENCE_LOG_FORMAT");
        std::env::remove_var("CADENCE_LOG_LEVEL");

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "warn");
    }

    #[test]
    #[serial]
    fn test_from_section_bad_format_falls_back_to_text() {
        std::env::remove_var("CADENCE_LOG_FORMAT");
        std::env::remove_var("CADENCE_LOG_LEVEL");
        let section = LoggingSection {
            format: "fancy".to_string(),
            level: "debug".to_string(),
        };

        let config = LoggingConfig::from_section(&section, true);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "debug");
        assert!(config.verbose);
    }
}
