//! Logging setup for msgfilter server.
//!
//! Console output is on unless turned off. When a log directory is
//! configured, every event is also written to `msgfilter.log` in that
//! directory, rotated daily, hourly or never. `RUST_LOG` overrides the
//! configured level on both layers.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Name of the log file inside the log directory
pub const LOG_FILE_NAME: &str = "msgfilter.log";

// ---------------------------------------------------------------------------
// Log rotation policy
// ---------------------------------------------------------------------------

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(LogRotation::Daily),
            "hourly" => Ok(LogRotation::Hourly),
            "never" => Ok(LogRotation::Never),
            other => Err(format!("unknown log rotation {:?}", other)),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for the rolling log file; console only when `None`
    pub log_dir: Option<PathBuf>,
    pub level: Level,
    pub console_output: bool,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            level: Level::INFO,
            console_output: true,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Create from application configuration. Unknown levels mean `info`.
    ///
    /// Console output stays on when there is no log directory to write to.
    pub fn from_config(
        log_dir: Option<PathBuf>,
        level: String,
        console_output: bool,
        rotation: LogRotation,
    ) -> Self {
        Self {
            console_output: console_output || log_dir.is_none(),
            log_dir,
            level: level.parse().unwrap_or(Level::INFO),
            rotation,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Logging guard
// ---------------------------------------------------------------------------

/// Keeps the non-blocking file writer alive.
///
/// Dropping it flushes buffered log output, so `main` holds it until exit.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Install the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_filter(config.filter());
        layers.push(Box::new(console_layer));
    }

    if let Some(log_dir) = &config.log_dir {
        std::fs::create_dir_all(log_dir)?;

        let appender = RollingFileAppender::new(config.rotation.into(), log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(config.filter());
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if let Some(log_dir) = &config.log_dir {
        tracing::info!(log_dir = %log_dir.display(), "File logging initialized: {}", LOG_FILE_NAME);
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert_eq!(config.log_dir, None);
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_logging_config_from_config() {
        let config = LoggingConfig::from_config(
            Some(PathBuf::from("/tmp/test-logs")),
            "debug".to_string(),
            false,
            LogRotation::Hourly,
        );
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/test-logs")));
        assert_eq!(config.level, Level::DEBUG);
        assert!(!config.console_output);
        assert_eq!(config.rotation, LogRotation::Hourly);

        let config = LoggingConfig::from_config(None, "loud".to_string(), false, LogRotation::Daily);
        assert_eq!(config.level, Level::INFO);
        assert!(config.console_output);
    }

    #[test]
    fn test_log_rotation_parsing() {
        assert_eq!("daily".parse::<LogRotation>(), Ok(LogRotation::Daily));
        assert_eq!("Hourly".parse::<LogRotation>(), Ok(LogRotation::Hourly));
        assert_eq!(" never ".parse::<LogRotation>(), Ok(LogRotation::Never));
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_log_rotation_conversion() {
        assert!(matches!(Rotation::from(LogRotation::Daily), Rotation::DAILY));
        assert!(matches!(Rotation::from(LogRotation::Hourly), Rotation::HOURLY));
        assert!(matches!(Rotation::from(LogRotation::Never), Rotation::NEVER));
    }
}
