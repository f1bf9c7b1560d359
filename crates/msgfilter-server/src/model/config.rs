//! Configuration management for msgfilter server
//!
//! Values come from `conf/application.yml` (optional), then environment
//! variables, then command line flags. Invalid values fall back to their
//! defaults with a warning instead of failing startup.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use msgfilter_checker::{CheckerConfig, MutexOptions};
use msgfilter_common::{
    DEFAULT_DATA_TTL_SECS, DEFAULT_ETCD_ENDPOINT, DEFAULT_LISTEN_PORT, DEFAULT_LOCK_TTL_SECS,
    DEFAULT_MUTEX_TTL_SECS, DEFAULT_RETRY_ATTEMPTS,
};
use msgfilter_store::MEMORY_SCHEME;
use regex::Regex;
use tracing::warn;

use crate::startup::{LogRotation, LoggingConfig};

pub const LISTEN_ADDRESS: &str = "listen_address";
pub const LISTEN_PORT: &str = "listen_port";
pub const ETCD_ENDPOINT: &str = "etcd_endpoint";
pub const LOCK_TTL: &str = "lock_ttl";
pub const DATA_TTL: &str = "data_ttl";
pub const LOCK_RETRY: &str = "lock_retry";
pub const UNLOCK_RETRY: &str = "unlock_retry";
pub const LOCK_DEFAULT_TTL: &str = "lock_default_ttl";
pub const LOCK_WAIT_TIMEOUT: &str = "lock_wait_timeout";
pub const STORE_REQUEST_TIMEOUT_MS: &str = "store_request_timeout_ms";
pub const LOG_LEVEL: &str = "log_level";
pub const LOG_DIR: &str = "log_dir";
pub const LOG_ROTATION: &str = "log_rotation";
pub const LOG_CONSOLE: &str = "log_console";

const DEFAULT_CONFIG_FILE: &str = "conf/application";
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_STORE_REQUEST_TIMEOUT_MS: i64 = 1000;

static ENDPOINT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://[^/]+:(\d+)/?$").expect("Invalid regex pattern")
});

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command(name = "msgfilter-server", about = "Distributed duplicate message filter")]
pub struct Cli {
    /// Configuration file, without extension
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,
    #[arg(short = 'p', long = "port", allow_hyphen_values = true)]
    port: Option<String>,
    #[arg(long = "etcd-endpoint")]
    etcd_endpoint: Option<String>,
    #[arg(long = "lock-ttl", allow_hyphen_values = true)]
    lock_ttl: Option<String>,
    #[arg(long = "data-ttl", allow_hyphen_values = true)]
    data_ttl: Option<String>,
}

/// Application configuration loaded from config files, environment and flags
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    /// Load from the process arguments and environment.
    pub fn new() -> anyhow::Result<Self> {
        Self::from_args(std::env::args_os())
    }

    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;

        let mut builder = Config::builder()
            .add_source(File::with_name(&cli.config_file).required(false))
            .add_source(Environment::default().try_parsing(true));

        let overrides = [
            (LISTEN_PORT, cli.port),
            (ETCD_ENDPOINT, cli.etcd_endpoint),
            (LOCK_TTL, cli.lock_ttl),
            (DATA_TTL, cli.data_ttl),
        ];
        for (key, value) in overrides {
            if let Some(value) = value {
                builder = builder.set_override(key, value)?;
            }
        }

        Ok(Self::from_config(builder.build()?))
    }

    pub fn from_config(config: Config) -> Self {
        Configuration { config }
    }

    // ========================================================================
    // Server Configuration
    // ========================================================================

    pub fn listen_address(&self) -> String {
        self.config
            .get_string(LISTEN_ADDRESS)
            .unwrap_or(DEFAULT_LISTEN_ADDRESS.to_string())
    }

    pub fn listen_port(&self) -> u16 {
        self.bounded(
            LISTEN_PORT,
            1,
            u16::MAX as i64,
            DEFAULT_LISTEN_PORT as i64,
        ) as u16
    }

    // ========================================================================
    // Store Configuration
    // ========================================================================

    /// etcd endpoint, or a `memory://` endpoint for a standalone instance
    pub fn etcd_endpoint(&self) -> String {
        let Ok(endpoint) = self.config.get_string(ETCD_ENDPOINT) else {
            return DEFAULT_ETCD_ENDPOINT.to_string();
        };

        if endpoint.starts_with(MEMORY_SCHEME) || is_valid_etcd_endpoint(&endpoint) {
            endpoint
        } else {
            warn!(
                "Invalid {} {:?}, using default {}",
                ETCD_ENDPOINT, endpoint, DEFAULT_ETCD_ENDPOINT
            );
            DEFAULT_ETCD_ENDPOINT.to_string()
        }
    }

    pub fn store_request_timeout(&self) -> Duration {
        let millis = self.bounded(
            STORE_REQUEST_TIMEOUT_MS,
            1,
            i64::MAX,
            DEFAULT_STORE_REQUEST_TIMEOUT_MS,
        );
        Duration::from_millis(millis as u64)
    }

    // ========================================================================
    // Checker Configuration
    // ========================================================================

    pub fn lock_ttl(&self) -> u64 {
        self.bounded(LOCK_TTL, 0, i64::MAX, DEFAULT_LOCK_TTL_SECS as i64) as u64
    }

    pub fn data_ttl(&self) -> u64 {
        self.bounded(DATA_TTL, 0, i64::MAX, DEFAULT_DATA_TTL_SECS as i64) as u64
    }

    pub fn lock_retry(&self) -> u32 {
        self.bounded(
            LOCK_RETRY,
            1,
            u32::MAX as i64,
            DEFAULT_RETRY_ATTEMPTS as i64,
        ) as u32
    }

    pub fn unlock_retry(&self) -> u32 {
        self.bounded(
            UNLOCK_RETRY,
            1,
            u32::MAX as i64,
            DEFAULT_RETRY_ATTEMPTS as i64,
        ) as u32
    }

    pub fn lock_default_ttl(&self) -> Duration {
        let secs = self.bounded(
            LOCK_DEFAULT_TTL,
            1,
            i64::MAX,
            DEFAULT_MUTEX_TTL_SECS as i64,
        );
        Duration::from_secs(secs as u64)
    }

    /// Deadline for acquiring a contended lock; `None` when set to 0
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        let secs = self.bounded(LOCK_WAIT_TIMEOUT, 0, i64::MAX, 0);
        (secs > 0).then(|| Duration::from_secs(secs as u64))
    }

    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig {
            endpoint: self.etcd_endpoint(),
            lock_ttl: self.lock_ttl(),
            data_ttl: self.data_ttl(),
            mutex: MutexOptions {
                max_attempts: self.lock_retry(),
                unlock_attempts: self.unlock_retry(),
                default_ttl: self.lock_default_ttl(),
                acquire_timeout: self.lock_wait_timeout(),
            },
        }
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn log_level(&self) -> String {
        self.config
            .get_string(LOG_LEVEL)
            .unwrap_or("info".to_string())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.config
            .get_string(LOG_DIR)
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
    }

    /// Rolling file policy: `daily`, `hourly` or `never`
    pub fn log_rotation(&self) -> LogRotation {
        let Ok(value) = self.config.get_string(LOG_ROTATION) else {
            return LogRotation::Daily;
        };
        value.parse().unwrap_or_else(|e| {
            warn!("Invalid {}: {}, using daily", LOG_ROTATION, e);
            LogRotation::Daily
        })
    }

    pub fn log_console(&self) -> bool {
        self.config.get_bool(LOG_CONSOLE).unwrap_or(true)
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.log_dir(),
            self.log_level(),
            self.log_console(),
            self.log_rotation(),
        )
    }

    /// Integer value of `key` if it lies in `min..=max`, otherwise `default`
    fn bounded(&self, key: &str, min: i64, max: i64, default: i64) -> i64 {
        match self.config.get_int(key) {
            Ok(value) if (min..=max).contains(&value) => value,
            Ok(value) => {
                warn!("{} {} out of range, using default {}", key, value, default);
                default
            }
            Err(config::ConfigError::NotFound(_)) => default,
            Err(e) => {
                warn!("Invalid {}: {}, using default {}", key, e, default);
                default
            }
        }
    }
}

/// `http(s)://host:port` with a port in 1..=65535
fn is_valid_etcd_endpoint(endpoint: &str) -> bool {
    ENDPOINT_REGEX
        .captures(endpoint)
        .and_then(|captures| captures.get(1))
        .and_then(|port| port.as_str().parse::<u32>().ok())
        .is_some_and(|port| (1..=65535).contains(&port))
}
