//! Per-environment configuration for libris services.
//!
//! One JSON file per environment (`config_dev.json`, `config_staging.json`,
//! `config_prod.json`), selected by the `ENVIRONMENT` variable. Every field
//! is optional in the file and overlays the built-in defaults. A missing
//! file falls back to defaults with a warning; a malformed file is a fatal
//! startup error.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Deployment environment, selected by `ENVIRONMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Read `ENVIRONMENT`, defaulting to `dev`. Unknown values fall back
    /// to `dev` with a warning rather than failing startup.
    pub fn from_env() -> Self {
        match std::env::var("ENVIRONMENT").as_deref() {
            Ok("staging") => Environment::Staging,
            Ok("prod") => Environment::Prod,
            Ok("dev") | Err(_) => Environment::Dev,
            Ok(other) => {
                warn!(value = other, "unknown ENVIRONMENT, using dev");
                Environment::Dev
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    /// Config file name for this environment.
    pub fn config_file(&self) -> String {
        format!("config_{}.json", self.as_str())
    }
}

/// Errors raised while loading configuration. Both are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Instance configuration. All durations are plain numbers in the JSON
/// file (seconds unless noted) and exposed as [`Duration`] accessors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Environment label echoed in reports and the service banner.
    pub environment: String,

    /// Number of batch workers draining the reservation queue.
    pub worker_threads: usize,

    /// Artificial per-reservation delay in seconds (0 disables).
    pub processing_delay: f64,

    /// Default log level when `RUST_LOG` is not set.
    pub log_level: String,

    /// LRU capacity of the book-availability cache.
    pub cache_size: usize,

    /// Connections opened eagerly at pool construction.
    pub min_connections: usize,

    /// Hard upper bound on open connections.
    pub max_connections: usize,

    /// Seconds a caller waits for a pooled connection before failing.
    pub acquire_timeout: f64,

    /// Seconds between queue drains.
    pub batch_interval: f64,

    /// Maximum entries drained per batch tick.
    pub batch_size: usize,

    /// Reservation queue bound; enqueues beyond it are rejected.
    pub max_queue: usize,

    /// Attempts before a transiently failing reservation goes terminal.
    pub max_retries: u32,

    /// Rolling latency window size. Values below 1024 are clamped up.
    pub latency_window: usize,

    /// Seconds between uptime self-heartbeats.
    pub heartbeat_interval: f64,

    /// Seconds between queue-depth samples.
    pub depth_sample_interval: f64,

    /// Minutes between SLA report emissions.
    pub sla_report_interval: f64,

    /// Seconds allowed for queue drain + child exit during shutdown.
    pub shutdown_grace: f64,

    /// Directory holding per-instance database files and sla_report.txt.
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            worker_threads: 1,
            processing_delay: 0.0,
            log_level: "debug".to_string(),
            cache_size: 1000,
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: 5.0,
            batch_interval: 5.0,
            batch_size: 10,
            max_queue: 100,
            max_retries: 3,
            latency_window: 1024,
            heartbeat_interval: 5.0,
            depth_sample_interval: 2.0,
            sla_report_interval: 30.0,
            shutdown_grace: 10.0,
            data_dir: ".".to_string(),
        }
    }
}

impl Config {
    /// Load the config for the environment named by `ENVIRONMENT`,
    /// looking for the file in the current directory.
    pub fn load() -> Result<Self, ConfigError> {
        let env = Environment::from_env();
        Self::load_for(env)
    }

    /// Load the config file for a specific environment.
    pub fn load_for(env: Environment) -> Result<Self, ConfigError> {
        let path = env.config_file();
        if !Path::new(&path).exists() {
            warn!(file = %path, "config file not found, using defaults");
            let mut config = Self::default();
            config.environment = env.as_str().to_string();
            return Ok(config.validated()?);
        }
        Self::load_from(&path)
    }

    /// Load and validate a config file at an explicit path.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be >= 1".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Invalid(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be >= 1".into()));
        }
        if self.latency_window < 1024 {
            warn!(
                configured = self.latency_window,
                "latency_window below 1024, clamping"
            );
            self.latency_window = 1024;
        }
        Ok(self)
    }

    pub fn processing_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.processing_delay)
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.acquire_timeout)
    }

    pub fn batch_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.batch_interval)
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval)
    }

    pub fn depth_sample_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.depth_sample_interval)
    }

    /// Report interval; the config value is in minutes.
    pub fn sla_report_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.sla_report_interval * 60.0)
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace)
    }
}

/// Read the instance listen port: `PORT` when set, otherwise `default`.
pub fn port_from_env(default: u16) -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.latency_window, 1024);
    }

    #[test]
    fn partial_file_overlays_defaults() {
        let dir = std::env::temp_dir().join("libris_core_config_overlay");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config_partial.json");
        std::fs::write(&path, r#"{"worker_threads": 4, "max_queue": 7}"#).unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.max_queue, 7);
        // untouched fields keep defaults
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn malformed_file_is_fatal() {
        let dir = std::env::temp_dir().join("libris_core_config_bad");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config_bad.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = Config::load_from(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn min_above_max_rejected() {
        let dir = std::env::temp_dir().join("libris_core_config_minmax");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config_minmax.json");
        std::fs::write(&path, r#"{"min_connections": 20, "max_connections": 4}"#).unwrap();

        let err = Config::load_from(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn small_latency_window_clamped() {
        let dir = std::env::temp_dir().join("libris_core_config_window");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config_window.json");
        std::fs::write(&path, r#"{"latency_window": 16}"#).unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.latency_window, 1024);
    }

    #[test]
    fn report_interval_is_minutes() {
        let config = Config {
            sla_report_interval: 1.0,
            ..Config::default()
        };
        assert_eq!(config.sla_report_interval_duration(), Duration::from_secs(60));
    }
}
