//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "herald.toml",
    "./config/config.toml",
    "/etc/herald/config.toml",
];

/// Configuration loader.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("HERALD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("HERALD_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("HERALD_HTTP_HOST") {
            config.http.host = val;
        }

        // Database
        if let Ok(val) = env::var("HERALD_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("HERALD_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.database.max_connections = max;
            }
        }

        // Redis
        if let Ok(val) = env::var("HERALD_REDIS_URL") {
            config.redis.url = val;
        }

        // Queue
        if let Ok(val) = env::var("HERALD_QUEUE_BACKEND") {
            config.queue.backend = val;
        }
        if let Ok(val) = env::var("HERALD_SQS_QUEUE_URL_PREFIX") {
            config.queue.sqs.queue_url_prefix = val;
        }
        if let Ok(val) = env::var("HERALD_SQS_REGION") {
            config.queue.sqs.region = val;
        }
        if let Ok(val) = env::var("HERALD_QUEUE_VISIBILITY_TIMEOUT") {
            if let Ok(timeout) = val.parse() {
                config.queue.visibility_timeout_seconds = timeout;
            }
        }

        // Worker
        if let Ok(val) = env::var("HERALD_WORKER_CONCURRENCY") {
            if let Ok(concurrency) = val.parse() {
                config.worker.concurrency = concurrency;
            }
        }
        if let Ok(val) = env::var("HERALD_WORKER_MAX_E2E_LATENCY") {
            if let Ok(latency) = val.parse() {
                config.worker.max_e2e_latency_seconds = latency;
            }
        }

        // Retry
        if let Ok(val) = env::var("HERALD_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.retry.max_attempts = attempts;
            }
        }

        // Feature flags
        if let Ok(val) = env::var("HERALD_FEATURE_VENDOR_FAILOVER") {
            config.feature_flags.vendor_failover = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("HERALD_FEATURE_RATE_LIMITING") {
            config.feature_flags.rate_limiting = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("HERALD_FEATURE_MULTI_REGION") {
            config.feature_flags.multi_region = val.parse().unwrap_or(false);
        }

        // General
        if let Ok(val) = env::var("HERALD_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("HERALD_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            dev_mode = true

            [http]
            port = 7070
            "#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.http.port, 7070);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/herald.toml");
        assert!(loader.find_config_file().is_none());
    }
}
