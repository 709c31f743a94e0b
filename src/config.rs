use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    /// Reject aggregate write-back when the stored row changed since it was
    /// loaded in the same unit of work.
    pub linearizable_aggregates: bool,
    /// Memoize read queries within a repository until its next mutation.
    pub query_cache_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    /// How often the sweeper physically removes expired rows
    pub cleanup_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            linearizable_aggregates: false,
            query_cache_enabled: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            cleanup_interval_seconds: 60,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DATA_DIR`: database directory (default: ./data)
    /// - `CLEANUP_INTERVAL_SECONDS`: sweeper period (default: 60)
    /// - `LINEARIZABLE_AGGREGATES`: "true"/"1" to enable versioned write-back
    /// - `QUERY_CACHE_ENABLED`: "false"/"0" to disable the per-repository query cache
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let flag = |name: &str, default: bool| {
            lookup(name)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1"))
                .unwrap_or(default)
        };

        let defaults = StorageConfig::default();
        let data_dir = lookup("DATA_DIR").unwrap_or(defaults.data_dir);
        let cleanup_interval_seconds = match lookup("CLEANUP_INTERVAL_SECONDS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "CLEANUP_INTERVAL_SECONDS must be a whole number of seconds, got {raw:?}"
                ))
            })?,
            None => defaults.cleanup_interval_seconds,
        };

        let config = Config {
            storage: StorageConfig {
                data_dir,
                cleanup_interval_seconds,
            },
            linearizable_aggregates: flag("LINEARIZABLE_AGGREGATES", false),
            query_cache_enabled: flag("QUERY_CACHE_ENABLED", true),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.data_dir.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "DATA_DIR cannot be empty".to_string(),
            ));
        }
        if self.storage.cleanup_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "CLEANUP_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }
        if !self.linearizable_aggregates {
            tracing::debug!("Aggregate write-back is last-writer-wins");
        }
        Ok(())
    }
}
