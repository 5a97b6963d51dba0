//! Configuration for sqlbook.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialect::CustomDialect;
use crate::error::{SqlbookError, SqlbookResult};

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub report: ReportConfig,
    /// Custom dialect registrations, matched before the built-in table.
    pub dialects: Vec<CustomDialect>,
}

/// Query execution settings shared by every source.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Global row cap applied to every query.
    pub result_limit: usize,
    /// Log a fingerprint, elapsed time and result shape for every query.
    pub enable_query_log: bool,
    /// Fetch size hint passed to the driver.
    pub fetch_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            result_limit: 1_000_000,
            enable_query_log: false,
            fetch_size: 500,
        }
    }
}

/// Connection pool settings, applied per source partition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Workbook generation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Wait budget for each sheet task, awaited in submission order.
    pub task_wait_secs: u64,
    /// Size of the shared sheet worker pool.
    pub workers: usize,
    /// Directory that receives generated artifacts.
    pub output_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            task_wait_secs: 3600,
            workers: 8,
            output_dir: std::env::temp_dir().join("sqlbook"),
        }
    }
}

impl ReportConfig {
    pub fn task_wait(&self) -> Duration {
        Duration::from_secs(self.task_wait_secs)
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> SqlbookResult<Self> {
        toml::from_str(text).map_err(|e| SqlbookError::Configuration(e.to_string()))
    }

    /// Load a configuration file.
    ///
    /// With an explicit path the file must exist. Without one, the default
    /// location is tried and a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> SqlbookResult<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    SqlbookError::Configuration(format!("{}: {}", path.display(), e))
                })?;
                Self::from_toml(&text)
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(Some(&path)),
                _ => Ok(Self::default()),
            },
        }
    }

    /// `<config dir>/sqlbook/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sqlbook").join("config.toml"))
    }

    /// Create a new configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the global row cap
    pub fn result_limit(mut self, limit: usize) -> Self {
        self.config.source.result_limit = limit;
        self
    }

    /// Enable or disable query logging
    pub fn query_log(mut self, enabled: bool) -> Self {
        self.config.source.enable_query_log = enabled;
        self
    }

    /// Enable or disable the result cache
    pub fn cache(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    /// Set the per-task wait budget
    pub fn task_wait(mut self, wait: Duration) -> Self {
        self.config.report.task_wait_secs = wait.as_secs();
        self
    }

    /// Set the number of sheet workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.report.workers = workers;
        self
    }

    /// Set the artifact directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.report.output_dir = dir.into();
        self
    }

    /// Register a custom dialect
    pub fn dialect(mut self, dialect: CustomDialect) -> Self {
        self.config.dialects.push(dialect);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::CustomPagination;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.source.result_limit, 1_000_000);
        assert!(!config.source.enable_query_log);
        assert_eq!(config.report.task_wait(), Duration::from_secs(3600));
        assert!(config.dialects.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [source]
            result_limit = 5000
            enable_query_log = true

            [report]
            workers = 2

            [[dialects]]
            name = "kylin"
            url_keyword = "kylin"
            pagination = "cursor"
            keyword_prefix = '"'
            keyword_suffix = '"'
            "#,
        )
        .unwrap();

        assert_eq!(config.source.result_limit, 5000);
        assert_eq!(config.source.fetch_size, 500);
        assert!(config.source.enable_query_log);
        assert_eq!(config.report.workers, 2);
        assert_eq!(config.report.task_wait_secs, 3600);
        assert_eq!(config.dialects.len(), 1);
        assert_eq!(config.dialects[0].pagination, CustomPagination::Cursor);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = Config::from_toml("[source\nresult_limit = ").unwrap_err();
        assert!(matches!(err, SqlbookError::Configuration(_)));
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .result_limit(10)
            .cache(false)
            .task_wait(Duration::from_secs(5))
            .build();
        assert_eq!(config.source.result_limit, 10);
        assert!(!config.cache.enabled);
        assert_eq!(config.report.task_wait_secs, 5);
    }
}
