//! Service configuration

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ShiftError, ShiftResult};

/// Main service configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server bind address
    pub bind_address: String,

    /// Enable CORS
    pub cors_enabled: bool,

    /// Upper bound on tables reconciled at the same time within one run
    pub max_concurrent_tables: usize,

    /// Rows fetched per batch from each side
    pub batch_size: usize,

    /// Sample rows kept per difference category
    pub sample_limit: usize,

    /// Directory for persisted runs; memory only when unset
    pub runs_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is not set
    pub log_level: String,

    /// Timeout for opening a database connection
    pub connect_timeout_secs: u64,

    /// Runs with at most this many tables are awaited by `run-validation`
    pub sync_run_table_limit: usize,

    /// Runs kept in memory; the oldest finished runs are dropped beyond this
    pub max_retained_runs: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5001".to_string(),
            cors_enabled: true,
            max_concurrent_tables: 4,
            batch_size: 1000,
            sample_limit: 5,
            runs_dir: None,
            log_level: "info".to_string(),
            connect_timeout_secs: 30,
            sync_run_table_limit: 1,
            max_retained_runs: 100,
        }
    }
}

impl AppConfig {
    /// Create a new configuration builder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> ShiftResult<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| ShiftError::Config(e.to_string()))?;
        config.validated()
    }

    /// Load from an explicit file, else `<config dir>/dbshift/config.toml`,
    /// else defaults.
    pub fn load(path: Option<&Path>) -> ShiftResult<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    ShiftError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                tracing::debug!(path = %path.display(), "loaded configuration file");
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dbshift").join("config.toml"))
    }

    fn validated(mut self) -> ShiftResult<Self> {
        if self.batch_size == 0 {
            return Err(ShiftError::Config("batch_size must be at least 1".to_string()));
        }
        self.max_concurrent_tables = self.max_concurrent_tables.max(1);
        self.max_retained_runs = self.max_retained_runs.max(1);
        Ok(self)
    }
}

/// Builder for AppConfig
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    /// Start from an existing configuration
    pub fn from_config(config: AppConfig) -> Self {
        Self { config }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    pub fn cors(mut self, enabled: bool) -> Self {
        self.config.cors_enabled = enabled;
        self
    }

    /// Set the table concurrency limit (minimum 1)
    pub fn max_concurrent_tables(mut self, limit: usize) -> Self {
        self.config.max_concurrent_tables = limit.max(1);
        self
    }

    /// Set the batch size (minimum 1)
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.config.batch_size = rows.max(1);
        self
    }

    pub fn sample_limit(mut self, rows: usize) -> Self {
        self.config.sample_limit = rows;
        self
    }

    /// Persist runs under this directory
    pub fn runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.runs_dir = Some(dir.into());
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn sync_run_table_limit(mut self, tables: usize) -> Self {
        self.config.sync_run_table_limit = tables;
        self
    }

    pub fn max_retained_runs(mut self, runs: usize) -> Self {
        self.config.max_retained_runs = runs.max(1);
        self
    }

    /// Build the configuration
    pub fn build(self) -> AppConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:5001");
        assert_eq!(config.max_concurrent_tables, 4);
        assert_eq!(config.sample_limit, 5);
        assert!(config.runs_dir.is_none());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = AppConfig::from_toml("batch_size = 250\nmax_concurrent_tables = 0\n").unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.max_concurrent_tables, 1);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_zero_batch_rejected() {
        assert!(AppConfig::from_toml("batch_size = 0").is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind_address = \"127.0.0.1:9000\"\nruns_dir = \"/tmp/runs\"\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.runs_dir, Some(PathBuf::from("/tmp/runs")));
    }

    #[test]
    fn test_builder() {
        let config = AppConfig::builder()
            .bind("127.0.0.1:0")
            .max_concurrent_tables(2)
            .sample_limit(3)
            .build();
        assert_eq!(config.bind_address, "127.0.0.1:0");
        assert_eq!(config.max_concurrent_tables, 2);
        assert_eq!(config.sample_limit, 3);
    }
}
