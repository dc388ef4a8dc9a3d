//! Configuration management.

use crate::error::{QvmError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Collector used when OTLP export is enabled without an endpoint.
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Persistent configuration for the QVM daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor URI (`qemu:///system`, `memory://`, ...).
    pub hypervisor_uri: String,
    /// Address the command transport listens on.
    pub listen_addr: String,
    /// Largest accepted message body in bytes.
    pub max_message_bytes: usize,
    /// Connections served at once; 1 serves strictly one at a time.
    pub max_concurrent_connections: usize,
    /// Deadline for a client to deliver its request.
    pub read_timeout_secs: u64,
    /// Deadline for a single hypervisor operation.
    pub command_timeout_secs: u64,
    /// Directory that holds VM disk images.
    pub images_dir: PathBuf,
    /// Wait between the two CPU readings of a background sample.
    pub stats_interval_secs: u64,
    /// Period of the background stats sweep (0 disables it).
    pub stats_sweep_period_secs: u64,
    /// Upper bound accepted for a live `sample_stats` interval.
    pub max_sample_interval_secs: u64,
    /// JSON file holding registered snapshot schedules.
    pub schedule_store_path: PathBuf,
    /// Prometheus exporter port (disabled when unset).
    pub metrics_port: Option<u16>,
    /// OTLP collector for trace export (disabled when unset).
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hypervisor_uri: "qemu:///system".to_string(),
            listen_addr: "0.0.0.0:12345".to_string(),
            max_message_bytes: 1024 * 1024,
            max_concurrent_connections: 8,
            read_timeout_secs: 30,
            command_timeout_secs: 300,
            images_dir: PathBuf::from(paths::DEFAULT_IMAGES_DIR),
            stats_interval_secs: 60,
            stats_sweep_period_secs: 300,
            max_sample_interval_secs: 3600,
            schedule_store_path: paths::schedule_store_path(),
            metrics_port: None,
            otlp_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    ///
    /// `QVM_CONFIG` overrides the default location.
    pub fn config_path() -> PathBuf {
        std::env::var("QVM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths::config_dir().join("config.json"))
    }

    /// Load configuration from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| QvmError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| QvmError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QvmError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| QvmError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| QvmError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Apply `QVM_HYPERVISOR_URI`, `QVM_LISTEN_ADDR`, `QVM_LOG` and OTLP overrides.
    ///
    /// `OTEL_EXPORTER_OTLP_ENDPOINT` sets the trace collector; `QVM_OTLP_ENABLED`
    /// alone turns export on against a local collector.
    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(endpoint);
        } else if self.otlp_endpoint.is_none() && std::env::var("QVM_OTLP_ENABLED").is_ok() {
            self.otlp_endpoint = Some(DEFAULT_OTLP_ENDPOINT.to_string());
        }
        if let Ok(uri) = std::env::var("QVM_HYPERVISOR_URI") {
            self.hypervisor_uri = uri;
        }
        if let Ok(addr) = std::env::var("QVM_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(level) = std::env::var("QVM_LOG") {
            self.log_level = level;
        }
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hypervisor_uri.trim().is_empty() {
            return Err(QvmError::InvalidConfig {
                reason: "hypervisor_uri must not be empty".to_string(),
            });
        }
        if self.max_concurrent_connections == 0 {
            return Err(QvmError::InvalidConfig {
                reason: "max_concurrent_connections must be at least 1".to_string(),
            });
        }
        if self.max_message_bytes == 0 {
            return Err(QvmError::InvalidConfig {
                reason: "max_message_bytes must be at least 1".to_string(),
            });
        }
        if self.read_timeout_secs == 0 || self.command_timeout_secs == 0 {
            return Err(QvmError::InvalidConfig {
                reason: "read and command timeouts must be at least one second".to_string(),
            });
        }
        if self.stats_interval_secs == 0 || self.max_sample_interval_secs == 0 {
            return Err(QvmError::InvalidConfig {
                reason: "sampling intervals must be at least one second".to_string(),
            });
        }
        if self.stats_interval_secs > self.max_sample_interval_secs {
            return Err(QvmError::InvalidConfig {
                reason: format!(
                    "stats_interval_secs ({}) exceeds max_sample_interval_secs ({})",
                    self.stats_interval_secs, self.max_sample_interval_secs
                ),
            });
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr, "0.0.0.0:12345");
        assert_eq!(config.images_dir, PathBuf::from("/var/lib/libvirt/images"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"hypervisor_uri": "memory://", "metrics_port": 9464}"#)
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.hypervisor_uri, "memory://");
        assert_eq!(config.metrics_port, Some(9464));
        assert_eq!(config.max_concurrent_connections, 8);
        assert_eq!(config.otlp_endpoint, None);
    }

    #[test]
    fn test_otlp_endpoint_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"otlp_endpoint": "http://collector:4317"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config { stats_sweep_period_secs: 0, ..Config::default() };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(Config::load_from(&path), Err(QvmError::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        let bad = Config { max_concurrent_connections: 0, ..Config::default() };
        assert!(bad.validate().is_err());
        let bad = Config { hypervisor_uri: "  ".to_string(), ..Config::default() };
        assert!(bad.validate().is_err());
        let bad = Config { stats_interval_secs: 7200, ..Config::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let bad = Config { read_timeout_secs: 0, ..Config::default() };
        assert!(matches!(bad.validate(), Err(QvmError::InvalidConfig { .. })));
        let bad = Config { command_timeout_secs: 0, ..Config::default() };
        assert!(matches!(bad.validate(), Err(QvmError::InvalidConfig { .. })));
    }
}
