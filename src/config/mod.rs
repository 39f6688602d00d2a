//! Configuration module for slipstream
//!
//! This module handles engine configuration:
//! - Demand sizing and batching per element type
//! - Cache manager, tcp-listen and parallel limits
//! - Logging options and an optional pipeline definition for the binary
//!
//! # Config Location
//!
//! The configuration file is read from, in order:
//! 1. the path in the `SLIPSTREAM_CONFIG` environment variable
//! 2. `<config dir>/slipstream/config.toml`, where the config dir is
//!    platform specific (`~/.config` on Linux)
//!
//! # Example
//!
//! ```toml
//! optimize = true
//!
//! [demand.events]
//! max_buffered = 4096
//! batch_timeout_ms = 50
//!
//! [[pipeline]]
//! name = "generate"
//! args = { rows = 1000, batch_size = 100 }
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{PipelineError, Result};
use crate::pipeline::element::ElementType;
use crate::pipeline::operator::OperatorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "slipstream";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "SLIPSTREAM_CONFIG";

/// Get the path of the config file
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rewrite closed pipelines with filter and order pushdown before running
    pub optimize: bool,

    /// Demand settings per element type
    pub demand: DemandConfig,

    /// Cache manager limits
    pub cache: CacheSettings,

    /// tcp-listen limits
    pub tcp: TcpSettings,

    /// parallel limits
    pub parallel: ParallelSettings,

    /// Logging options
    pub log: LogSettings,

    /// Pipeline run by the binary, as serialized operators
    pub pipeline: Vec<OperatorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            demand: DemandConfig::default(),
            cache: CacheSettings::default(),
            tcp: TcpSettings::default(),
            parallel: ParallelSettings::default(),
            log: LogSettings::default(),
            pipeline: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Demand settings for edges carrying `ty`. Void edges never buffer,
    /// so they share the event settings.
    pub fn demand_for(&self, ty: ElementType) -> DemandSettings {
        match ty {
            ElementType::Bytes => self.demand.bytes,
            ElementType::Events | ElementType::Void => self.demand.events,
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Load configuration from the default location, returning defaults on
    /// any error or when no file exists
    pub fn load_or_default() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| PipelineError::Config(format!("Failed to write config: {}", e)))
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> Result<()> {
        self.demand
            .events
            .validate()
            .map_err(|e| PipelineError::Config(format!("demand.events: {}", e)))?;
        self.demand
            .bytes
            .validate()
            .map_err(|e| PipelineError::Config(format!("demand.bytes: {}", e)))?;
        if self.parallel.split_at == 0 {
            return Err(PipelineError::Config(
                "parallel.split_at must be positive".to_string(),
            ));
        }
        if self.tcp.read_size == 0 || self.tcp.bridge_capacity == 0 {
            return Err(PipelineError::Config(
                "tcp.read_size and tcp.bridge_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            optimize = false

            [demand.events]
            max_buffered = 4096
            max_batch_size = 1024
            min_batch_size = 16
            "#,
        )
        .unwrap();
        assert!(!config.optimize);
        assert_eq!(config.demand.events.max_buffered, 4096);
        assert_eq!(config.demand.events.batch_timeout_ms, 250);
        assert_eq!(config.demand.bytes, DemandSettings::bytes());
        assert_eq!(config.cache, CacheSettings::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml("optimize = 3").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_validation_failure() {
        let err = EngineConfig::from_toml("[parallel]\nsplit_at = 0").unwrap_err();
        assert!(err.to_string().contains("split_at"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut config = EngineConfig::default();
        config.demand.events.batch_timeout_ms = 42;
        config
            .pipeline
            .push(OperatorConfig::new("discard", serde_json::json!({})));
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.demand.events.batch_timeout_ms, 42);
        assert_eq!(loaded.pipeline.len(), 1);
        assert_eq!(loaded.pipeline[0].name, "discard");
    }

    #[test]
    #[serial]
    fn test_config_path_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[tcp]\nread_size = 1234\n").unwrap();
        std::env::set_var(CONFIG_ENV, &path);
        assert_eq!(config_path(), Some(path.clone()));
        let config = EngineConfig::load_or_default();
        std::env::remove_var(CONFIG_ENV);
        assert_eq!(config.tcp.read_size, 1234);
    }

    #[test]
    #[serial]
    fn test_load_or_default_on_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "this is not toml ===").unwrap();
        std::env::set_var(CONFIG_ENV, &path);
        let config = EngineConfig::load_or_default();
        std::env::remove_var(CONFIG_ENV);
        assert!(config.optimize);
    }
}
