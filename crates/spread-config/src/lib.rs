//! Scheduler configuration.

#![forbid(unsafe_code)]

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Load(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// One cloud's driver endpoint configuration. Order in `SchedulerConfig::clouds`
/// is the order drivers are registered and, by extension, the iteration order
/// a stack sees for clouds it does not mention (clouds the stack does not
/// weight are simply never consulted, so order only matters for logging and
/// for the `from_env`-style convenience constructor below).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudEndpointConfig {
    pub name: String,
    pub base_url: String,

    /// Name of an environment variable holding a bearer token for this
    /// cloud's endpoint, if it requires one. The token itself is never
    /// stored in the config file.
    #[serde(default)]
    pub auth_token_env: Option<String>,
}

/// Top-level configuration for the `spreaderd` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Clouds to instantiate drivers for, in configured order.
    pub clouds: Vec<CloudEndpointConfig>,

    /// Path to the JSON-file-backed stack store.
    pub store_path: std::path::PathBuf,

    #[serde(default = "default_update_frequency")]
    pub update_frequency_seconds: u64,

    #[serde(default = "default_driver_timeout")]
    pub driver_timeout_seconds: u64,

    #[serde(default = "default_driver_pool_size")]
    pub driver_pool_size: usize,
}

fn default_update_frequency() -> u64 {
    10
}

fn default_driver_timeout() -> u64 {
    10
}

fn default_driver_pool_size() -> usize {
    16
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            clouds: Vec::new(),
            store_path: std::path::PathBuf::from("stacks.json"),
            update_frequency_seconds: default_update_frequency(),
            driver_timeout_seconds: default_driver_timeout(),
            driver_pool_size: default_driver_pool_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| ConfigError::Load(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// No cloud appears twice, and at least one cloud is configured.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.clouds.is_empty() {
            return Err(ConfigError::Load("no clouds configured".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for cloud in &self.clouds {
            if !seen.insert(&cloud.name) {
                return Err(ConfigError::Load(format!(
                    "cloud {:?} configured more than once",
                    cloud.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.update_frequency_seconds, 10);
        assert_eq!(cfg.driver_timeout_seconds, 10);
        assert_eq!(cfg.driver_pool_size, 16);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let mut cfg = SchedulerConfig::default();
        cfg.clouds.push(CloudEndpointConfig {
            name: "aws".to_string(),
            base_url: "https://aws.example.com".to_string(),
            auth_token_env: Some("AWS_SPREAD_TOKEN".to_string()),
        });

        cfg.save(&path).expect("save");
        let loaded = SchedulerConfig::load(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn load_missing_optional_fields_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"clouds": [], "store_path": "stacks.json"}"#,
        )
        .unwrap();

        let cfg = SchedulerConfig::load(&path).expect("load");
        assert_eq!(cfg.update_frequency_seconds, 10);
    }

    #[test]
    fn validate_rejects_empty_cloud_list() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_cloud_names() {
        let mut cfg = SchedulerConfig::default();
        cfg.clouds.push(CloudEndpointConfig {
            name: "aws".to_string(),
            base_url: "https://a".to_string(),
            auth_token_env: None,
        });
        cfg.clouds.push(CloudEndpointConfig {
            name: "aws".to_string(),
            base_url: "https://b".to_string(),
            auth_token_env: None,
        });
        assert!(cfg.validate().is_err());
    }
}
