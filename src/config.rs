//! Endpoint configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SAGABUS_CONFIG, SAGABUS_ENDPOINT)
//! 2. Config file (.sagabus/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - `SAGABUS_CONFIG` names the file explicitly
//! - Otherwise searches current directory and parents for .sagabus/config.yaml
//! - Falls back to ~/.sagabus/config.yaml

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CircuitBreakerSettings, SettingsHolder};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Directory holding the config file
pub const CONFIG_DIR: &str = ".sagabus";

/// Config file name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.yaml";

/// Explicit config file path
pub const CONFIG_ENV: &str = "SAGABUS_CONFIG";

/// Endpoint name override
pub const ENDPOINT_ENV: &str = "SAGABUS_ENDPOINT";

/// Settings key holding the endpoint name
pub const ENDPOINT_NAME_SETTING: &str = "EndpointName";

const DEFAULT_ENDPOINT_NAME: &str = "sagabus";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    pub endpoint_name: Option<String>,
    #[serde(default)]
    pub features: FeatureOverrides,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

/// Explicit feature switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureOverrides {
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

/// Configuration after all sources have been merged
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Endpoint name
    pub endpoint_name: String,
    /// Feature switches
    pub features: FeatureOverrides,
    /// Explicit settings
    pub settings: BTreeMap<String, Value>,
    /// Receive circuit breaker timing
    pub circuit_breaker: CircuitBreakerSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            endpoint_name: DEFAULT_ENDPOINT_NAME.to_string(),
            features: FeatureOverrides::default(),
            settings: BTreeMap::new(),
            circuit_breaker: CircuitBreakerSettings::default(),
            config_file: None,
        }
    }
}

impl ResolvedConfig {
    /// Push the endpoint name, settings and feature switches into a settings
    /// store. Disables win over enables for the same feature.
    pub fn apply(&self, settings: &mut SettingsHolder) -> Result<()> {
        settings.set(ENDPOINT_NAME_SETTING, &self.endpoint_name)?;

        for (key, value) in &self.settings {
            settings
                .set(key.clone(), value)
                .with_context(|| format!("Invalid value for setting '{}'", key))?;
        }

        for feature in &self.features.enable {
            settings.enable_feature(feature);
        }
        for feature in &self.features.disable {
            settings.disable_feature(feature);
        }

        Ok(())
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file_from(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Locate the config file from the environment, the working directory or
/// the home directory
fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(explicit));
    }

    let from_cwd = std::env::current_dir().ok().and_then(|cwd| find_config_file_from(&cwd));
    from_cwd.or_else(|| {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
            .filter(|path| path.exists())
    })
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge a config file (if any) with an endpoint name override
fn resolve(config_file: Option<PathBuf>, endpoint_override: Option<String>) -> Result<ResolvedConfig> {
    let mut resolved = ResolvedConfig::default();

    if let Some(ref path) = config_file {
        let file = load_config_file(path)?;

        if let Some(name) = file.endpoint_name {
            resolved.endpoint_name = name;
        }
        resolved.features = file.features;
        resolved.settings = file.settings;
        if let Some(breaker) = file.circuit_breaker {
            resolved.circuit_breaker = breaker;
        }
    }

    if let Some(name) = endpoint_override.filter(|n| !n.trim().is_empty()) {
        resolved.endpoint_name = name;
    }

    resolved.config_file = config_file;
    Ok(resolved)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve(find_config_file(), std::env::var(ENDPOINT_ENV).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Load configuration from an explicit file, ignoring discovery
pub fn load_from(path: &Path) -> Result<ResolvedConfig> {
    resolve(Some(path.to_path_buf()), std::env::var(ENDPOINT_ENV).ok())
}
