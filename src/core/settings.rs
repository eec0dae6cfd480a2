//! Shared key/value settings used during endpoint configuration.
//!
//! Values are stored as JSON so any serde type can be read back with
//! [`SettingsHolder::get`]. Explicit values always win over defaults.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

const FEATURE_KEY_PREFIX: &str = "Features.";

/// Settings shared by all features of an endpoint
#[derive(Debug, Clone, Default)]
pub struct SettingsHolder {
    defaults: HashMap<String, Value>,
    overrides: HashMap<String, Value>,
}

impl SettingsHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit value
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize setting '{}'", key))?;
        self.overrides.insert(key, value);
        Ok(())
    }

    /// Set a default value, used only when no explicit value exists
    pub fn set_default<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize default for setting '{}'", key))?;
        self.defaults.insert(key, value);
        Ok(())
    }

    /// Raw value lookup, explicit before default
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.overrides.get(key).or_else(|| self.defaults.get(key))
    }

    /// Typed lookup. Missing keys yield `Ok(None)`, values of the wrong
    /// shape are an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("Setting '{}' has an unexpected shape", key)),
            None => Ok(None),
        }
    }

    /// Typed lookup falling back to `fallback` when missing
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, fallback: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(fallback))
    }

    /// True when an explicit value or a default exists
    pub fn has_setting(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }

    /// True only for explicitly set values
    pub fn has_explicit_value(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Explicitly enable a feature
    pub fn enable_feature(&mut self, feature: &str) {
        self.overrides.insert(feature_key(feature), Value::Bool(true));
    }

    /// Explicitly disable a feature
    pub fn disable_feature(&mut self, feature: &str) {
        self.overrides.insert(feature_key(feature), Value::Bool(false));
    }

    /// Enable a feature unless something else decided explicitly
    pub fn enable_feature_by_default(&mut self, feature: &str) {
        self.defaults.insert(feature_key(feature), Value::Bool(true));
    }

    /// Enablement decided through settings, `None` when nothing was said
    pub fn feature_enabled(&self, feature: &str) -> Option<bool> {
        self.get_raw(&feature_key(feature)).and_then(Value::as_bool)
    }

    /// All keys with a value, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .defaults
            .keys()
            .chain(self.overrides.keys().filter(|k| !self.defaults.contains_key(*k)))
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys
    }
}

fn feature_key(feature: &str) -> String {
    format!("{}{}", FEATURE_KEY_PREFIX, feature)
}
