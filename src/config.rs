//! Key/value configuration sources.
//!
//! Settings arrive as a flat namespace of string values (`QEMU_PATH`,
//! `SERIAL_PORT`, `SMM_ENABLED`, ...). A [`ConfigProvider`] answers lookups;
//! [`ConfigReader`] layers typed accessors with defaults on top.
//!
//! # Example
//!
//! ```rust
//! use fwrun::config::{ConfigReader, MapConfig};
//!
//! let config = MapConfig::new().set("SMM_ENABLED", "no").set("SERIAL_PORT", "50001");
//! let reader = ConfigReader::new(&config);
//! assert!(!reader.flag("SMM_ENABLED", true));
//! assert_eq!(reader.port("SERIAL_PORT").unwrap(), Some(50001));
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::LaunchError;

/// Source of named configuration values.
pub trait ConfigProvider {
    /// Raw value for `key`, if set.
    fn value(&self, key: &str) -> Option<String>;
}

/// In-memory values, optionally loaded from a flat TOML table.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a flat TOML table. Scalars are stored as strings, arrays are
    /// joined with commas; nested tables are rejected.
    pub fn from_toml_str(source: &str, origin: &Path) -> Result<Self, LaunchError> {
        let table: toml::Table = source.parse().map_err(|e| LaunchError::ConfigFile {
            path: origin.to_path_buf(),
            source: e,
        })?;

        let mut config = Self::new();
        for (key, value) in table {
            let value = toml_scalar(&key, &value)?;
            config.insert(key, value);
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, LaunchError> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source, path)
    }
}

fn toml_scalar(key: &str, value: &toml::Value) -> Result<String, LaunchError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| toml_scalar(key, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(items.join(","))
        }
        toml::Value::Table(_) => Err(LaunchError::invalid(key, "<table>", "nested tables are not supported")),
    }
}

impl ConfigProvider for MapConfig {
    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Process environment, with a prefix (`FWRUN_QEMU_PATH` for `QEMU_PATH`).
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
}

impl EnvConfig {
    pub const DEFAULT_PREFIX: &'static str = "FWRUN_";

    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}

impl ConfigProvider for EnvConfig {
    fn value(&self, key: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, key)).ok()
    }
}

/// Several providers; the first one that has a key wins.
#[derive(Default)]
pub struct LayeredConfig {
    layers: Vec<Box<dyn ConfigProvider>>,
}

impl LayeredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer with lower priority than the existing ones.
    pub fn with(mut self, layer: impl ConfigProvider + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }
}

impl ConfigProvider for LayeredConfig {
    fn value(&self, key: &str) -> Option<String> {
        self.layers
            .iter()
            .filter_map(|layer| layer.value(key))
            .find(|v| !v.is_empty())
    }
}

/// Typed lookups over a provider. Empty values count as unset.
#[derive(Clone, Copy)]
pub struct ConfigReader<'a> {
    provider: &'a dyn ConfigProvider,
}

impl<'a> ConfigReader<'a> {
    pub fn new(provider: &'a dyn ConfigProvider) -> Self {
        Self { provider }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.provider.value(key).filter(|v| !v.is_empty())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    /// `true`, `yes`, `y` and `1` (any case) are true; other values false.
    /// An empty value takes `default`.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.string(key) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "y" | "1"),
            None => default,
        }
    }

    pub fn path(&self, key: &str) -> Option<PathBuf> {
        self.string(key).map(PathBuf::from)
    }

    pub fn number<T>(&self, key: &str) -> Result<Option<T>, LaunchError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|v| v.trim().parse::<T>().map_err(|e| LaunchError::invalid(key, &v, e)))
            .transpose()
    }

    pub fn port(&self, key: &str) -> Result<Option<u16>, LaunchError> {
        self.number::<u16>(key)
    }

    /// Comma separated list; blank entries are dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
