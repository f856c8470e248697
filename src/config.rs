//! Session configuration store.
//!
//! The persisted configuration is a JSON document. It is read once when a
//! session is initialized and flattened into dotted keys, so
//! `{"Skeletonization": {"ActiveUsers": 2}}` becomes
//! `Skeletonization.ActiveUsers = "2"`. Runtime overrides replace values in
//! place and are never written back to disk.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("config root must be a JSON object")]
    NotAnObject,
}

/// Flattened key/value view of a JSON configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStore {
    source: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl ConfigStore {
    /// Read and flatten the JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<ConfigStore, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut store = Self::parse(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        store.source = Some(path.to_path_buf());
        log::debug!("Loaded {} config values from {}", store.len(), path.display());
        Ok(store)
    }

    /// Flatten a JSON document held in memory.
    pub fn parse(text: &str) -> Result<ConfigStore, ConfigError> {
        let root: Value = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<memory>".into(),
            source,
        })?;
        if !root.is_object() {
            return Err(ConfigError::NotAnObject);
        }
        let mut values = BTreeMap::new();
        flatten("", &root, &mut values);
        Ok(ConfigStore {
            source: None,
            values,
        })
    }

    /// Path the store was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse the value at `key`, returning `None` if missing or malformed.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Override a value. Unknown keys are added.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Null => {
            out.insert(prefix.to_string(), String::new());
        }
        // Numbers, booleans and arrays keep their JSON spelling.
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}
