//! Layer and resolution result types.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One contributing source of configuration values.
///
/// Layers are built once and never modified; every load produces new ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigLayer {
    /// The layer's values. Always a JSON object.
    pub config: Value,

    /// File the values were read from. `None` for programmatic and virtual layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,

    /// Directory that anchors relative paths declared by this layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Source path as declared, relative to `cwd`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Provenance: the extend declaration's `meta` merged with the file's `$meta`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ConfigLayer {
    /// A layer with values only (no backing file).
    pub fn new(config: Value) -> Self {
        Self {
            config,
            config_file: None,
            cwd: None,
            source: None,
            meta: None,
        }
    }

    pub fn with_config_file(mut self, config_file: impl Into<PathBuf>) -> Self {
        self.config_file = Some(config_file.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// True when the layer contributes no keys.
    pub fn is_empty(&self) -> bool {
        match &self.config {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }
}

/// The outcome of one full resolution run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    /// The authoritative merged configuration.
    pub config: Value,

    /// Contributing layers, highest precedence first.
    pub layers: Vec<ConfigLayer>,

    /// Working directory the load was anchored at.
    pub cwd: PathBuf,

    /// Main config file: the one found, or the expected location when none exists.
    pub config_file: PathBuf,

    /// Meta of the main config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    /// Layers left out of `layers` because they contributed no keys, such as
    /// a file holding only an extend key. Their files are still watched.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub empty_layers: Vec<ConfigLayer>,
}

impl ResolvedConfig {
    /// Deserialize the merged config into a typed structure.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.config.clone())?)
    }

    /// Look up a value by dotted path (`"colors.primary"`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.config, |value, key| value.get(key))
    }

    /// Layers backed by a file on disk.
    pub fn file_layers(&self) -> impl Iterator<Item = &ConfigLayer> {
        self.layers.iter().filter(|layer| layer.config_file.is_some())
    }

    /// True when `path` is the config file of one of the layers.
    pub fn has_layer_file(&self, path: &Path) -> bool {
        self.file_layers()
            .any(|layer| layer.config_file.as_deref() == Some(path))
    }
}
