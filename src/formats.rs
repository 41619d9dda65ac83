//! Config file formats.
//!
//! Each supported extension maps to a [`FormatLoader`] that turns a file into
//! a plain JSON object. The order of the registry is the search order used when
//! probing `<name>.<ext>` candidates.

use crate::error::{Error, Result};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Loads one config file into a value.
///
/// Implementations may compute the value rather than parse static data.
#[async_trait]
pub trait FormatLoader: Send + Sync {
    async fn load(&self, path: &Path) -> anyhow::Result<Value>;
}

/// `.json` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLoader;

#[async_trait]
impl FormatLoader for JsonLoader {
    async fn load(&self, path: &Path) -> anyhow::Result<Value> {
        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&content).context("invalid JSON")
    }
}

/// `.yaml` / `.yml` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlLoader;

#[async_trait]
impl FormatLoader for YamlLoader {
    async fn load(&self, path: &Path) -> anyhow::Result<Value> {
        let content = tokio::fs::read_to_string(path).await?;
        let value: Value = serde_yaml::from_str(&content).context("invalid YAML")?;
        // An empty document parses as null
        Ok(if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        })
    }
}

/// `.toml` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlLoader;

#[async_trait]
impl FormatLoader for TomlLoader {
    async fn load(&self, path: &Path) -> anyhow::Result<Value> {
        let content = tokio::fs::read_to_string(path).await?;
        let table: toml::Table = toml::from_str(&content).context("invalid TOML")?;
        Ok(serde_json::to_value(table)?)
    }
}

/// Ordered mapping from file extension to loader.
#[derive(Clone)]
pub struct LoaderRegistry {
    entries: Vec<(String, Arc<dyn FormatLoader>)>,
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(ext, _)| ext))
            .finish()
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::empty()
            .register("json", JsonLoader)
            .register("yaml", YamlLoader)
            .register("yml", YamlLoader)
            .register("toml", TomlLoader)
    }
}

impl LoaderRegistry {
    /// A registry with no formats.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a loader for `extension`.
    ///
    /// Re-registering an extension replaces its loader but keeps its position.
    pub fn register(mut self, extension: &str, loader: impl FormatLoader + 'static) -> Self {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        let loader: Arc<dyn FormatLoader> = Arc::new(loader);
        match self.entries.iter_mut().find(|(ext, _)| *ext == extension) {
            Some(entry) => entry.1 = loader,
            None => self.entries.push((extension, loader)),
        }
        self
    }

    /// Supported extensions in search order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(ext, _)| ext.as_str())
    }

    /// True when `path` has a registered extension.
    pub fn supports(&self, path: &Path) -> bool {
        self.loader_for(path).is_some()
    }

    fn loader_for(&self, path: &Path) -> Option<&Arc<dyn FormatLoader>> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(registered, _)| *registered == ext)
            .map(|(_, loader)| loader)
    }

    /// Load `path` with the loader registered for its extension.
    ///
    /// The result must be an object; anything else is rejected.
    pub async fn load(&self, path: &Path) -> Result<Map<String, Value>> {
        let loader = self.loader_for(path).ok_or_else(|| {
            Error::invalid_config(path, "no loader registered for this extension")
        })?;
        match loader.load(path).await {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(Error::invalid_config(
                path,
                format!("expected an object at the top level, found {}", kind_of(&other)),
            )),
            Err(err) => Err(Error::parse(path, err)),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
