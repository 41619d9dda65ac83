//! Extends resolution.
//!
//! A layer may point at other layers through its extend keys. Targets are
//! resolved depth-first: each target's own inherited layers follow it
//! directly, so `A extends [B, C]` with `B extends [D]` yields `B, D, C`.
//! Cycles are detected on the current resolution path only; the same target
//! reached through two different branches is loaded twice.

use crate::error::Result;
use crate::layer::{SourceOptions, load_layer};
use crate::options::LoadOptions;
use crate::types::ConfigLayer;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One declared extend target.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendTarget {
    pub source: String,
    pub options: SourceOptions,
}

impl ExtendTarget {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            options: SourceOptions::default(),
        }
    }

    /// Read one entry: `"src"`, `["src", {options}]` or `{source, options}`.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(source) if !source.is_empty() => Some(Self::new(source.clone())),
            Value::Array(pair) => {
                let source = pair.first()?.as_str()?;
                let options = pair.get(1).map(source_options).unwrap_or_default();
                Some(Self {
                    source: source.to_string(),
                    options,
                })
            }
            Value::Object(map) => {
                let source = map.get("source")?.as_str()?;
                let options = map.get("options").map(source_options).unwrap_or_default();
                Some(Self {
                    source: source.to_string(),
                    options,
                })
            }
            _ => None,
        }
    }
}

fn source_options(value: &Value) -> SourceOptions {
    SourceOptions {
        meta: value.get("meta").filter(|v| v.is_object()).cloned(),
        overrides: value.get("overrides").filter(|v| v.is_object()).cloned(),
    }
}

fn targets_from(value: &Value) -> Vec<ExtendTarget> {
    let entries: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let target = ExtendTarget::from_value(entry);
            if target.is_none() {
                warn!("Ignoring invalid extend entry: {}", entry);
            }
            target
        })
        .collect()
}

/// Targets declared by `config` under `keys`, in key order.
pub fn extend_targets(config: &Value, keys: &[String]) -> Vec<ExtendTarget> {
    keys.iter()
        .filter_map(|key| config.get(key))
        .flat_map(targets_from)
        .collect()
}

/// Targets of several base configs, collected key by key and then config by
/// config, keeping the first occurrence of each target.
pub fn collect_targets<'a>(
    configs: impl IntoIterator<Item = &'a Value> + Clone,
    keys: &[String],
) -> Vec<ExtendTarget> {
    let mut targets: Vec<ExtendTarget> = Vec::new();
    for key in keys {
        for config in configs.clone() {
            let Some(value) = config.get(key) else {
                continue;
            };
            for target in targets_from(value) {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
    }
    targets
}

/// Remove the extend keys from the top level of `config`.
pub fn strip_extend_keys(config: &mut Value, keys: &[String]) {
    if let Value::Object(map) = config {
        for key in keys {
            map.remove(key);
        }
    }
}

/// Identity used for cycle detection.
async fn identity(layer: &ConfigLayer, source: &str) -> String {
    match &layer.config_file {
        Some(file) => tokio::fs::canonicalize(file)
            .await
            .unwrap_or_else(|_| file.clone())
            .display()
            .to_string(),
        None => format!("resolve:{source}"),
    }
}

/// Resolves extend targets into a flat, ordered list of layers.
pub struct ExtendsResolver<'a> {
    options: &'a LoadOptions,
}

impl<'a> ExtendsResolver<'a> {
    pub fn new(options: &'a LoadOptions) -> Self {
        Self { options }
    }

    /// Resolve `targets` declared by a layer rooted at `cwd`.
    ///
    /// `ancestors` holds the identities of the layers that lead here (the
    /// main config file, typically) so that pointing back at them is
    /// detected as a cycle.
    pub async fn resolve(
        &self,
        targets: Vec<ExtendTarget>,
        cwd: &Path,
        ancestors: Vec<String>,
    ) -> Result<Vec<ConfigLayer>> {
        let mut layers = Vec::new();
        if self.options.extend_keys().is_empty() {
            return Ok(layers);
        }
        self.resolve_into(targets, cwd.to_path_buf(), ancestors, &mut layers)
            .await?;
        Ok(layers)
    }

    fn resolve_into<'s>(
        &'s self,
        targets: Vec<ExtendTarget>,
        cwd: PathBuf,
        path: Vec<String>,
        out: &'s mut Vec<ConfigLayer>,
    ) -> BoxFuture<'s, Result<()>> {
        Box::pin(async move {
            let keys = self.options.extend_keys();
            for target in targets {
                let loaded = load_layer(&target.source, &cwd, &target.options, self.options).await?;
                let Some(mut layer) = loaded else {
                    warn!(
                        "Cannot extend config from `{}` in {}",
                        target.source,
                        cwd.display()
                    );
                    continue;
                };

                let id = identity(&layer, &target.source).await;
                if path.contains(&id) {
                    warn!("Skipping circular extend `{}` ({})", target.source, id);
                    continue;
                }
                debug!("Extending config from `{}`", target.source);

                let nested = extend_targets(&layer.config, keys);
                strip_extend_keys(&mut layer.config, keys);
                let layer_cwd = layer.cwd.clone().unwrap_or_else(|| cwd.clone());
                out.push(layer);

                if !nested.is_empty() {
                    let mut child_path = path.clone();
                    child_path.push(id);
                    self.resolve_into(nested, layer_cwd, child_path, out).await?;
                }
            }
            Ok(())
        })
    }
}
