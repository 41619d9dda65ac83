//! Configuration resolution pipeline.
//!
//! Resolution order (highest precedence first):
//! 1. `overrides` passed by the caller
//! 2. The main config file (`<config_file>.<ext>` in the working directory)
//! 3. The rc file
//! 4. The `package.json` block
//! 5. Extended layers, depth-first
//! 6. The `.env` / environment layer
//! 7. `default_config`
//! 8. `defaults` (arrays replaced, never concatenated)

use crate::error::Result;
use crate::extends::{ExtendsResolver, collect_targets, strip_extend_keys};
use crate::layer::{SourceOptions, load_env_layer, load_layer, load_package_json_layer, load_rc_layer};
use crate::merge::ArrayMerge;
use crate::options::LoadOptions;
use crate::types::{ConfigLayer, ResolvedConfig};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Run the full pipeline once.
///
/// Missing files contribute nothing; a run with no files at all still
/// produces a config from `overrides`, `default_config` and `defaults`.
pub async fn load_config(options: &LoadOptions) -> Result<ResolvedConfig> {
    let cwd = options.resolved_cwd();
    let config_file = options.config_file_name();
    let keys = options.extend_keys();
    debug!("Resolving config `{}` in {}", options.name, cwd.display());

    let overrides = options.overrides.clone().map(ConfigLayer::new);
    let main = load_layer(".", &cwd, &SourceOptions::default(), options).await?;
    let rc = load_rc_layer(&cwd, options).await?;
    let package_json = load_package_json_layer(&cwd, options).await?;

    let main_file = main
        .as_ref()
        .and_then(|layer| layer.config_file.clone())
        .unwrap_or_else(|| cwd.join(&config_file));
    let main_meta = main.as_ref().and_then(|layer| layer.meta.clone());

    let mut base_layers: Vec<ConfigLayer> = [overrides, main, rc, package_json]
        .into_iter()
        .flatten()
        .collect();

    let empty = Value::Object(Map::new());
    let default_config = options.default_config.as_ref().unwrap_or(&empty);
    let targets = collect_targets(
        base_layers
            .iter()
            .map(|layer| &layer.config)
            .chain(std::iter::once(default_config)),
        keys,
    );

    let mut ancestors = Vec::new();
    if let Ok(canonical) = tokio::fs::canonicalize(&main_file).await {
        ancestors.push(canonical.display().to_string());
    }
    let extended = ExtendsResolver::new(options)
        .resolve(targets, &cwd, ancestors)
        .await?;
    if !extended.is_empty() {
        debug!("Resolved {} extended layer(s)", extended.len());
    }

    base_layers.extend(extended);
    if let Some(env) = load_env_layer(&cwd, options).await? {
        base_layers.push(env);
    }
    // Empty layers still name files that can change
    let (layers, empty_layers): (Vec<ConfigLayer>, Vec<ConfigLayer>) =
        base_layers.into_iter().partition(|layer| !layer.is_empty());

    let mut default_config = default_config.clone();
    strip_extend_keys(&mut default_config, keys);

    // Lowest precedence first
    let merger = &options.merger;
    let mut config = merger.merge_all(
        std::iter::once(&default_config).chain(layers.iter().rev().map(|layer| &layer.config)),
    );
    if let Some(defaults) = &options.defaults {
        let boundary = merger.clone().with_arrays(ArrayMerge::Replace);
        config = boundary.merge(defaults, &config);
    }
    strip_extend_keys(&mut config, keys);
    if options.omit_dollar_keys
        && let Value::Object(map) = &mut config
    {
        map.retain(|key, _| !key.starts_with('$'));
    }

    info!(
        "Loaded config `{}` from {} layer(s)",
        options.name,
        layers.len()
    );

    Ok(ResolvedConfig {
        config,
        layers,
        cwd,
        config_file: main_file,
        meta: main_meta,
        empty_layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn options(dir: &Path) -> LoadOptions {
        LoadOptions::new().with_cwd(dir)
    }

    #[tokio::test]
    async fn test_overrides_beat_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"overriden": false, "a": 1}"#).unwrap();

        let resolved = load_config(&options(temp.path()).with_overrides(json!({"overriden": true})))
            .await
            .unwrap();
        assert_eq!(resolved.config, json!({"overriden": true, "a": 1}));
        assert_eq!(resolved.layers.len(), 2);
        assert_eq!(resolved.config_file, temp.path().join("config.json"));
    }

    #[tokio::test]
    async fn test_defaults_replace_arrays() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"overridenArray": ["a", "b", "c"]}"#,
        )
        .unwrap();

        let resolved = load_config(
            &options(temp.path()).with_defaults(json!({"overridenArray": [1, 2, 3], "d": true})),
        )
        .await
        .unwrap();
        assert_eq!(resolved.config["overridenArray"], json!(["a", "b", "c"]));
        assert_eq!(resolved.config["d"], json!(true));
    }

    #[tokio::test]
    async fn test_no_files_uses_defaults_only() {
        let temp = TempDir::new().unwrap();
        let resolved = load_config(&options(temp.path()).with_defaults(json!({"port": 3000})))
            .await
            .unwrap();
        assert_eq!(resolved.config, json!({"port": 3000}));
        assert!(resolved.layers.is_empty());
        assert_eq!(resolved.config_file, temp.path().join("config"));
    }

    #[tokio::test]
    async fn test_extend_keys_kept_on_main_layer_only() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("base")).unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"extends": "./base", "a": 1}"#).unwrap();
        std::fs::write(temp.path().join("base/config.json"), r#"{"b": 2}"#).unwrap();

        let resolved = load_config(&options(temp.path())).await.unwrap();
        assert_eq!(resolved.config, json!({"a": 1, "b": 2}));
        assert_eq!(resolved.layers[0].config["extends"], json!("./base"));
    }

    #[tokio::test]
    async fn test_extend_only_layer_kept_aside() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("theme")).unwrap();
        std::fs::create_dir_all(temp.path().join("base")).unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"extends": "./theme"}"#).unwrap();
        std::fs::write(temp.path().join("theme/config.json"), r#"{"extends": "../base"}"#).unwrap();
        std::fs::write(temp.path().join("base/config.json"), r#"{"color": "red"}"#).unwrap();

        let resolved = load_config(&options(temp.path())).await.unwrap();
        assert_eq!(resolved.config, json!({"color": "red"}));
        assert_eq!(resolved.layers.len(), 2);
        assert_eq!(resolved.empty_layers.len(), 1);
        assert_eq!(
            resolved.empty_layers[0].cwd.as_deref(),
            Some(temp.path().join("theme").as_path())
        );
    }

    #[tokio::test]
    async fn test_omit_dollar_keys() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"a": 1, "$development": {"a": 2}}"#,
        )
        .unwrap();

        let kept = load_config(&options(temp.path())).await.unwrap();
        assert!(kept.config.get("$development").is_some());

        let omitted = load_config(&options(temp.path()).with_omit_dollar_keys(true))
            .await
            .unwrap();
        assert_eq!(omitted.config, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_main_meta_exposed() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"$meta": {"name": "app"}, "a": 1}"#,
        )
        .unwrap();

        let resolved = load_config(&options(temp.path())).await.unwrap();
        assert_eq!(resolved.meta, Some(json!({"name": "app"})));
        assert_eq!(resolved.config, json!({"a": 1}));
    }
}
