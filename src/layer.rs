//! Layer loading.
//!
//! Each discovered source becomes its own [`ConfigLayer`]: the main or an
//! extended config file, the rc file, the `package.json` block and the
//! environment. Nothing is merged across sources here and nothing is cached;
//! every call reads the filesystem again.

use crate::error::{Error, Result};
use crate::formats::LoaderRegistry;
use crate::options::LoadOptions;
use crate::rc::{insert_path, parse_rc, parse_value};
use crate::remote::{is_remote, materialize};
use crate::types::ConfigLayer;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Name of the package manifest read for `package.json` layers.
pub const PACKAGE_JSON: &str = "package.json";

/// Per-source options attached to an extend declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceOptions {
    /// Merged into the loaded layer's meta, above the file's own `$meta`.
    pub meta: Option<Value>,
    /// Merged above the loaded file's values.
    pub overrides: Option<Value>,
}

/// Where a source points on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// Layer root: relative paths declared by the layer resolve against it.
    pub cwd: PathBuf,
    /// The config file found, if any.
    pub file: Option<PathBuf>,
}

impl Located {
    /// File name of the config file relative to `cwd`.
    pub fn source(&self) -> Option<PathBuf> {
        let file = self.file.as_ref()?;
        file.strip_prefix(&self.cwd).ok().map(Path::to_path_buf)
    }
}

/// Resolve `.` and `..` lexically.
pub fn normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                } else {
                    components.push(Component::ParentDir);
                }
            }
            other => components.push(other),
        }
    }
    components.iter().collect()
}

pub(crate) async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

pub(crate) async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Read a file, treating a missing file as `None`.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::io(path, err)),
    }
}

/// First existing `<dir>/<stem>.<ext>` in registry order.
///
/// A stem that already carries a registered extension is checked as is.
async fn find_with_extensions(dir: &Path, stem: &str, loaders: &LoaderRegistry) -> Option<PathBuf> {
    if loaders.supports(Path::new(stem)) {
        let candidate = dir.join(stem);
        return is_file(&candidate).await.then_some(candidate);
    }
    for ext in loaders.extensions() {
        let candidate = dir.join(format!("{stem}.{ext}"));
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

/// Locate the config file `source` refers to, relative to `cwd`.
///
/// - A path with a registered extension is the file itself.
/// - An existing directory is a layer root holding `<config_file>.<ext>`.
/// - Anything else is a file stem tried with every registered extension.
pub async fn locate(
    cwd: &Path,
    source: &str,
    config_file: &str,
    loaders: &LoaderRegistry,
) -> Located {
    let target = normalize(&cwd.join(source));
    let parent = target.parent().map(Path::to_path_buf).unwrap_or_else(|| cwd.to_path_buf());

    if loaders.supports(&target) {
        let file = is_file(&target).await.then(|| target.clone());
        return Located { cwd: parent, file };
    }

    if is_dir(&target).await {
        let file = find_with_extensions(&target, config_file, loaders).await;
        return Located { cwd: target, file };
    }

    let stem = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(config_file)
        .to_string();
    let file = find_with_extensions(&parent, &stem, loaders).await;
    Located { cwd: parent, file }
}

/// True for bare module specifiers such as `npm-preset` or `@scope/preset`.
pub fn is_module_specifier(source: &str) -> bool {
    !source.is_empty()
        && !source.starts_with('.')
        && !source.starts_with('~')
        && !Path::new(source).is_absolute()
        && !is_remote(source)
}

/// Look `specifier` up in `node_modules`, walking up from `cwd`.
///
/// A package whose `main` names a supported config file resolves to that
/// file; otherwise the package directory is treated as a layer root.
pub async fn resolve_module(
    cwd: &Path,
    specifier: &str,
    config_file: &str,
    loaders: &LoaderRegistry,
) -> Result<Option<Located>> {
    for dir in cwd.ancestors() {
        let package_dir = dir.join("node_modules").join(specifier);
        if is_file(&package_dir).await && loaders.supports(&package_dir) {
            let parent = package_dir.parent().map(Path::to_path_buf).unwrap_or_default();
            return Ok(Some(Located {
                cwd: parent,
                file: Some(package_dir),
            }));
        }
        if !is_dir(&package_dir).await {
            continue;
        }
        debug!("Resolved module `{}` to {}", specifier, package_dir.display());

        if let Some(main) = package_main(&package_dir).await?
            && loaders.supports(Path::new(&main))
        {
            let file = normalize(&package_dir.join(&main));
            if is_file(&file).await {
                let parent = file.parent().map(Path::to_path_buf).unwrap_or(package_dir);
                return Ok(Some(Located {
                    cwd: parent,
                    file: Some(file),
                }));
            }
        }
        return Ok(Some(locate(&package_dir, ".", config_file, loaders).await));
    }
    Ok(None)
}

async fn package_main(package_dir: &Path) -> Result<Option<String>> {
    let path = package_dir.join(PACKAGE_JSON);
    let Some(content) = read_optional(&path).await? else {
        return Ok(None);
    };
    let manifest: Value = serde_json::from_str(&content).map_err(|err| Error::parse(&path, err))?;
    Ok(manifest
        .get("main")
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Load the layer a declared source refers to.
///
/// The `resolve` hook is asked first and its layer is used verbatim. Remote
/// references are fetched, bare module specifiers are looked up in
/// `node_modules`, anything else is a path relative to `cwd`. Returns `None`
/// when the source does not lead to a config file.
pub async fn load_layer(
    source: &str,
    cwd: &Path,
    source_options: &SourceOptions,
    options: &LoadOptions,
) -> Result<Option<ConfigLayer>> {
    if let Some(hook) = &options.resolve {
        let resolved = hook.resolve(source, cwd).await.map_err(|err| Error::Hook {
            target: source.to_string(),
            source: err,
        })?;
        if let Some(layer) = resolved {
            debug!("Source `{}` provided by resolve hook", source);
            return Ok(Some(layer));
        }
    }

    let config_file = options.config_file_name();
    let located = if is_remote(source) {
        let dir = materialize(options.fetcher.as_ref(), source).await?;
        locate(&dir, ".", &config_file, &options.loaders).await
    } else {
        let module = if is_module_specifier(source) {
            resolve_module(cwd, source, &config_file, &options.loaders).await?
        } else {
            None
        };
        match module {
            Some(located) => located,
            None => locate(cwd, source, &config_file, &options.loaders).await,
        }
    };

    load_file_layer(&located, source_options, options).await
}

/// Load the config file at `located` into a layer.
///
/// Returns `None` when no file was found. Applies the `$<env_name>` and
/// `$env.<env_name>` blocks, extracts `$meta`, then applies the source's
/// overrides.
pub async fn load_file_layer(
    located: &Located,
    source_options: &SourceOptions,
    options: &LoadOptions,
) -> Result<Option<ConfigLayer>> {
    let Some(file) = &located.file else {
        return Ok(None);
    };
    debug!("Loading config layer from {}", file.display());

    let merger = &options.merger;
    let mut config = Value::Object(options.loaders.load(file).await?);

    if let Some(env_name) = &options.env_name {
        let block = env_block(&config, env_name);
        if !block.is_empty() {
            config = merger.merge(&config, &Value::Object(block));
        }
    }

    let file_meta = config
        .as_object_mut()
        .and_then(|map| map.remove("$meta"));
    let meta = match (file_meta, &source_options.meta) {
        (Some(file_meta), Some(meta)) => Some(merger.merge(&file_meta, meta)),
        (Some(file_meta), None) => Some(file_meta),
        (None, Some(meta)) => Some(meta.clone()),
        (None, None) => None,
    };

    if let Some(overrides) = &source_options.overrides {
        config = merger.merge(&config, overrides);
    }

    let mut layer = ConfigLayer::new(config)
        .with_config_file(file.clone())
        .with_cwd(located.cwd.clone());
    layer.source = located.source();
    if let Some(meta) = meta {
        layer = layer.with_meta(meta);
    }
    Ok(Some(layer))
}

/// Collect `$<env>` then `$env.<env>` (the latter wins on conflicts).
fn env_block(config: &Value, env_name: &str) -> Map<String, Value> {
    let mut block = Map::new();
    if let Some(Value::Object(values)) = config.get(format!("${env_name}")) {
        block.extend(values.clone());
    }
    if let Some(Value::Object(values)) = config.get("$env").and_then(|env| env.get(env_name)) {
        block.extend(values.clone());
    }
    block
}

/// Nearest ancestor of `cwd` holding a `.git` entry.
async fn find_workspace_dir(cwd: &Path) -> Option<PathBuf> {
    for dir in cwd.ancestors() {
        if tokio::fs::try_exists(dir.join(".git")).await.unwrap_or(false) {
            return Some(dir.to_path_buf());
        }
    }
    None
}

/// Load the rc layer for `cwd`.
///
/// With `global_rc`, rc files from the workspace root and the home directory
/// are merged below the local one.
pub async fn load_rc_layer(cwd: &Path, options: &LoadOptions) -> Result<Option<ConfigLayer>> {
    let Some(rc_name) = options.rc_file_name() else {
        return Ok(None);
    };
    let local = cwd.join(&rc_name);

    // Lowest precedence first
    let mut candidates = Vec::new();
    if options.global_rc {
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(&rc_name));
        }
        if let Some(workspace) = find_workspace_dir(cwd).await
            && workspace != cwd
        {
            candidates.push(workspace.join(&rc_name));
        }
    }
    // Project rc last, it wins
    candidates.push(local.clone());
    candidates.dedup();

    let mut sources = Vec::new();
    for path in &candidates {
        if let Some(content) = read_optional(path).await? {
            debug!("Read rc file {}", path.display());
            sources.push(Value::Object(parse_rc(&content)));
        }
    }
    if sources.is_empty() {
        return Ok(None);
    }

    let config = options.merger.merge_all(&sources);
    Ok(Some(ConfigLayer::new(config).with_config_file(local)))
}

/// Load the `package.json` layer for `cwd`.
pub async fn load_package_json_layer(
    cwd: &Path,
    options: &LoadOptions,
) -> Result<Option<ConfigLayer>> {
    let keys = options.package_json.keys(&options.name);
    if keys.is_empty() {
        return Ok(None);
    }
    let path = cwd.join(PACKAGE_JSON);
    let Some(content) = read_optional(&path).await? else {
        return Ok(None);
    };
    let manifest: Value = serde_json::from_str(&content).map_err(|err| Error::parse(&path, err))?;

    // Keys are listed highest precedence first
    let values: Vec<&Value> = keys
        .iter()
        .filter_map(|key| manifest.get(key))
        .filter(|value| value.is_object())
        .collect();
    if values.is_empty() {
        return Ok(None);
    }

    let config = options.merger.merge_all(values.into_iter().rev());
    Ok(Some(ConfigLayer::new(config).with_config_file(path)))
}

/// Build the environment layer from the `.env` file and the process
/// environment.
///
/// Only variables carrying the prefix contribute. `__` nests keys, keys are
/// lowercased, values go through [`parse_value`]. Process variables win over
/// the file.
pub async fn load_env_layer(cwd: &Path, options: &LoadOptions) -> Result<Option<ConfigLayer>> {
    let Some(dotenv) = &options.dotenv else {
        return Ok(None);
    };
    let prefix = dotenv.prefix_for(&options.name);
    let path = cwd.join(&dotenv.file_name);

    let mut vars: Vec<(String, String)> = Vec::new();
    let from_file = match read_optional(&path).await? {
        Some(content) => {
            for item in dotenvy::from_read_iter(content.as_bytes()) {
                vars.push(item.map_err(|err| Error::parse(&path, err))?);
            }
            true
        }
        None => false,
    };
    // Process environment last, so it wins over .env
    for (key, value) in std::env::vars_os() {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => vars.push((key, value)),
            // Not representable as config text
            (key, _) => debug!(key = ?key, "Skipping non-UTF-8 environment variable"),
        }
    }

    let mut config = Map::new();
    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(&prefix) else {
            // Someone else's variable
            continue;
        };
        let segments: Vec<String> = rest
            .split("__")
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        insert_path(&mut config, &segments, parse_value(&value), false);
    }
    if config.is_empty() {
        return Ok(None);
    }

    let mut layer = ConfigLayer::new(Value::Object(config));
    if from_file {
        layer.config_file = Some(path);
    }
    Ok(Some(layer))
}
