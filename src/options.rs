//! Options for a resolution run.

use crate::formats::LoaderRegistry;
use crate::merge::Merger;
use crate::remote::{GitFetcher, RemoteFetcher};
use crate::types::ConfigLayer;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default base name of the config file.
pub const DEFAULT_NAME: &str = "config";

/// Default key followed for inheritance.
pub const DEFAULT_EXTEND_KEY: &str = "extends";

/// Intercepts extend targets before file resolution.
///
/// Returning a layer makes it the target's layer verbatim, which allows
/// virtual sources with no backing file.
#[async_trait]
pub trait ResolveHook: Send + Sync {
    async fn resolve(&self, source: &str, cwd: &Path) -> anyhow::Result<Option<ConfigLayer>>;
}

#[async_trait]
impl<F> ResolveHook for F
where
    F: Fn(&str, &Path) -> Option<ConfigLayer> + Send + Sync,
{
    async fn resolve(&self, source: &str, cwd: &Path) -> anyhow::Result<Option<ConfigLayer>> {
        Ok(self(source, cwd))
    }
}

/// Which rc file to read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RcFile {
    /// No rc file.
    Disabled,
    /// `.<name>rc`
    #[default]
    Default,
    /// An explicit file name.
    Named(String),
}

impl RcFile {
    /// The rc file name for a config `name`, if enabled.
    pub fn file_name(&self, name: &str) -> Option<String> {
        match self {
            RcFile::Disabled => None,
            RcFile::Default => Some(format!(".{name}rc")),
            RcFile::Named(file) => Some(file.clone()),
        }
    }
}

/// Which `package.json` fields to read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PackageJson {
    #[default]
    Disabled,
    /// The field named after the config.
    Name,
    /// Explicit fields, highest precedence first.
    Keys(Vec<String>),
}

impl PackageJson {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, PackageJson::Disabled)
    }

    /// Field names to read for a config `name`.
    pub fn keys(&self, name: &str) -> Vec<String> {
        match self {
            PackageJson::Disabled => Vec::new(),
            PackageJson::Name => vec![name.to_string()],
            PackageJson::Keys(keys) => keys.iter().filter(|k| !k.is_empty()).cloned().collect(),
        }
    }
}

/// `.env` ingestion settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotenvOptions {
    /// File read from the working directory.
    pub file_name: String,
    /// Variable prefix. Defaults to the uppercased config name plus `_`.
    pub prefix: Option<String>,
}

impl Default for DotenvOptions {
    fn default() -> Self {
        Self {
            file_name: ".env".to_string(),
            prefix: None,
        }
    }
}

impl DotenvOptions {
    /// Effective prefix for a config `name`.
    pub fn prefix_for(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => prefix.clone(),
            None => {
                let stem: String = name
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                format!("{stem}_")
            }
        }
    }
}

/// Keys followed as inheritance pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendOptions {
    pub keys: Vec<String>,
}

impl Default for ExtendOptions {
    fn default() -> Self {
        Self {
            keys: vec![DEFAULT_EXTEND_KEY.to_string()],
        }
    }
}

impl ExtendOptions {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Configuration for one resolution run.
#[derive(Clone)]
pub struct LoadOptions {
    /// Working directory. Defaults to the process working directory.
    pub cwd: Option<PathBuf>,
    /// Base name (`config` by default).
    pub name: String,
    /// Main config file stem. Defaults to `config`, or `<name>.config`.
    pub config_file: Option<String>,
    pub rc_file: RcFile,
    /// Also read rc files from the workspace root and the home directory.
    pub global_rc: bool,
    pub package_json: PackageJson,
    pub dotenv: Option<DotenvOptions>,
    /// Selects `$<env_name>` / `$env.<env_name>` blocks in config files.
    pub env_name: Option<String>,
    /// `None` disables extends resolution.
    pub extend: Option<ExtendOptions>,
    pub resolve: Option<Arc<dyn ResolveHook>>,
    /// Highest precedence values.
    pub overrides: Option<Value>,
    /// Lowest precedence values, applied with array replacement.
    pub defaults: Option<Value>,
    /// Base values below every file layer; their extend keys are followed.
    pub default_config: Option<Value>,
    pub merger: Merger,
    pub loaders: LoaderRegistry,
    pub fetcher: Arc<dyn RemoteFetcher>,
    /// Drop top-level `$`-prefixed keys from the merged config.
    pub omit_dollar_keys: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            name: DEFAULT_NAME.to_string(),
            config_file: None,
            rc_file: RcFile::default(),
            global_rc: false,
            package_json: PackageJson::default(),
            dotenv: None,
            env_name: None,
            extend: Some(ExtendOptions::default()),
            resolve: None,
            overrides: None,
            defaults: None,
            default_config: None,
            merger: Merger::default(),
            loaders: LoaderRegistry::default(),
            fetcher: Arc::new(GitFetcher::default()),
            omit_dollar_keys: false,
        }
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("cwd", &self.cwd)
            .field("name", &self.name)
            .field("config_file", &self.config_file)
            .field("rc_file", &self.rc_file)
            .field("global_rc", &self.global_rc)
            .field("package_json", &self.package_json)
            .field("dotenv", &self.dotenv)
            .field("env_name", &self.env_name)
            .field("extend", &self.extend)
            .field("resolve", &self.resolve.is_some())
            .field("overrides", &self.overrides)
            .field("defaults", &self.defaults)
            .field("default_config", &self.default_config)
            .field("merger", &self.merger)
            .field("loaders", &self.loaders)
            .field("omit_dollar_keys", &self.omit_dollar_keys)
            .finish_non_exhaustive()
    }
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config_file(mut self, config_file: impl Into<String>) -> Self {
        self.config_file = Some(config_file.into());
        self
    }

    pub fn with_rc_file(mut self, rc_file: RcFile) -> Self {
        self.rc_file = rc_file;
        self
    }

    pub fn with_global_rc(mut self, global_rc: bool) -> Self {
        self.global_rc = global_rc;
        self
    }

    pub fn with_package_json(mut self, package_json: PackageJson) -> Self {
        self.package_json = package_json;
        self
    }

    pub fn with_dotenv(mut self, dotenv: DotenvOptions) -> Self {
        self.dotenv = Some(dotenv);
        self
    }

    pub fn with_env_name(mut self, env_name: impl Into<String>) -> Self {
        self.env_name = Some(env_name.into());
        self
    }

    pub fn with_extend_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extend = Some(ExtendOptions::keys(keys));
        self
    }

    pub fn without_extends(mut self) -> Self {
        self.extend = None;
        self
    }

    /// Install a synchronous resolve hook.
    pub fn with_resolve<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &Path) -> Option<ConfigLayer> + Send + Sync + 'static,
    {
        self.resolve = Some(Arc::new(hook));
        self
    }

    /// Install any [`ResolveHook`], including async ones.
    pub fn with_resolve_hook(mut self, hook: impl ResolveHook + 'static) -> Self {
        self.resolve = Some(Arc::new(hook));
        self
    }

    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn with_default_config(mut self, default_config: Value) -> Self {
        self.default_config = Some(default_config);
        self
    }

    pub fn with_merger(mut self, merger: Merger) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_loaders(mut self, loaders: LoaderRegistry) -> Self {
        self.loaders = loaders;
        self
    }

    pub fn with_fetcher(mut self, fetcher: impl RemoteFetcher + 'static) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    pub fn with_omit_dollar_keys(mut self, omit: bool) -> Self {
        self.omit_dollar_keys = omit;
        self
    }

    /// Main config file stem.
    pub fn config_file_name(&self) -> String {
        match &self.config_file {
            Some(file) => file.clone(),
            None if self.name == DEFAULT_NAME => DEFAULT_NAME.to_string(),
            None => format!("{}.config", self.name),
        }
    }

    /// rc file name, if enabled.
    pub fn rc_file_name(&self) -> Option<String> {
        self.rc_file.file_name(&self.name)
    }

    /// Extend keys in scan order (empty when extends are disabled).
    pub fn extend_keys(&self) -> &[String] {
        self.extend.as_ref().map(|e| e.keys.as_slice()).unwrap_or(&[])
    }

    /// Absolute working directory.
    pub fn resolved_cwd(&self) -> PathBuf {
        let current = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match &self.cwd {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => current.join(cwd),
            None => current,
        }
    }
}
