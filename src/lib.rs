//! Layered configuration loading.
//!
//! A configuration is assembled from several sources: caller overrides, the
//! main config file, an rc file, a `package.json` block, any layers those
//! sources extend (local paths, `node_modules` packages, git repositories),
//! the environment and caller defaults. Each source is kept as its own
//! [`ConfigLayer`] and the layers are deep-merged into one [`ResolvedConfig`].
//!
//! [`load_config`] resolves once; [`watch_config`] keeps the result current
//! as the underlying files change.
//!
//! ```no_run
//! # async fn run() -> layerconf::Result<()> {
//! use layerconf::{LoadOptions, load_config};
//! use serde_json::json;
//!
//! let resolved = load_config(
//!     &LoadOptions::new()
//!         .with_name("app")
//!         .with_defaults(json!({"port": 3000})),
//! )
//! .await?;
//! println!("port = {}", resolved.config["port"]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod extends;
pub mod formats;
pub mod layer;
pub mod loader;
pub mod merge;
pub mod options;
pub mod rc;
pub mod remote;
pub mod types;
pub mod watcher;

pub use error::{Error, Result};
pub use extends::{ExtendTarget, ExtendsResolver};
pub use formats::{FormatLoader, LoaderRegistry};
pub use layer::{SourceOptions, load_layer};
pub use loader::load_config;
pub use merge::{ArrayMerge, Merger, deep_merge, deep_merge_all};
pub use options::{DotenvOptions, ExtendOptions, LoadOptions, PackageJson, RcFile, ResolveHook};
pub use remote::{GitFetcher, RemoteFetcher, RemoteRef};
pub use types::{ConfigLayer, ResolvedConfig};
pub use watcher::{ChangeKind, ConfigChange, ConfigWatcher, DEFAULT_DEBOUNCE, WatchOptions, watch_config};
