//! Error types for configuration loading and watching.

use std::path::PathBuf;

/// Result type for layerconf operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a load or a watch.
///
/// Missing files and unresolvable local extend targets are not errors: they
/// simply contribute no layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid config in {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("Invalid remote reference `{reference}`: {reason}")]
    InvalidRemote { reference: String, reason: String },

    #[error("Failed to fetch `{reference}`: {source}")]
    Fetch {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Resolve hook failed for `{target}`: {source}")]
    Hook {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to deserialize config: {0}")]
    Extract(#[from] serde_json::Error),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::Parse {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn invalid_config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_remote(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRemote {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch(reference: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Fetch {
            reference: reference.into(),
            source: source.into(),
        }
    }
}
