//! Remote extend targets.
//!
//! A remote reference names a directory inside a git repository:
//! `<provider>:<owner>/<repo>[/<subpath>][#<ref>]`, or a plain git URL
//! (`git+https://host/owner/repo.git#ref`). It is materialized into a local
//! directory by a [`RemoteFetcher`] and then loaded like any other layer root.

use crate::error::{Error, Result};
use anyhow::{Context, bail};
use async_trait::async_trait;
use regex_lite::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Hosting provider of a remote reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    GitHub,
    GitLab,
    Bitbucket,
    SourceHut,
    /// A full clone URL.
    Url(String),
}

impl Provider {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "github" | "gh" => Some(Provider::GitHub),
            "gitlab" => Some(Provider::GitLab),
            "bitbucket" => Some(Provider::Bitbucket),
            "sourcehut" => Some(Provider::SourceHut),
            _ => None,
        }
    }
}

/// A parsed remote reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    /// The reference exactly as declared.
    pub raw: String,
    pub provider: Provider,
    pub owner: String,
    pub repo: String,
    /// Directory inside the repository.
    pub subpath: Option<String>,
    /// Branch or tag.
    pub git_ref: Option<String>,
}

const PROVIDER_PREFIXES: &[&str] = &["github:", "gh:", "gitlab:", "bitbucket:", "sourcehut:"];
const URL_PREFIXES: &[&str] = &["git+https://", "git+ssh://", "https://", "http://"];

/// True when `source` looks like a remote reference rather than a path.
pub fn is_remote(source: &str) -> bool {
    PROVIDER_PREFIXES
        .iter()
        .chain(URL_PREFIXES)
        .any(|prefix| source.starts_with(prefix))
}

impl RemoteRef {
    /// Parse a remote reference.
    pub fn parse(raw: &str) -> Result<Self> {
        let (body, git_ref) = match raw.split_once('#') {
            Some((_, "")) => return Err(Error::invalid_remote(raw, "empty ref after `#`")),
            Some((body, git_ref)) => (body, Some(git_ref.to_string())),
            None => (raw, None),
        };

        if let Some(prefix) = URL_PREFIXES.iter().find(|p| body.starts_with(*p)) {
            return Self::parse_url(raw, body, prefix, git_ref);
        }

        let (prefix, path) = body
            .split_once(':')
            .ok_or_else(|| Error::invalid_remote(raw, "missing provider prefix"))?;
        let provider = Provider::from_prefix(prefix)
            .ok_or_else(|| Error::invalid_remote(raw, format!("unknown provider `{prefix}`")))?;

        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let owner = segments
            .next()
            .ok_or_else(|| Error::invalid_remote(raw, "missing owner"))?;
        let repo = segments
            .next()
            .ok_or_else(|| Error::invalid_remote(raw, "missing repository name"))?;
        let subpath: Vec<&str> = segments.collect();

        Ok(Self {
            raw: raw.to_string(),
            provider,
            owner: owner.to_string(),
            repo: repo.to_string(),
            subpath: (!subpath.is_empty()).then(|| subpath.join("/")),
            git_ref,
        })
    }

    fn parse_url(raw: &str, body: &str, prefix: &str, git_ref: Option<String>) -> Result<Self> {
        let url = body.strip_prefix("git+").unwrap_or(body);
        let rest = &body[prefix.len()..];
        let mut segments = rest.split('/').filter(|s| !s.is_empty()).skip(1);
        let owner = segments
            .next()
            .ok_or_else(|| Error::invalid_remote(raw, "missing owner in URL"))?;
        let repo = segments
            .next()
            .ok_or_else(|| Error::invalid_remote(raw, "missing repository in URL"))?;
        Ok(Self {
            raw: raw.to_string(),
            provider: Provider::Url(url.to_string()),
            owner: owner.to_string(),
            repo: repo.trim_end_matches(".git").to_string(),
            subpath: None,
            git_ref,
        })
    }

    /// URL handed to `git clone`.
    pub fn clone_url(&self) -> String {
        match &self.provider {
            Provider::GitHub => format!("https://github.com/{}/{}.git", self.owner, self.repo),
            Provider::GitLab => format!("https://gitlab.com/{}/{}.git", self.owner, self.repo),
            Provider::Bitbucket => {
                format!("https://bitbucket.org/{}/{}.git", self.owner, self.repo)
            }
            Provider::SourceHut => format!("https://git.sr.ht/~{}/{}", self.owner, self.repo),
            Provider::Url(url) => url.clone(),
        }
    }

    /// Stable directory name for the local copy, keyed by the raw reference.
    pub fn cache_key(&self) -> String {
        static NON_WORD: OnceLock<Regex> = OnceLock::new();
        let non_word = NON_WORD.get_or_init(|| Regex::new(r"\W+").expect("static regex"));
        let slug = non_word.replace_all(&self.raw, "_");
        let slug: Vec<&str> = slug.split('_').take(3).collect();
        let digest = hex::encode(Sha256::digest(self.raw.as_bytes()));
        format!("{}_{}", slug.join("_"), &digest[..10])
    }
}

/// Materializes remote references into local directories.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetch `remote` and return the local directory it refers to
    /// (including the subpath).
    async fn fetch(&self, remote: &RemoteRef) -> anyhow::Result<PathBuf>;
}

/// Shallow `git clone` into a cache directory.
///
/// Every fetch clones afresh so that reloads observe upstream changes. The
/// clone lands in a sibling directory and replaces the cached copy only once
/// it succeeds, so a failed fetch leaves the previous copy in place.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    /// Cache root. Defaults to `<user cache dir>/layerconf`.
    pub cache_dir: Option<PathBuf>,
    /// git executable.
    pub git: PathBuf,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self {
            cache_dir: None,
            git: PathBuf::from("git"),
        }
    }
}

impl GitFetcher {
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
            ..Self::default()
        }
    }

    fn cache_root(&self) -> anyhow::Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|dir| dir.join("layerconf"))
                .context("no user cache directory available"),
        }
    }
}

#[async_trait]
impl RemoteFetcher for GitFetcher {
    async fn fetch(&self, remote: &RemoteRef) -> anyhow::Result<PathBuf> {
        let clone_dir = self.cache_root()?.join(remote.cache_key());
        let staging = clone_dir.with_file_name(format!(
            "{}.partial-{}",
            remote.cache_key(),
            std::process::id()
        ));
        if tokio::fs::try_exists(&staging).await? {
            // Left over from an interrupted fetch
            tokio::fs::remove_dir_all(&staging).await?;
        }
        if let Some(parent) = clone_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = remote.clone_url();
        info!("Fetching {} into {}", url, clone_dir.display());

        let mut cmd = Command::new(&self.git);
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(git_ref) = &remote.git_ref {
            cmd.arg("--branch").arg(git_ref);
        }
        cmd.arg(&url).arg(&staging).kill_on_drop(true);

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(err) => {
                discard(&staging).await;
                return Err(err).with_context(|| format!("failed to run {}", self.git.display()));
            }
        };
        if !output.status.success() {
            discard(&staging).await;
            bail!(
                "git clone {} failed: {}",
                url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        if tokio::fs::try_exists(&clone_dir).await? {
            debug!("Replacing cached copy at {}", clone_dir.display());
            tokio::fs::remove_dir_all(&clone_dir).await?;
        }
        tokio::fs::rename(&staging, &clone_dir)
            .await
            .with_context(|| format!("failed to move clone into {}", clone_dir.display()))?;

        Ok(match &remote.subpath {
            Some(subpath) => clone_dir.join(subpath),
            None => clone_dir,
        })
    }
}

async fn discard(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", dir.display(), err);
    }
}

/// Parse and fetch `source`, returning the local directory.
pub(crate) async fn materialize(fetcher: &dyn RemoteFetcher, source: &str) -> Result<PathBuf> {
    let remote = RemoteRef::parse(source)?;
    let dir = fetcher
        .fetch(&remote)
        .await
        .map_err(|err| Error::fetch(source, err))?;
    if !Path::new(&dir).is_dir() {
        return Err(Error::fetch(
            source,
            anyhow::anyhow!("{} is not a directory", dir.display()),
        ));
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_with_subpath_and_ref() {
        let remote = RemoteRef::parse("github:acme/presets/test/fixture#main").unwrap();
        assert_eq!(remote.provider, Provider::GitHub);
        assert_eq!(remote.owner, "acme");
        assert_eq!(remote.repo, "presets");
        assert_eq!(remote.subpath.as_deref(), Some("test/fixture"));
        assert_eq!(remote.git_ref.as_deref(), Some("main"));
        assert_eq!(remote.clone_url(), "https://github.com/acme/presets.git");
    }

    #[test]
    fn test_parse_without_subpath() {
        let remote = RemoteRef::parse("gitlab:group/project").unwrap();
        assert_eq!(remote.provider, Provider::GitLab);
        assert!(remote.subpath.is_none());
        assert!(remote.git_ref.is_none());
        assert_eq!(remote.clone_url(), "https://gitlab.com/group/project.git");
    }

    #[test]
    fn test_parse_url() {
        let remote = RemoteRef::parse("git+https://example.com/team/presets.git#v2").unwrap();
        assert_eq!(remote.owner, "team");
        assert_eq!(remote.repo, "presets");
        assert_eq!(remote.git_ref.as_deref(), Some("v2"));
        assert_eq!(remote.clone_url(), "https://example.com/team/presets.git");
    }

    #[test]
    fn test_malformed_references() {
        assert!(matches!(
            RemoteRef::parse("github:only-owner"),
            Err(Error::InvalidRemote { .. })
        ));
        assert!(matches!(
            RemoteRef::parse("github:a/b#"),
            Err(Error::InvalidRemote { .. })
        ));
        assert!(matches!(
            RemoteRef::parse("svn:a/b"),
            Err(Error::InvalidRemote { .. })
        ));
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("github:acme/presets"));
        assert!(is_remote("https://example.com/a/b.git"));
        assert!(!is_remote("./theme"));
        assert!(!is_remote("npm-preset"));
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = RemoteRef::parse("github:acme/presets/test/fixture").unwrap();
        let b = RemoteRef::parse("github:acme/presets/test/other").unwrap();
        assert_eq!(a.cache_key(), a.cache_key());
        assert_ne!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("github_acme_presets_"));
    }

    #[tokio::test]
    async fn test_materialize_wraps_fetch_failure() {
        struct Failing;

        #[async_trait]
        impl RemoteFetcher for Failing {
            async fn fetch(&self, _remote: &RemoteRef) -> anyhow::Result<PathBuf> {
                bail!("network unreachable")
            }
        }

        let err = materialize(&Failing, "github:a/b").await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_failed_clone_keeps_cached_copy() {
        let cache = tempfile::TempDir::new().unwrap();
        let remote = RemoteRef::parse("github:acme/presets").unwrap();
        let cached = cache.path().join(remote.cache_key());
        std::fs::create_dir_all(&cached).unwrap();
        std::fs::write(cached.join("config.json"), "{}").unwrap();

        let fetcher = GitFetcher {
            cache_dir: Some(cache.path().to_path_buf()),
            git: PathBuf::from("/nonexistent/bin/git"),
        };
        assert!(fetcher.fetch(&remote).await.is_err());

        assert!(cached.join("config.json").is_file());
        let leftovers: Vec<_> = std::fs::read_dir(cache.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from(remote.cache_key())]);
    }
}
