//! Optional object-store mirror for datasets, work sources and error logs.
//!
//! Objects are keyed by file basename inside one fixed namespace. Every call
//! reports success as a plain `bool`; failures are logged here and the caller
//! decides whether they matter.

pub mod directory;
pub mod http;

use crate::util::env::{env_opt, env_parse_opt};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use directory::DirectoryRemote;
pub use http::HttpRemote;

#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// `Ok(false)` only when the store answers that `name` is absent; an
    /// unreachable or failing store is an `Err`.
    async fn lookup(&self, name: &str) -> Result<bool, String>;

    async fn exists(&self, name: &str) -> bool {
        self.lookup(name).await.unwrap_or(false)
    }

    /// Store `local` under its own basename.
    async fn upload(&self, local: &Path) -> bool;

    async fn download(&self, name: &str, local: &Path) -> bool;

    async fn erase(&self, name: &str) -> bool;
}

/// Which backend to build, read once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteConfig {
    Directory {
        root: PathBuf,
    },
    Http {
        base_url: String,
        bucket: String,
        namespace: String,
        token: Option<String>,
        timeout_secs: u64,
    },
}

impl RemoteConfig {
    /// `HARVEST_REMOTE_DIR` wins over `HARVEST_REMOTE_URL`; `None` when neither is set.
    pub fn from_env() -> Option<Self> {
        let namespace = env_opt("HARVEST_REMOTE_NAMESPACE").unwrap_or_else(|| "steam".to_string());
        if let Some(dir) = env_opt("HARVEST_REMOTE_DIR") {
            return Some(RemoteConfig::Directory {
                root: PathBuf::from(dir).join(namespace),
            });
        }
        let base_url = env_opt("HARVEST_REMOTE_URL")?;
        Some(RemoteConfig::Http {
            base_url,
            bucket: env_opt("HARVEST_REMOTE_BUCKET").unwrap_or_else(|| "harvest".to_string()),
            namespace,
            token: env_opt("HARVEST_REMOTE_TOKEN"),
            timeout_secs: env_parse_opt("HARVEST_REMOTE_TIMEOUT_SECS").unwrap_or(120),
        })
    }

    pub fn build(&self) -> anyhow::Result<Box<dyn RemoteSync>> {
        Ok(match self {
            RemoteConfig::Directory { root } => Box::new(DirectoryRemote::new(root.clone())),
            RemoteConfig::Http {
                base_url,
                bucket,
                namespace,
                token,
                timeout_secs,
            } => Box::new(HttpRemote::new(
                base_url,
                bucket,
                namespace,
                token.clone(),
                *timeout_secs,
            )?),
        })
    }
}
