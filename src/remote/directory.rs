use super::RemoteSync;
use crate::util::fs::{basename, partial_path};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// A mounted directory standing in for the object namespace.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Copy to a sibling `.partial` and rename, so readers never see half a file.
async fn copy_atomic(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let tmp = partial_path(to);
    if let Err(err) = fs::copy(from, &tmp).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }
    fs::rename(&tmp, to).await
}

#[async_trait]
impl RemoteSync for DirectoryRemote {
    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }

    async fn lookup(&self, name: &str) -> Result<bool, String> {
        match fs::metadata(self.object(name)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "lookup failed");
                Err(err.to_string())
            }
        }
    }

    async fn upload(&self, local: &Path) -> bool {
        let name = basename(local);
        if name.is_empty() {
            warn!(target: "remote", path = %local.display(), "upload path has no file name");
            return false;
        }
        match copy_atomic(local, &self.object(&name)).await {
            Ok(()) => {
                debug!(target: "remote", %name, "uploaded");
                true
            }
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "upload failed");
                false
            }
        }
    }

    async fn download(&self, name: &str, local: &Path) -> bool {
        match copy_atomic(&self.object(name), local).await {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "download failed");
                false
            }
        }
    }

    async fn erase(&self, name: &str) -> bool {
        match fs::remove_file(self.object(name)).await {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "erase failed");
                false
            }
        }
    }
}
