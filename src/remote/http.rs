use super::RemoteSync;
use crate::util::fs::{basename, ensure_parent, write_atomic};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Plain HTTP object store: `HEAD`/`PUT`/`GET`/`DELETE` on
/// `<base>/<bucket>/<namespace>/<name>`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    prefix: Url,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        bucket: &str,
        namespace: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let mut prefix = Url::parse(base_url)?;
        {
            let mut segments = prefix
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("remote url {base_url} cannot carry a path"))?;
            segments.pop_if_empty();
            for part in [bucket, namespace] {
                for seg in part.split('/').filter(|s| !s.is_empty()) {
                    segments.push(seg);
                }
            }
            // trailing slash so `join(name)` appends instead of replacing
            segments.push("");
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            prefix,
            token,
        })
    }

    pub fn object_url(&self, name: &str) -> Option<Url> {
        self.prefix.join(&urlencoding::encode(name)).ok()
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteSync for HttpRemote {
    fn describe(&self) -> String {
        self.prefix.to_string()
    }

    async fn lookup(&self, name: &str) -> Result<bool, String> {
        let url = self
            .object_url(name)
            .ok_or_else(|| format!("no object url for {name:?}"))?;
        match self.authed(self.client.head(url)).send().await {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => Ok(false),
            Ok(resp) => {
                warn!(target: "remote", %name, status = %resp.status(), "lookup rejected");
                Err(format!("HEAD returned {}", resp.status()))
            }
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "lookup failed");
                Err(err.to_string())
            }
        }
    }

    async fn upload(&self, local: &Path) -> bool {
        let name = basename(local);
        let Some(url) = self.object_url(&name) else {
            return false;
        };
        let body = match tokio::fs::read(local).await {
            Ok(body) => body,
            Err(err) => {
                warn!(target: "remote", path = %local.display(), error = %err, "cannot read file to upload");
                return false;
            }
        };
        let size = body.len();
        match self.authed(self.client.put(url)).body(body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(target: "remote", %name, size, "uploaded");
                true
            }
            Ok(resp) => {
                warn!(target: "remote", %name, status = %resp.status(), "upload rejected");
                false
            }
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "upload failed");
                false
            }
        }
    }

    async fn download(&self, name: &str, local: &Path) -> bool {
        let Some(url) = self.object_url(name) else {
            return false;
        };
        let resp = match self.authed(self.client.get(url)).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "download failed");
                return false;
            }
        };
        if resp.status() == StatusCode::NOT_FOUND {
            return false;
        }
        if !resp.status().is_success() {
            warn!(target: "remote", %name, status = %resp.status(), "download rejected");
            return false;
        }
        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "download body failed");
                return false;
            }
        };
        match ensure_parent(local).and_then(|_| write_atomic(local, &bytes)) {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "remote", path = %local.display(), error = %err, "cannot store download");
                false
            }
        }
    }

    async fn erase(&self, name: &str) -> bool {
        let Some(url) = self.object_url(name) else {
            return false;
        };
        match self.authed(self.client.delete(url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                warn!(target: "remote", %name, error = %err, "erase failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_urls_nest_under_bucket_and_namespace() {
        let remote = HttpRemote::new("http://minio.local:9000", "data", "steam", None, 5).unwrap();
        assert_eq!(
            remote.object_url("games_info.jsonl.gz").unwrap().as_str(),
            "http://minio.local:9000/data/steam/games_info.jsonl.gz"
        );
        assert_eq!(remote.describe(), "http://minio.local:9000/data/steam/");
    }

    #[test]
    fn base_path_is_kept() {
        let remote = HttpRemote::new("https://store.example.org/s3/", "b", "ns/sub", None, 5).unwrap();
        assert_eq!(
            remote.object_url("x.json").unwrap().as_str(),
            "https://store.example.org/s3/b/ns/sub/x.json"
        );
    }

    /// Answers every request on a local port with `status` and an empty body.
    async fn fixed_status(status: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn only_not_found_means_absent() {
        let missing = HttpRemote::new(&fixed_status("404 Not Found").await, "b", "n", None, 5).unwrap();
        assert_eq!(missing.lookup("games_info.jsonl.gz").await, Ok(false));

        let present = HttpRemote::new(&fixed_status("200 OK").await, "b", "n", None, 5).unwrap();
        assert_eq!(present.lookup("games_info.jsonl.gz").await, Ok(true));

        let failing =
            HttpRemote::new(&fixed_status("503 Service Unavailable").await, "b", "n", None, 5).unwrap();
        assert!(failing.lookup("games_info.jsonl.gz").await.is_err());
        assert!(!failing.exists("games_info.jsonl.gz").await);
    }

    #[tokio::test]
    async fn unreachable_store_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let remote = HttpRemote::new(&format!("http://{addr}"), "b", "n", None, 5).unwrap();
        assert!(remote.lookup("games_info.jsonl.gz").await.is_err());
    }

    #[test]
    fn rejects_non_hierarchical_urls() {
        assert!(HttpRemote::new("mailto:ops@example.org", "b", "n", None, 5).is_err());
    }
}
