use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::sync::Cache;

use crate::error::UpscaleError;

/// Remote fetches (inference outputs) must not hang the pipeline; a stuck
/// download surfaces as a transient error and the stage is re-polled.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Blob store keyed by job/tile paths: upload-by-key returning a public URL,
/// fetch-by-URL for both our own blobs and remote inference outputs. Treated
/// as a content-addressable cache; no eviction policy is owned here.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str)
        -> Result<String, UpscaleError>;
    async fn fetch(&self, url: &str) -> Result<Bytes, UpscaleError>;
}

/// Disk-backed store under `<root>/blobs/`, public URLs under
/// `<base_url>/blobs/` served by the HTTP layer. Fetches of remote URLs go
/// through reqwest; all fetches share a byte cache.
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
    http: reqwest::Client,
    cache: Cache<String, Bytes>,
}

impl LocalBlobStore {
    pub fn open(root: &Path, base_url: &str, cache_entries: u64) -> Result<Self, UpscaleError> {
        let root = root.join("blobs");
        fs::create_dir_all(&root)
            .map_err(|e| UpscaleError::Storage(format!("create {}: {}", root.display(), e)))?;
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpscaleError::Storage(format!("http client: {}", e)))?;
        Ok(Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            cache: Cache::builder().max_capacity(cache_entries).build(),
        })
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/blobs/{}", self.base_url, key)
    }

    /// Resolve a public URL back to a local key, when it is ours.
    fn key_for(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix("/blobs/"))
            .map(str::to_string)
    }

    /// Direct read by key, used by the HTTP blob route.
    pub fn read_key(&self, key: &str) -> Result<Bytes, UpscaleError> {
        if key.split('/').any(|part| part == "..") {
            return Err(UpscaleError::Storage(format!("invalid blob key {}", key)));
        }
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }
        let path = self.root.join(key);
        let bytes = fs::read(&path)
            .map(Bytes::from)
            .map_err(|e| UpscaleError::Storage(format!("read {}: {}", path.display(), e)))?;
        self.cache.insert(key.to_string(), bytes.clone());
        Ok(bytes)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<String, UpscaleError> {
        if key.split('/').any(|part| part == "..") {
            return Err(UpscaleError::Storage(format!("invalid blob key {}", key)));
        }
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpscaleError::Storage(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        fs::write(&path, &bytes)
            .map_err(|e| UpscaleError::Storage(format!("write {}: {}", path.display(), e)))?;
        self.cache.insert(key.to_string(), bytes);
        Ok(self.url_for(key))
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, UpscaleError> {
        if let Some(key) = self.key_for(url) {
            return self.read_key(&key);
        }
        if let Some(hit) = self.cache.get(url) {
            return Ok(hit);
        }
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| UpscaleError::Transient(format!("fetch {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(UpscaleError::Transient(format!(
                "fetch {}: HTTP {}",
                url,
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| UpscaleError::Transient(format!("fetch {}: {}", url, e)))?;
        self.cache.insert(url.to_string(), bytes.clone());
        Ok(bytes)
    }
}

/// Content type from a blob key's extension, for the HTTP blob route.
pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(tag: &str) -> (LocalBlobStore, PathBuf) {
        let root =
            std::env::temp_dir().join(format!("tilescale-blob-{}-{}", tag, uuid::Uuid::new_v4()));
        let store = LocalBlobStore::open(&root, "http://localhost:8080", 64).unwrap();
        (store, root)
    }

    #[tokio::test]
    async fn test_put_fetch_roundtrip() {
        let (store, root) = test_store("rt");
        let url = store
            .put("jobs/j1/tiles/1/input.png", Bytes::from_static(b"abc"), "image/png")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8080/blobs/jobs/j1/tiles/1/input.png");
        let back = store.fetch(&url).await.unwrap();
        assert_eq!(&back[..], b"abc");
        let direct = store.read_key("jobs/j1/tiles/1/input.png").unwrap();
        assert_eq!(&direct[..], b"abc");
        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (store, root) = test_store("trav");
        assert!(store
            .put("../escape.png", Bytes::from_static(b"x"), "image/png")
            .await
            .is_err());
        assert!(store.read_key("a/../../b").is_err());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_content_type_for_key() {
        assert_eq!(content_type_for_key("a/b.png"), "image/png");
        assert_eq!(content_type_for_key("a/b.jpg"), "image/jpeg");
        assert_eq!(content_type_for_key("a/b"), "application/octet-stream");
    }
}
