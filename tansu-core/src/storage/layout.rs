//! Tenant-scoped filesystem layout: `root/{tenant}/{bucket}/{key}` with a
//! sibling `{key}.meta.json`, weak-ETag object semantics, and byte-range
//! reads (spec §4.7.1-§4.7.3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::weak_etag;

/// Suffix of the sidecar metadata file. Listing operations skip any path
/// ending in this suffix so metadata never appears as a logical object.
pub const META_SUFFIX: &str = ".meta.json";

/// Persisted sidecar metadata — the source of truth for content-type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(rename = "content-type")]
    pub content_type: String,
    pub etag: String,
    #[serde(rename = "last-modified")]
    pub last_modified: DateTime<Utc>,
    pub length: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Filesystem-backed per-tenant object store rooted at `root`.
#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tenant_root(&self, tenant: &str) -> PathBuf {
        self.root.join(tenant)
    }

    fn bucket_path(&self, tenant: &str, bucket: &str) -> PathBuf {
        self.tenant_root(tenant).join(bucket)
    }

    /// Translate a logical `/`-separated key into a path under `bucket`.
    fn object_path(&self, tenant: &str, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.bucket_path(tenant, bucket);
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    fn meta_path(object_path: &Path) -> PathBuf {
        let mut s = object_path.as_os_str().to_os_string();
        s.push(META_SUFFIX);
        PathBuf::from(s)
    }

    /// Idempotent: creating an existing bucket is a no-op success.
    pub async fn create_bucket(&self, tenant: &str, bucket: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.bucket_path(tenant, bucket)).await?;
        Ok(())
    }

    /// Idempotent: a missing bucket deletes successfully. Deletion succeeds
    /// only if no user files remain under it (meta sidecars are ignored).
    pub async fn delete_bucket(&self, tenant: &str, bucket: &str) -> Result<bool> {
        let path = self.bucket_path(tenant, bucket);
        if !path.exists() {
            return Ok(true);
        }
        let remaining = self.list(tenant, bucket, None).await?;
        if !remaining.is_empty() {
            return Ok(false);
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_buckets(&self, tenant: &str) -> Result<Vec<String>> {
        let root = self.tenant_root(tenant);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Write `bytes`, then read back the length and compute the weak ETag,
    /// and persist the sidecar metadata file.
    pub async fn put(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectMeta> {
        let path = self.object_path(tenant, bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            etag: weak_etag(bytes),
            last_modified: Utc::now(),
            length: bytes.len() as u64,
            metadata,
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| Error::Internal(format!("serialize object metadata: {e}")))?;
        tokio::fs::write(Self::meta_path(&path), meta_json).await?;
        Ok(meta)
    }

    pub async fn head(&self, tenant: &str, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.object_path(tenant, bucket, key);
        self.read_meta(&path).await
    }

    async fn read_meta(&self, object_path: &Path) -> Result<Option<ObjectMeta>> {
        match tokio::fs::read(Self::meta_path(object_path)).await {
            Ok(bytes) => {
                let meta = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Internal(format!("corrupt object metadata: {e}")))?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, tenant: &str, bucket: &str, key: &str) -> Result<Option<(Vec<u8>, ObjectMeta)>> {
        let path = self.object_path(tenant, bucket, key);
        let Some(meta) = self.read_meta(&path).await? else { return Ok(None) };
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some((bytes, meta)))
    }

    /// Inclusive byte range `[start, end]`. Rejects `end < start` or
    /// `start >= length`; clamps `end` down to `length - 1`.
    pub async fn get_range(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Option<(Vec<u8>, ObjectMeta)>> {
        let Some((bytes, meta)) = self.get(tenant, bucket, key).await? else { return Ok(None) };
        if end < start || start >= meta.length {
            return Err(Error::validation("invalid byte range"));
        }
        let clamped_end = end.min(meta.length.saturating_sub(1));
        let slice = bytes[start as usize..=clamped_end as usize].to_vec();
        Ok(Some((slice, meta)))
    }

    pub async fn delete(&self, tenant: &str, bucket: &str, key: &str) -> Result<bool> {
        let path = self.object_path(tenant, bucket, key);
        let meta_path = Self::meta_path(&path);
        let existed = path.exists();
        if !existed {
            return Ok(false);
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) | Err(_) if !path.exists() => {}
            Err(e) => return Err(e.into()),
        }
        let _ = tokio::fs::remove_file(&meta_path).await;
        Ok(true)
    }

    /// Recursive enumeration of logical keys under `bucket`, optionally
    /// filtered by `prefix`, skipping `.meta.json` sidecars.
    pub async fn list(&self, tenant: &str, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let root = self.bucket_path(tenant, bucket);
        let mut out = Vec::new();
        if root.exists() {
            Self::walk(&root, &root, &mut out).await?;
        }
        if let Some(prefix) = prefix {
            out.retain(|k| k.starts_with(prefix));
        }
        out.sort();
        Ok(out)
    }

    fn walk<'a>(
        root: &'a Path,
        dir: &'a Path,
        out: &'a mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    // Multipart-in-progress directories are not logical objects.
                    if path.to_string_lossy().contains(".multipart.") {
                        continue;
                    }
                    Self::walk(root, &path, out).await?;
                } else {
                    let name = path.to_string_lossy();
                    if name.ends_with(META_SUFFIX) {
                        continue;
                    }
                    if let Ok(rel) = path.strip_prefix(root) {
                        let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                        out.push(key);
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ObjectStore::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn put_then_head_reports_weak_etag_and_length() {
        let (store, _dir) = store();
        store.create_bucket("acme", "b1").await.unwrap();
        let meta = store.put("acme", "b1", "a/b.txt", b"hello", "text/plain", HashMap::new()).await.unwrap();
        assert_eq!(meta.length, 5);
        assert!(meta.etag.starts_with("W/\""));

        let head = store.head("acme", "b1", "a/b.txt").await.unwrap().unwrap();
        assert_eq!(head.etag, meta.etag);
    }

    #[tokio::test]
    async fn get_range_clamps_upper_bound() {
        let (store, _dir) = store();
        store.create_bucket("acme", "b1").await.unwrap();
        store.put("acme", "b1", "k", b"0123456789", "text/plain", HashMap::new()).await.unwrap();
        let (bytes, _) = store.get_range("acme", "b1", "k", 5, 1000).await.unwrap().unwrap();
        assert_eq!(bytes, b"56789");
    }

    #[tokio::test]
    async fn get_range_rejects_start_past_length() {
        let (store, _dir) = store();
        store.create_bucket("acme", "b1").await.unwrap();
        store.put("acme", "b1", "k", b"hello", "text/plain", HashMap::new()).await.unwrap();
        assert!(store.get_range("acme", "b1", "k", 10, 20).await.is_err());
    }

    #[tokio::test]
    async fn delete_missing_object_returns_false() {
        let (store, _dir) = store();
        store.create_bucket("acme", "b1").await.unwrap();
        assert!(!store.delete("acme", "b1", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_bucket_is_idempotent_and_blocked_by_contents() {
        let (store, _dir) = store();
        store.create_bucket("acme", "b1").await.unwrap();
        assert!(store.delete_bucket("acme", "gone-already").await.unwrap());

        store.put("acme", "b1", "k", b"x", "text/plain", HashMap::new()).await.unwrap();
        assert!(!store.delete_bucket("acme", "b1").await.unwrap());

        store.delete("acme", "b1", "k").await.unwrap();
        assert!(store.delete_bucket("acme", "b1").await.unwrap());
    }

    #[tokio::test]
    async fn list_skips_meta_sidecars_and_respects_prefix() {
        let (store, _dir) = store();
        store.create_bucket("acme", "b1").await.unwrap();
        store.put("acme", "b1", "docs/a.txt", b"1", "text/plain", HashMap::new()).await.unwrap();
        store.put("acme", "b1", "docs/b.txt", b"2", "text/plain", HashMap::new()).await.unwrap();
        store.put("acme", "b1", "img/c.png", b"3", "image/png", HashMap::new()).await.unwrap();

        let all = store.list("acme", "b1", None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|k| !k.ends_with(META_SUFFIX)));

        let docs = store.list("acme", "b1", Some("docs/")).await.unwrap();
        assert_eq!(docs, vec!["docs/a.txt".to_string(), "docs/b.txt".to_string()]);
    }
}
