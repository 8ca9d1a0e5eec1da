//! Multipart upload state machine: a directory of `part-NNNNNN` files
//! concatenated in ascending numeric order on completion, plus a background
//! sweeper for abandoned uploads (spec §4.7.4).

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::hashing::weak_etag;

use super::layout::{ObjectMeta, ObjectStore};

/// `part-NNNNNN`, zero-padded to 6 digits, ascending order sorts lexically.
fn part_file_name(part_number: u32) -> String {
    format!("part-{part_number:06}")
}

fn parse_part_number(name: &str) -> Option<u32> {
    name.strip_prefix("part-")?.parse().ok()
}

impl ObjectStore {
    fn multipart_dir(&self, tenant: &str, bucket: &str, key: &str, upload_id: &str) -> PathBuf {
        let object_path = self.object_path_pub(tenant, bucket, key);
        let mut name = object_path.as_os_str().to_os_string();
        name.push(format!(".multipart.{upload_id}"));
        PathBuf::from(name)
    }

    /// Exposed for this module only; `layout::ObjectStore::object_path` is
    /// private, so multipart state lives alongside the final object path
    /// under the same parent without duplicating the key-to-path logic.
    fn object_path_pub(&self, tenant: &str, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.root().join(tenant).join(bucket);
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    /// Start a multipart upload, returning a 12-byte random hex upload id.
    pub async fn initiate_multipart(&self, tenant: &str, bucket: &str, key: &str) -> Result<String> {
        let mut raw = [0u8; 12];
        rand::rng().fill_bytes(&mut raw);
        let upload_id = hex::encode(raw);
        let dir = self.multipart_dir(tenant, bucket, key, &upload_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(upload_id)
    }

    /// Upload one part. Rejects if the upload root is missing (aborted,
    /// completed, or never initiated).
    pub async fn upload_part(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: &[u8],
    ) -> Result<(u32, String, u64)> {
        let dir = self.multipart_dir(tenant, bucket, key, upload_id);
        if !dir.exists() {
            return Err(Error::NotFound(format!("multipart upload {upload_id} not found")));
        }
        let path = dir.join(part_file_name(part_number));
        tokio::fs::write(&path, bytes).await?;
        Ok((part_number, weak_etag(bytes), bytes.len() as u64))
    }

    /// List uploaded parts in ascending part-number order.
    pub async fn list_parts(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<(u32, u64)>> {
        let dir = self.multipart_dir(tenant, bucket, key, upload_id);
        let mut parts = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(parts),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(n) = parse_part_number(name) else { continue };
            let len = entry.metadata().await?.len();
            parts.push((n, len));
        }
        parts.sort_by_key(|(n, _)| *n);
        Ok(parts)
    }

    /// Concatenate parts in ascending numeric order (ignoring caller-supplied
    /// ordering), compute the final weak ETag, persist the sidecar metadata,
    /// and remove the multipart directory.
    pub async fn complete_multipart(
        &self,
        tenant: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        content_type: &str,
        min_part_size_bytes: u64,
    ) -> Result<ObjectMeta> {
        let dir = self.multipart_dir(tenant, bucket, key, upload_id);
        let parts = self.list_parts(tenant, bucket, key, upload_id).await?;
        if parts.is_empty() {
            return Err(Error::validation("multipart upload has no parts"));
        }
        validate_part_sizes(&parts, min_part_size_bytes)?;

        let mut combined = Vec::new();
        for (n, _) in &parts {
            let part_path = dir.join(part_file_name(*n));
            let mut bytes = tokio::fs::read(&part_path).await?;
            combined.append(&mut bytes);
        }

        let meta = self.put(tenant, bucket, key, &combined, content_type, Default::default()).await?;

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) | Err(_) if !dir.exists() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(meta)
    }

    /// Idempotent: removing an already-gone upload directory is a success.
    pub async fn abort_multipart(&self, tenant: &str, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let dir = self.multipart_dir(tenant, bucket, key, upload_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// All parts but the last must meet `min_part_size_bytes`; the final part is
/// exempt (spec §4.7.4).
fn validate_part_sizes(parts: &[(u32, u64)], min_part_size_bytes: u64) -> Result<()> {
    if min_part_size_bytes == 0 {
        return Ok(());
    }
    for (n, len) in &parts[..parts.len().saturating_sub(1)] {
        if *len < min_part_size_bytes {
            return Err(Error::validation(format!(
                "part {n} is smaller than the minimum part size ({len} < {min_part_size_bytes})"
            )));
        }
    }
    Ok(())
}

/// A multipart upload directory discovered during the sweep, old enough to
/// be considered abandoned.
#[derive(Debug, Clone)]
pub struct StaleUpload {
    pub path: PathBuf,
}

/// Recursively find `*.multipart.*` directories under `root` whose last
/// modification time is older than `inactivity_timeout`.
pub async fn find_stale_uploads(root: &Path, inactivity_timeout: Duration) -> Result<Vec<StaleUpload>> {
    let mut out = Vec::new();
    if root.exists() {
        walk_for_stale(root, inactivity_timeout, &mut out).await?;
    }
    Ok(out)
}

fn walk_for_stale<'a>(
    dir: &'a Path,
    timeout: Duration,
    out: &'a mut Vec<StaleUpload>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = path.to_string_lossy();
            if name.contains(".multipart.") {
                let metadata = tokio::fs::metadata(&path).await?;
                let age = metadata.modified().ok().and_then(|m| m.elapsed().ok()).unwrap_or_default();
                if age >= timeout {
                    out.push(StaleUpload { path: path.clone() });
                }
                continue;
            }
            walk_for_stale(&path, timeout, out).await?;
        }
        Ok(())
    })
}

/// Background task: sweeps for and removes abandoned multipart directories
/// every `cleanup_interval`. Never fatal — failures are logged and the loop
/// continues.
pub async fn run_sweeper(
    root: PathBuf,
    inactivity_timeout: Duration,
    cleanup_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(cleanup_interval) => {}
            _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
        }
        match find_stale_uploads(&root, inactivity_timeout).await {
            Ok(stale) => {
                for upload in stale {
                    if let Err(e) = tokio::fs::remove_dir_all(&upload.path).await {
                        tracing::warn!(path = %upload.path.display(), error = %e, "multipart sweeper: cleanup failed");
                    } else {
                        tracing::debug!(path = %upload.path.display(), "multipart sweeper: removed stale upload");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "multipart sweeper: scan failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_concatenates_in_ascending_numeric_order_regardless_of_upload_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        store.create_bucket("acme", "b1").await.unwrap();
        let upload_id = store.initiate_multipart("acme", "b1", "big.bin").await.unwrap();

        store.upload_part("acme", "b1", "big.bin", &upload_id, 2, b"world").await.unwrap();
        store.upload_part("acme", "b1", "big.bin", &upload_id, 1, b"hello ").await.unwrap();

        let meta = store.complete_multipart("acme", "b1", "big.bin", &upload_id, "application/octet-stream", 0).await.unwrap();
        assert_eq!(meta.length, 11);

        let (bytes, _) = store.get("acme", "b1", "big.bin").await.unwrap().unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn complete_removes_the_multipart_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        store.create_bucket("acme", "b1").await.unwrap();
        let upload_id = store.initiate_multipart("acme", "b1", "f").await.unwrap();
        store.upload_part("acme", "b1", "f", &upload_id, 1, b"x").await.unwrap();
        store.complete_multipart("acme", "b1", "f", &upload_id, "text/plain", 0).await.unwrap();

        let mp_dir = store.multipart_dir("acme", "b1", "f", &upload_id);
        assert!(!mp_dir.exists());
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        store.create_bucket("acme", "b1").await.unwrap();
        let upload_id = store.initiate_multipart("acme", "b1", "f").await.unwrap();
        store.abort_multipart("acme", "b1", "f", &upload_id).await.unwrap();
        store.abort_multipart("acme", "b1", "f", &upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn upload_part_rejects_missing_upload_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        store.create_bucket("acme", "b1").await.unwrap();
        let result = store.upload_part("acme", "b1", "f", "deadbeefcafe", 1, b"x").await;
        assert!(result.is_err());
    }

    #[test]
    fn min_part_size_exempts_the_last_part() {
        let parts = vec![(1, 10), (2, 10), (3, 1)];
        assert!(validate_part_sizes(&parts, 10).is_ok());
    }

    #[test]
    fn min_part_size_rejects_undersized_non_final_part() {
        let parts = vec![(1, 5), (2, 10)];
        assert!(validate_part_sizes(&parts, 10).is_err());
    }
}
