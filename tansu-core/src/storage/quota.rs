//! Tenant storage quotas: usage accounting and incoming-write evaluation
//! (spec §4.7.6).

use std::path::Path;

use crate::error::Result;

use super::layout::META_SUFFIX;

/// A limit of `0` disables that constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaLimits {
    pub max_object_size_bytes: u64,
    pub max_total_bytes: u64,
    pub max_object_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaViolation {
    ObjectTooLarge,
    TotalBytesExceeded,
    ObjectCountExceeded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TenantUsage {
    pub total_bytes: u64,
    pub object_count: u64,
}

impl QuotaLimits {
    /// First violated constraint for a write of `incoming_bytes`, given the
    /// tenant's `current` usage. Limits of `0` disable that check.
    pub fn evaluate(&self, current: TenantUsage, incoming_bytes: u64) -> Option<QuotaViolation> {
        if self.max_object_size_bytes > 0 && incoming_bytes > self.max_object_size_bytes {
            return Some(QuotaViolation::ObjectTooLarge);
        }
        if self.max_total_bytes > 0 && current.total_bytes + incoming_bytes > self.max_total_bytes {
            return Some(QuotaViolation::TotalBytesExceeded);
        }
        if self.max_object_count > 0 && current.object_count + 1 > self.max_object_count {
            return Some(QuotaViolation::ObjectCountExceeded);
        }
        None
    }
}

/// Enumerate the tenant subtree, summing bytes and counting user files
/// (skipping `.meta.json` sidecars and in-progress multipart directories).
pub async fn compute_usage(tenant_root: &Path) -> Result<TenantUsage> {
    let mut usage = TenantUsage::default();
    if tenant_root.exists() {
        walk(tenant_root, &mut usage).await?;
    }
    Ok(usage)
}

fn walk<'a>(
    dir: &'a Path,
    usage: &'a mut TenantUsage,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if path.to_string_lossy().contains(".multipart.") {
                    continue;
                }
                walk(&path, usage).await?;
            } else {
                if path.to_string_lossy().ends_with(META_SUFFIX) {
                    continue;
                }
                usage.total_bytes += entry.metadata().await?.len();
                usage.object_count += 1;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limits_never_trigger() {
        let limits = QuotaLimits::default();
        assert!(limits.evaluate(TenantUsage { total_bytes: u64::MAX / 2, object_count: u64::MAX / 2 }, u64::MAX / 2).is_none());
    }

    #[test]
    fn object_too_large_is_checked_first() {
        let limits = QuotaLimits { max_object_size_bytes: 100, max_total_bytes: 1, max_object_count: 1 };
        assert_eq!(limits.evaluate(TenantUsage::default(), 200), Some(QuotaViolation::ObjectTooLarge));
    }

    #[test]
    fn total_bytes_exceeded() {
        let limits = QuotaLimits { max_object_size_bytes: 0, max_total_bytes: 100, max_object_count: 0 };
        assert_eq!(
            limits.evaluate(TenantUsage { total_bytes: 90, object_count: 0 }, 20),
            Some(QuotaViolation::TotalBytesExceeded)
        );
    }

    #[test]
    fn object_count_exceeded() {
        let limits = QuotaLimits { max_object_size_bytes: 0, max_total_bytes: 0, max_object_count: 5 };
        assert_eq!(
            limits.evaluate(TenantUsage { total_bytes: 0, object_count: 5 }, 1),
            Some(QuotaViolation::ObjectCountExceeded)
        );
    }

    #[tokio::test]
    async fn compute_usage_skips_meta_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::super::layout::ObjectStore::new(dir.path());
        store.create_bucket("acme", "b1").await.unwrap();
        store.put("acme", "b1", "k", b"hello", "text/plain", Default::default()).await.unwrap();

        let usage = compute_usage(&dir.path().join("acme")).await.unwrap();
        assert_eq!(usage.object_count, 1);
        assert_eq!(usage.total_bytes, 5);
    }
}
