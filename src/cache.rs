//! Result cache keyed by query fingerprint.
//!
//! Backed by `moka`, whose `try_get_with` runs one initializer per key and
//! parks concurrent callers for the same key on it. Errors are never stored.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use moka::future::Cache;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{SqlbookError, SqlbookResult};
use crate::executor::{PagedResult, PagingRequest};
use crate::sanitize;
use crate::source::SourceKey;

/// SHA-256 over everything that can change a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(
        source: &SourceKey,
        sql: &str,
        requester: &str,
        request: &PagingRequest,
        exclude: &BTreeSet<String>,
    ) -> Self {
        let request = request.normalized();
        let mut hasher = Sha256::new();
        hasher.update(source.canonical().as_bytes());
        hasher.update([0u8]);
        hasher.update(sanitize::normalize(sql).trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(requester.as_bytes());
        hasher.update([0u8]);
        hasher.update(
            format!(
                "{}:{}:{}:{}",
                request.page_no, request.page_size, request.total_count, request.limit
            )
            .as_bytes(),
        );
        // BTreeSet iterates sorted, so insertion order never matters.
        for column in exclude {
            hasher.update([0u8]);
            hasher.update(column.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct ResultCache {
    entries: Cache<Fingerprint, Arc<PagedResult>>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl())
            .build();
        Self { entries }
    }

    /// Read-through with single flight.
    ///
    /// The first caller for `key` runs `compute`; callers arriving while it
    /// runs wait for it and share its outcome.
    pub async fn get_or_compute<F>(&self, key: Fingerprint, compute: F) -> SqlbookResult<Arc<PagedResult>>
    where
        F: Future<Output = SqlbookResult<PagedResult>>,
    {
        let fingerprint = key.clone();
        let result = self
            .entries
            .try_get_with(key, async move { compute.await.map(Arc::new) })
            .await
            .map_err(|e: Arc<SqlbookError>| (*e).clone());
        if let Err(e) = &result {
            debug!(target: "sqlbook::cache", %fingerprint, error = %e, "Computation failed, nothing cached");
        }
        result
    }

    /// Write-through: always run `compute` and replace the entry.
    pub async fn put_through<F>(&self, key: Fingerprint, compute: F) -> SqlbookResult<Arc<PagedResult>>
    where
        F: Future<Output = SqlbookResult<PagedResult>>,
    {
        let value = Arc::new(compute.await?);
        debug!(target: "sqlbook::cache", fingerprint = %key, "Refreshed entry");
        self.entries.insert(key, value.clone()).await;
        Ok(value)
    }

    pub async fn get(&self, key: &Fingerprint) -> Option<Arc<PagedResult>> {
        self.entries.get(key).await
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate; pending maintenance may lag behind recent writes.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    pub async fn sync(&self) {
        self.entries.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key() -> SourceKey {
        SourceKey {
            url: "memory://db".into(),
            username: Some("u".into()),
            password: None,
            version: None,
            name: "db".into(),
        }
    }

    fn fingerprint(sql: &str, requester: &str) -> Fingerprint {
        Fingerprint::compute(&key(), sql, requester, &PagingRequest::page(1, 10), &BTreeSet::new())
    }

    fn result(total: usize) -> PagedResult {
        PagedResult {
            total_count: total,
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_inputs() {
        let base = fingerprint("SELECT * FROM t", "alice");
        assert_eq!(base.as_str().len(), 64);
        assert_eq!(base, fingerprint("SELECT * FROM t -- same query", "alice"));
        assert_ne!(base, fingerprint("SELECT * FROM t", "bob"));
        assert_ne!(base, fingerprint("SELECT * FROM u", "alice"));

        let excluded: BTreeSet<String> = ["b".to_string(), "a".to_string()].into();
        let reordered: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        let paging = PagingRequest::page(1, 10);
        assert_eq!(
            Fingerprint::compute(&key(), "SELECT 1", "", &paging, &excluded),
            Fingerprint::compute(&key(), "SELECT 1", "", &paging, &reordered)
        );
        assert_ne!(
            Fingerprint::compute(&key(), "SELECT 1", "", &paging, &excluded),
            Fingerprint::compute(&key(), "SELECT 1", "", &PagingRequest::page(2, 10), &excluded)
        );
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = ResultCache::new(&CacheConfig::default());
        let executions = AtomicUsize::new(0);

        let calls = (0..8).map(|_| {
            cache.get_or_compute(fingerprint("SELECT * FROM t", "alice"), async {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(result(42))
            })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for r in &results {
            let r = r.as_ref().unwrap();
            assert!(Arc::ptr_eq(first, r));
            assert_eq!(r.total_count, 42);
        }
    }

    #[tokio::test]
    async fn test_errors_are_shared_not_cached() {
        let cache = ResultCache::new(&CacheConfig::default());
        let key = fingerprint("SELECT * FROM t", "alice");

        let err = cache
            .get_or_compute(key.clone(), async { Err(SqlbookError::execution("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, SqlbookError::Execution(_)));
        assert!(cache.get(&key).await.is_none());

        let ok = cache.get_or_compute(key.clone(), async { Ok(result(1)) }).await.unwrap();
        assert_eq!(ok.total_count, 1);
    }

    #[tokio::test]
    async fn test_put_through_overwrites() {
        let cache = ResultCache::new(&CacheConfig::default());
        let key = fingerprint("SELECT * FROM t", "alice");

        cache.get_or_compute(key.clone(), async { Ok(result(1)) }).await.unwrap();
        let refreshed = cache.put_through(key.clone(), async { Ok(result(2)) }).await.unwrap();
        assert_eq!(refreshed.total_count, 2);

        let cached = cache.get_or_compute(key.clone(), async { Ok(result(3)) }).await.unwrap();
        assert_eq!(cached.total_count, 2);

        cache.sync().await;
        assert_eq!(cache.entry_count(), 1);
        cache.invalidate_all();
        assert!(cache.get(&key).await.is_none());
    }
}
