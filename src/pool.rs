//! Connection pool partitioned by source identity.
//!
//! Each [`SourceKey`] gets its own driver [`DataSource`], opened lazily on
//! first use. Acquisition never errors: exhaustion, timeouts and broken
//! sources all come back as `None`, and callers treat that as "source
//! unavailable".

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::driver::{Connection, DataSource, Driver};
use crate::error::{SqlbookError, SqlbookResult};
use crate::source::{SourceInfo, SourceKey};

/// A connection checked out of a pool partition.
///
/// Dropping it returns the connection to its partition.
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    key: SourceKey,
}

impl PooledConnection {
    pub fn key(&self) -> &SourceKey {
        &self.key
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

pub struct ConnectionPool {
    driver: Arc<dyn Driver>,
    config: PoolConfig,
    sources: DashMap<SourceKey, Arc<dyn DataSource>>,
}

impl ConnectionPool {
    pub fn new(driver: Arc<dyn Driver>, config: PoolConfig) -> Self {
        Self {
            driver,
            config,
            sources: DashMap::new(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Number of open partitions.
    pub fn partitions(&self) -> usize {
        self.sources.len()
    }

    async fn data_source(&self, source: &SourceInfo) -> SqlbookResult<Arc<dyn DataSource>> {
        let key = source.key();
        let cached = self.sources.get(&key).map(|entry| entry.value().clone());
        if let Some(ds) = cached {
            if !ds.is_closed() {
                return Ok(ds);
            }
        }

        let opened = self.driver.open(source, &self.config).await?;
        debug!(source = %source.name(), "Opened pool partition");

        // Another task may have opened the same partition meanwhile; the
        // first live one wins.
        let (chosen, loser) = match self.sources.entry(key) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                entry.insert(opened.clone());
                (opened, None)
            }
            Entry::Occupied(entry) => (entry.get().clone(), Some(opened)),
            Entry::Vacant(entry) => {
                entry.insert(opened.clone());
                (opened, None)
            }
        };
        if let Some(loser) = loser {
            loser.close().await;
        }
        Ok(chosen)
    }

    /// Check out a connection, waiting at most `acquire_timeout`.
    pub async fn acquire(&self, source: &SourceInfo) -> Option<PooledConnection> {
        let wait = self.config.acquire_timeout();
        let attempt = async {
            let ds = self.data_source(source).await?;
            ds.acquire().await
        };

        match tokio::time::timeout(wait, attempt).await {
            Ok(Ok(conn)) => Some(PooledConnection {
                conn,
                key: source.key(),
            }),
            Ok(Err(e)) => {
                warn!(source = %source.name(), error = %e, "Failed to acquire connection");
                None
            }
            Err(_) => {
                warn!(
                    source = %source.name(),
                    "Timed out waiting for connection ({}s)",
                    wait.as_secs()
                );
                None
            }
        }
    }

    /// Return a connection to its partition. `None` is a no-op.
    pub fn release(&self, conn: Option<PooledConnection>) {
        if let Some(conn) = conn {
            debug!(source = %conn.key.name, "Released connection");
        }
    }

    /// Check out and immediately return a connection.
    pub async fn probe(&self, source: &SourceInfo) -> bool {
        let conn = self.acquire(source).await;
        let ok = conn.is_some();
        self.release(conn);
        ok
    }

    /// A connection for query execution.
    ///
    /// A failed probe drops the partition so the next acquire rebuilds it.
    /// Unavailability surfaces as [`SqlbookError::Connection`].
    pub async fn handle(&self, source: &SourceInfo) -> SqlbookResult<PooledConnection> {
        if !self.probe(source).await {
            warn!(source = %source.name(), "Probe failed, rebuilding pool partition");
            self.invalidate(source).await;
        }
        self.acquire(source)
            .await
            .ok_or_else(|| SqlbookError::Connection(format!("Source unavailable: {}", source.name())))
    }

    /// Close and forget the partition of `source`.
    pub async fn invalidate(&self, source: &SourceInfo) {
        if let Some((_, ds)) = self.sources.remove(&source.key()) {
            ds.close().await;
        }
    }

    /// Close every partition.
    pub async fn close_all(&self) {
        let keys: Vec<SourceKey> = self.sources.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, ds)) = self.sources.remove(&key) {
                ds.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectRegistry;
    use crate::driver::memory::MemoryDriver;

    fn source(driver: &MemoryDriver, name: &str) -> SourceInfo {
        SourceInfo::builder("memory://local")
            .name(name)
            .build(&DialectRegistry::builtin(), driver)
            .unwrap()
    }

    #[tokio::test]
    async fn test_partitions_by_source_identity() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()), PoolConfig::default());

        let a = pool.acquire(&source(&driver, "a")).await;
        let again = pool.acquire(&source(&driver, "a")).await;
        let b = pool.acquire(&source(&driver, "b")).await;
        assert!(a.is_some() && again.is_some() && b.is_some());
        assert_eq!(pool.partitions(), 2);
        assert_eq!(driver.opened_count(), 2);

        pool.release(a);
        pool.release(None);
    }

    #[tokio::test]
    async fn test_unavailable_source_yields_none() {
        let driver = MemoryDriver::new();
        driver.set_unavailable(true);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), PoolConfig::default());
        let src = source(&driver, "down");

        assert!(pool.acquire(&src).await.is_none());
        assert!(!pool.probe(&src).await);

        let err = pool.handle(&src).await.err().unwrap();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_handle_rebuilds_broken_partition() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()), PoolConfig::default());
        let src = source(&driver, "flaky");

        assert!(pool.probe(&src).await);
        assert_eq!(driver.opened_count(), 1);

        // The live partition refuses its next checkout, so the health check
        // inside `handle` fails and the partition is reopened.
        driver.refuse_acquires(1);
        let conn = pool.handle(&src).await;
        assert!(conn.is_ok());
        assert_eq!(driver.opened_count(), 2);
        assert_eq!(pool.partitions(), 1);
        pool.release(conn.ok());

        pool.close_all().await;
        assert_eq!(pool.partitions(), 0);
    }

    #[tokio::test]
    async fn test_handle_drops_partition_while_down() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()), PoolConfig::default());
        let src = source(&driver, "flaky");

        assert!(pool.probe(&src).await);
        driver.set_unavailable(true);
        assert!(pool.handle(&src).await.is_err());
        assert_eq!(pool.partitions(), 0);

        driver.set_unavailable(false);
        assert!(pool.handle(&src).await.is_ok());
        assert_eq!(driver.opened_count(), 2);
    }
}
