//! The sqlbook facade.
//!
//! Wires configuration, dialect registry, driver, pool, cache and executor
//! together so callers only hold one value.

use std::sync::Arc;

use crate::cache::ResultCache;
use crate::config::Config;
use crate::dialect::DialectRegistry;
use crate::driver::Driver;
use crate::driver::any::AnyDriver;
use crate::error::SqlbookResult;
use crate::executor::QueryExecutor;
use crate::executor::metadata::SourceInspector;
use crate::pool::ConnectionPool;
use crate::report::Notifier;
use crate::report::workbook::WorkbookOrchestrator;
use crate::source::{SourceInfo, SourceInfoBuilder};

/// A configured sqlbook instance.
///
/// # Example
///
/// ```rust,ignore
/// let book = Sqlbook::with_sqlx(Config::default());
/// let source = book.source_info(SourceInfo::builder("sqlite://report.db"))?;
/// let rows = book.executor().query_list(&source, "SELECT * FROM orders", 100).await?;
/// ```
#[derive(Clone)]
pub struct Sqlbook {
    config: Arc<Config>,
    registry: Arc<DialectRegistry>,
    driver: Arc<dyn Driver>,
    executor: QueryExecutor,
}

impl Sqlbook {
    pub fn new(config: Config, driver: Arc<dyn Driver>) -> Self {
        let registry = DialectRegistry::with_custom(&config.dialects);
        let pool = Arc::new(ConnectionPool::new(driver.clone(), config.pool.clone()));
        let mut executor = QueryExecutor::new(pool, &config.source);
        if config.cache.enabled {
            executor = executor.with_cache(Arc::new(ResultCache::new(&config.cache)));
        }
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            driver,
            executor,
        }
    }

    /// Use the `sqlx` drivers for PostgreSQL, MySQL and SQLite.
    pub fn with_sqlx(config: Config) -> Self {
        Self::new(config, Arc::new(AnyDriver::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &DialectRegistry {
        &self.registry
    }

    /// Resolve the builder's dialect against this instance's registry and
    /// driver.
    pub fn source_info(&self, builder: SourceInfoBuilder) -> SqlbookResult<SourceInfo> {
        builder.build(&self.registry, self.driver.as_ref())
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn inspector(&self) -> SourceInspector {
        SourceInspector::new(self.executor.pool().clone())
    }

    pub fn orchestrator(&self, notifier: Arc<dyn Notifier>) -> WorkbookOrchestrator {
        WorkbookOrchestrator::new(self.executor.clone(), notifier, &self.config.report)
    }

    /// Close every pooled source and drop cached results.
    pub async fn shutdown(&self) {
        self.executor.pool().close_all().await;
        if let Some(cache) = self.executor.cache() {
            cache.invalidate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{CustomDialect, CustomPagination};
    use crate::driver::memory::{MemoryDriver, MemoryTable};
    use serde_json::json;

    fn book(config: Config) -> (MemoryDriver, Sqlbook) {
        let driver = MemoryDriver::new().with_table(
            "t",
            MemoryTable::new(&[("a", "INTEGER")]).rows((0..5).map(|i| vec![json!(i)])),
        );
        (driver.clone(), Sqlbook::new(config, Arc::new(driver)))
    }

    #[test]
    fn test_cache_follows_config() {
        let (_, cached) = book(Config::default());
        assert!(cached.executor().cache().is_some());
        let (_, uncached) = book(Config::builder().cache(false).build());
        assert!(uncached.executor().cache().is_none());
    }

    #[test]
    fn test_custom_dialect_registered() {
        let config = Config::builder()
            .dialect(CustomDialect {
                name: "kylin".into(),
                url_keyword: "kylin".into(),
                version: None,
                pagination: CustomPagination::Cursor,
                keyword_prefix: "\"".into(),
                keyword_suffix: "\"".into(),
                alias_prefix: "\"".into(),
                alias_suffix: "\"".into(),
                schema: None,
                streaming_export: false,
                count_alias: None,
            })
            .build();
        let (_, book) = book(config);
        let source = book.source_info(SourceInfo::builder("jdbc:kylin://h:7070/p")).unwrap();
        assert_eq!(source.dialect().name, "kylin");
    }

    #[tokio::test]
    async fn test_query_and_shutdown() {
        let (driver, book) = book(Config::builder().result_limit(3).build());
        let source = book.source_info(SourceInfo::builder("memory://db")).unwrap();
        let rows = book.executor().query_list(&source, "SELECT a FROM t", 0).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(driver.opened_count(), 1);

        book.shutdown().await;
        assert_eq!(book.executor().pool().partitions(), 0);
    }
}
