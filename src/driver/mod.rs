//! Database driver boundary.
//!
//! The executor, pool and inspector only ever talk to these traits.
//! [`any::AnyDriver`] implements them over `sqlx`; [`memory::MemoryDriver`]
//! is an in-process driver with canned tables used by tests and dry runs.

pub mod any;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::PoolConfig;
use crate::dialect::Dialect;
use crate::error::SqlbookResult;
use crate::source::SourceInfo;

/// Label and database type name of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub label: String,
    pub type_name: String,
}

impl ColumnMeta {
    pub fn new(label: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            type_name: type_name.into(),
        }
    }
}

/// One entry of a table listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    /// `TABLE` or `VIEW`.
    pub table_type: String,
}

/// Per-statement settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementOptions {
    /// Driver-side cap on returned rows. `None` means uncapped.
    pub max_rows: Option<usize>,
    pub fetch_size: Option<usize>,
    /// Stream rows instead of buffering the whole result.
    pub streaming: bool,
}

/// Opens data sources for the urls it accepts.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this driver can connect to `url` at all.
    fn accepts_url(&self, url: &str) -> bool;

    /// Whether this driver can serve sources of `dialect`.
    fn supports(&self, dialect: &Dialect) -> bool;

    async fn open(&self, source: &SourceInfo, pool: &PoolConfig) -> SqlbookResult<Arc<dyn DataSource>>;
}

/// A pooled handle to one logical source.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn acquire(&self) -> SqlbookResult<Box<dyn Connection>>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A single database connection.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement that returns no rows. Returns the affected row count.
    async fn execute(&mut self, sql: &str) -> SqlbookResult<u64>;

    /// Open a cursor over the rows of `sql`.
    async fn query<'c>(
        &'c mut self,
        sql: &'c str,
        options: StatementOptions,
    ) -> SqlbookResult<Box<dyn RowCursor + 'c>>;

    /// Column metadata of `sql` without fetching rows.
    ///
    /// Used when a query returns no rows and the cursor could not report
    /// its columns.
    async fn describe(&mut self, _sql: &str) -> SqlbookResult<Vec<ColumnMeta>> {
        Ok(Vec::new())
    }

    async fn current_catalog(&mut self) -> SqlbookResult<Option<String>>;

    async fn catalogs(&mut self) -> SqlbookResult<Vec<String>>;

    async fn current_schema(&mut self) -> SqlbookResult<Option<String>>;

    async fn tables(&mut self, catalog: &str, schema_pattern: Option<&str>) -> SqlbookResult<Vec<TableMeta>>;

    async fn columns(&mut self, catalog: &str, table: &str) -> SqlbookResult<Vec<ColumnMeta>>;

    async fn primary_keys(&mut self, catalog: &str, table: &str) -> SqlbookResult<Vec<String>>;
}

/// Forward-only row stream with optional absolute positioning.
#[async_trait]
pub trait RowCursor: Send {
    /// Columns of the result, in result-set order. May be empty until the
    /// first row has been fetched.
    fn columns(&self) -> &[ColumnMeta];

    /// Move so that the next row returned is row `row` (0-based).
    ///
    /// Returns `false` when the cursor does not support positioning; its
    /// position is then unchanged.
    async fn absolute(&mut self, _row: usize) -> SqlbookResult<bool> {
        Ok(false)
    }

    async fn next_row(&mut self) -> SqlbookResult<Option<Vec<Value>>>;
}
