//! Source metadata: databases, tables and columns.

use std::sync::Arc;

use serde::Serialize;

use crate::dialect::DialectKind;
use crate::error::SqlbookResult;
use crate::executor::QueryColumn;
use crate::pool::ConnectionPool;
use crate::source::SourceInfo;

/// Columns and primary key of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub table: String,
    pub primary_keys: Vec<String>,
    pub columns: Vec<QueryColumn>,
}

pub struct SourceInspector {
    pool: Arc<ConnectionPool>,
}

impl SourceInspector {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Databases visible to the source's user.
    ///
    /// Oracle exposes one database per user, named after the user.
    pub async fn databases(&self, source: &SourceInfo) -> SqlbookResult<Vec<String>> {
        if source.dialect().kind == DialectKind::Oracle {
            return Ok(source.username().map(str::to_string).into_iter().collect());
        }
        let mut conn = self.pool.handle(source).await?;
        let mut catalogs = conn.catalogs().await?;
        if catalogs.is_empty() {
            catalogs.extend(conn.current_catalog().await?);
        }
        Ok(catalogs)
    }

    /// Table and view names of `database`, filtered by the dialect's schema
    /// rule.
    pub async fn tables(&self, source: &SourceInfo, database: &str) -> SqlbookResult<Vec<String>> {
        let mut conn = self.pool.handle(source).await?;
        let current_schema = conn.current_schema().await?;
        let pattern = source
            .dialect()
            .schema_pattern(source.username(), current_schema.as_deref());
        let tables = conn.tables(database, pattern.as_deref()).await?;
        tracing::debug!(
            source = %source.name(),
            database,
            schema = ?pattern,
            count = tables.len(),
            "Listed tables"
        );
        Ok(tables.into_iter().map(|t| t.name).collect())
    }

    pub async fn table_info(&self, source: &SourceInfo, database: &str, table: &str) -> SqlbookResult<TableInfo> {
        let mut conn = self.pool.handle(source).await?;
        let primary_keys = conn.primary_keys(database, table).await?;
        let columns = conn
            .columns(database, table)
            .await?
            .into_iter()
            .map(|c| QueryColumn {
                name: c.label,
                type_name: c.type_name,
            })
            .collect();
        Ok(TableInfo {
            table: table.to_string(),
            primary_keys,
            columns,
        })
    }

    pub async fn table_exists(&self, source: &SourceInfo, database: &str, table: &str) -> SqlbookResult<bool> {
        let tables = self.tables(source, database).await?;
        Ok(tables.iter().any(|t| t.eq_ignore_ascii_case(table)))
    }

    /// Whether a connection to the source can be established.
    pub async fn test_connection(&self, source: &SourceInfo) -> bool {
        self.pool.probe(source).await
    }
}
