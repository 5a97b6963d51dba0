//! In-process driver over canned tables.
//!
//! Understands just enough SQL to serve the executor: the table named after
//! the first `FROM`, a trailing `LIMIT` clause in either syntax, and the
//! `SELECT COUNT(*) FROM (...)` wrapper. Statement options, executed SQL and
//! query counts are recorded for inspection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{ColumnMeta, Connection, DataSource, Driver, RowCursor, StatementOptions, TableMeta};
use crate::config::PoolConfig;
use crate::dialect::{Dialect, DialectKind, url_keyword};
use crate::error::{SqlbookError, SqlbookResult};
use crate::source::SourceInfo;

static FROM_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bfrom\s+([A-Za-z_][A-Za-z0-9_]*)").expect("from pattern")
});

static COUNT_WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*select\s+count\(\*\)\s+from\s*\(").expect("count pattern")
});

static LIMIT_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\blimit\s+(\d+)(?:\s*,\s*(\d+)|\s+offset\s+(\d+))?\s*$").expect("limit pattern")
});

/// A canned table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    primary_key: Vec<String>,
    view: bool,
}

impl MemoryTable {
    /// Columns as `(label, type)` pairs. Labels may carry an alias prefix
    /// (`"u.name"`) to mimic join results.
    pub fn new(columns: &[(&str, &str)]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(label, ty)| ColumnMeta::new(*label, *ty))
                .collect(),
            ..Default::default()
        }
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn rows(mut self, rows: impl IntoIterator<Item = Vec<Value>>) -> Self {
        self.rows.extend(rows);
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn view(mut self) -> Self {
        self.view = true;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Default)]
struct MemoryState {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    failing: Mutex<BTreeSet<String>>,
    delays: Mutex<BTreeMap<String, Duration>>,
    executed: Mutex<Vec<String>>,
    last_options: Mutex<Option<StatementOptions>>,
    non_scrollable: AtomicBool,
    unavailable: AtomicBool,
    refused_acquires: AtomicUsize,
    queries: AtomicUsize,
    opened: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle; clones observe the same tables and counters.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, table: MemoryTable) -> Self {
        self.add_table(name, table);
        self
    }

    pub fn add_table(&self, name: &str, table: MemoryTable) {
        lock(&self.state.tables).insert(name.to_lowercase(), table);
    }

    /// Make every statement touching `table` fail.
    pub fn fail_on(&self, table: &str) {
        lock(&self.state.failing).insert(table.to_lowercase());
    }

    /// Delay every query over `table`.
    pub fn delay_on(&self, table: &str, delay: Duration) {
        lock(&self.state.delays).insert(table.to_lowercase(), delay);
    }

    /// Cursors reject absolute positioning when `false`.
    pub fn set_scrollable(&self, scrollable: bool) {
        self.state.non_scrollable.store(!scrollable, Ordering::SeqCst);
    }

    /// Refuse to open or hand out connections while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Refuse the next `count` connection checkouts.
    pub fn refuse_acquires(&self, count: usize) {
        self.state.refused_acquires.store(count, Ordering::SeqCst);
    }

    /// Number of row queries issued, count queries included.
    pub fn query_count(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    /// Number of data sources opened.
    pub fn opened_count(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Every statement received, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.state.executed).clone()
    }

    pub fn last_options(&self) -> Option<StatementOptions> {
        *lock(&self.state.last_options)
    }
}

impl MemoryState {
    fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    fn take_refusal(&self) -> bool {
        self.refused_acquires
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record(&self, sql: &str) {
        lock(&self.executed).push(sql.to_string());
    }

    fn referenced_table(sql: &str) -> Option<String> {
        FROM_TABLE
            .captures(sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
    }

    fn check_failing(&self, sql: &str) -> SqlbookResult<()> {
        let failing = lock(&self.failing);
        let lowered = sql.to_lowercase();
        if let Some(table) = failing.iter().find(|t| lowered.contains(t.as_str())) {
            return Err(SqlbookError::Execution(format!("Injected failure on {table}")));
        }
        Ok(())
    }

    fn delay_for(&self, table: &str) -> Option<Duration> {
        lock(&self.delays).get(table).copied()
    }

    fn table(&self, name: &str) -> SqlbookResult<MemoryTable> {
        lock(&self.tables)
            .get(name)
            .cloned()
            .ok_or_else(|| SqlbookError::Execution(format!("no such table: {name}")))
    }
}

/// `(offset, size)` of a trailing LIMIT clause.
fn limit_window(sql: &str) -> Option<(usize, usize)> {
    let caps = LIMIT_CLAUSE.captures(sql.trim_end_matches(';'))?;
    let first: usize = caps.get(1)?.as_str().parse().ok()?;
    if let Some(size) = caps.get(2) {
        return Some((first, size.as_str().parse().ok()?));
    }
    if let Some(offset) = caps.get(3) {
        return Some((offset.as_str().parse().ok()?, first));
    }
    Some((0, first))
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url_keyword(url).is_some_and(|k| k == "memory" || DialectKind::from_keyword(&k).is_some())
    }

    fn supports(&self, _dialect: &Dialect) -> bool {
        true
    }

    async fn open(&self, source: &SourceInfo, _pool: &PoolConfig) -> SqlbookResult<Arc<dyn DataSource>> {
        if self.state.is_unavailable() {
            return Err(SqlbookError::Connection(format!("{} is unavailable", source.name())));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySource {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySource {
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

#[async_trait]
impl DataSource for MemorySource {
    async fn acquire(&self) -> SqlbookResult<Box<dyn Connection>> {
        if self.is_closed() || self.state.is_unavailable() || self.state.take_refusal() {
            return Err(SqlbookError::Connection("memory source unavailable".to_string()));
        }
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryConnection {
    state: Arc<MemoryState>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> SqlbookResult<u64> {
        self.state.record(sql);
        self.state.check_failing(sql)?;
        Ok(0)
    }

    async fn query<'c>(
        &'c mut self,
        sql: &'c str,
        options: StatementOptions,
    ) -> SqlbookResult<Box<dyn RowCursor + 'c>> {
        self.state.record(sql);
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.last_options) = Some(options);
        self.state.check_failing(sql)?;

        let name = MemoryState::referenced_table(sql)
            .ok_or_else(|| SqlbookError::Execution(format!("no table referenced: {sql}")))?;
        if let Some(delay) = self.state.delay_for(&name) {
            tokio::time::sleep(delay).await;
        }
        let table = self.state.table(&name)?;

        if COUNT_WRAPPER.is_match(sql) {
            return Ok(Box::new(MemoryCursor {
                columns: vec![ColumnMeta::new("COUNT(*)", "BIGINT")],
                rows: vec![vec![Value::from(table.rows.len() as u64)]],
                position: 0,
                max_rows: None,
                scrollable: true,
            }));
        }

        let rows = match limit_window(sql) {
            Some((offset, size)) => table.rows.into_iter().skip(offset).take(size).collect(),
            None => table.rows,
        };
        Ok(Box::new(MemoryCursor {
            columns: table.columns,
            rows,
            position: 0,
            max_rows: options.max_rows,
            scrollable: !self.state.non_scrollable.load(Ordering::SeqCst),
        }))
    }

    async fn describe(&mut self, sql: &str) -> SqlbookResult<Vec<ColumnMeta>> {
        match MemoryState::referenced_table(sql) {
            Some(name) => Ok(self.state.table(&name)?.columns),
            None => Ok(Vec::new()),
        }
    }

    async fn current_catalog(&mut self) -> SqlbookResult<Option<String>> {
        Ok(Some("memory".to_string()))
    }

    async fn catalogs(&mut self) -> SqlbookResult<Vec<String>> {
        Ok(vec!["memory".to_string()])
    }

    async fn current_schema(&mut self) -> SqlbookResult<Option<String>> {
        Ok(Some("main".to_string()))
    }

    async fn tables(&mut self, _catalog: &str, _schema_pattern: Option<&str>) -> SqlbookResult<Vec<TableMeta>> {
        Ok(lock(&self.state.tables)
            .iter()
            .map(|(name, table)| TableMeta {
                name: name.clone(),
                table_type: if table.view { "VIEW" } else { "TABLE" }.to_string(),
            })
            .collect())
    }

    async fn columns(&mut self, _catalog: &str, table: &str) -> SqlbookResult<Vec<ColumnMeta>> {
        Ok(self.state.table(&table.to_lowercase())?.columns)
    }

    async fn primary_keys(&mut self, _catalog: &str, table: &str) -> SqlbookResult<Vec<String>> {
        Ok(self.state.table(&table.to_lowercase())?.primary_key)
    }
}

struct MemoryCursor {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    position: usize,
    max_rows: Option<usize>,
    scrollable: bool,
}

impl MemoryCursor {
    fn visible(&self) -> usize {
        self.max_rows.map_or(self.rows.len(), |max| max.min(self.rows.len()))
    }
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn absolute(&mut self, row: usize) -> SqlbookResult<bool> {
        if !self.scrollable {
            return Ok(false);
        }
        self.position = row;
        Ok(true)
    }

    async fn next_row(&mut self) -> SqlbookResult<Option<Vec<Value>>> {
        if self.position >= self.visible() {
            return Ok(None);
        }
        let row = self.rows[self.position].clone();
        self.position += 1;
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_window() {
        assert_eq!(limit_window("SELECT * FROM t LIMIT 10, 5"), Some((10, 5)));
        assert_eq!(limit_window("SELECT * FROM t LIMIT 5 OFFSET 10"), Some((10, 5)));
        assert_eq!(limit_window("SELECT * FROM t limit 7"), Some((0, 7)));
        assert_eq!(limit_window("SELECT * FROM t"), None);
    }

    #[test]
    fn test_referenced_table() {
        assert_eq!(
            MemoryState::referenced_table("SELECT COUNT(*) FROM (SELECT * FROM Users u) CT").as_deref(),
            Some("users")
        );
    }

    #[tokio::test]
    async fn test_cursor_honours_max_rows_and_positioning() {
        let driver = MemoryDriver::new().with_table(
            "nums",
            MemoryTable::new(&[("n", "INTEGER")]).rows((0..10).map(|i| vec![Value::from(i)])),
        );
        let source = SourceInfo::builder("memory://local")
            .build(&crate::dialect::DialectRegistry::builtin(), &driver)
            .unwrap();
        let ds = driver.open(&source, &PoolConfig::default()).await.unwrap();
        let mut conn = ds.acquire().await.unwrap();

        let options = StatementOptions {
            max_rows: Some(4),
            ..Default::default()
        };
        let mut cursor = conn.query("SELECT n FROM nums", options).await.unwrap();
        assert!(cursor.absolute(2).await.unwrap());
        let mut seen = Vec::new();
        while let Some(row) = cursor.next_row().await.unwrap() {
            seen.push(row[0].clone());
        }
        assert_eq!(seen, vec![Value::from(2), Value::from(3)]);
    }
}
