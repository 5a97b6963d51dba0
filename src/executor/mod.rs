//! Paginated query executor.
//!
//! Every call sanitizes its SQL, picks native LIMIT paging or cursor
//! positioning from the source dialect, and materializes rows with alias
//! prefixes stripped from column labels.

pub mod metadata;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::alias::{self, PrefixSet};
use crate::cache::{Fingerprint, ResultCache};
use crate::config::SourceConfig;
use crate::driver::{ColumnMeta, StatementOptions};
use crate::error::{SqlbookError, SqlbookResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::sanitize;
use crate::source::SourceInfo;

/// Tracing target of the query log.
pub const QUERY_LOG_TARGET: &str = "sqlbook::sql";

/// One materialized row: stripped column label to value, in column order.
pub type Row = Map<String, Value>;

/// Paging parameters of one call. Values below 1 mean "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingRequest {
    pub page_no: i64,
    pub page_size: i64,
    /// Total count already known to the caller; 0 forces a count query.
    pub total_count: i64,
    pub limit: i64,
}

impl PagingRequest {
    pub fn page(page_no: i64, page_size: i64) -> Self {
        Self {
            page_no,
            page_size,
            ..Default::default()
        }
    }

    /// Fetch every row, subject to the limit and the global cap.
    pub fn export_all() -> Self {
        Self::default()
    }

    pub fn with_total_count(mut self, total_count: i64) -> Self {
        self.total_count = total_count;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Clamp every field below 1 to 0.
    pub fn normalized(self) -> Self {
        let unset = |v: i64| if v < 1 { 0 } else { v };
        Self {
            page_no: unset(self.page_no),
            page_size: unset(self.page_size),
            total_count: unset(self.total_count),
            limit: unset(self.limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult {
    pub columns: Vec<QueryColumn>,
    pub rows: Vec<Row>,
    pub page_no: usize,
    pub page_size: usize,
    pub total_count: usize,
}

/// How one call will fetch its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePlan {
    /// Fetch everything up to `max_rows`.
    ExportAll { max_rows: usize },
    Paged(PageWindow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub page_no: usize,
    pub page_size: usize,
    /// 0-based index of the first row of the page.
    pub start_row: usize,
    /// Driver row cap for cursor paging.
    pub max_rows: usize,
    /// The caller's total count cannot be trusted.
    pub needs_count: bool,
    /// Effective row limit, already capped by the global limit.
    pub limit: Option<usize>,
}

impl PageWindow {
    /// Rows of this page that fall inside `max_rows`.
    pub fn native_size(&self) -> usize {
        self.page_size.min(self.max_rows.saturating_sub(self.start_row))
    }
}

/// Plan a call. Pure; `result_limit` is the global cap.
///
/// A request without a page size is served as export-all; a page size
/// without a page number reads page 1. `page_size < 1` selects export-all
/// even when `page_no` is set, so `page(2, 0)` reads every row as page 1.
pub fn plan_page(request: &PagingRequest, result_limit: usize) -> PagePlan {
    let request = request.normalized();
    let limit = (request.limit > 0).then(|| (request.limit as usize).min(result_limit));

    if request.page_size < 1 {
        return PagePlan::ExportAll {
            max_rows: limit.unwrap_or(result_limit),
        };
    }

    let page_no = request.page_no.max(1) as usize;
    let page_size = request.page_size as usize;
    let reach = page_size.saturating_mul(page_no);

    PagePlan::Paged(PageWindow {
        page_no,
        page_size,
        start_row: (page_no - 1).saturating_mul(page_size),
        max_rows: limit.map_or(reach, |l| l.min(reach)),
        needs_count: page_no == 1 || request.total_count == 0,
        limit,
    })
}

/// 16 hex chars of the MD5 of `sql`.
pub fn sql_fingerprint(sql: &str) -> String {
    let digest = format!("{:x}", md5::compute(sql.as_bytes()));
    digest[..16].to_string()
}

/// Column layout after label stripping and exclusion.
struct Projection {
    columns: Vec<QueryColumn>,
    /// Row key per result column; `None` for excluded columns.
    keys: Vec<Option<String>>,
}

impl Projection {
    fn new(meta: &[ColumnMeta], prefixes: &PrefixSet, exclude: &BTreeSet<String>) -> Self {
        let mut columns = Vec::with_capacity(meta.len());
        let mut keys = Vec::with_capacity(meta.len());
        for column in meta {
            let label = alias::strip_label(prefixes, &column.label);
            if exclude.contains(label) {
                keys.push(None);
                continue;
            }
            columns.push(QueryColumn {
                name: label.to_string(),
                type_name: column.type_name.clone(),
            });
            keys.push(Some(label.to_string()));
        }
        Self { columns, keys }
    }

    fn row(&self, values: Vec<Value>) -> Row {
        let mut row = Row::new();
        for (key, value) in self.keys.iter().zip(values) {
            if let Some(key) = key {
                row.insert(key.clone(), value);
            }
        }
        row
    }
}

fn count_of(value: &Value) -> usize {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0) as usize,
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Runs queries against pooled sources.
///
/// Holds no per-call state; limits computed for one call never leak into
/// the next.
#[derive(Clone)]
pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
    result_limit: usize,
    fetch_size: usize,
    query_log: bool,
    cache: Option<Arc<ResultCache>>,
}

impl QueryExecutor {
    pub fn new(pool: Arc<ConnectionPool>, config: &SourceConfig) -> Self {
        Self {
            pool,
            result_limit: config.result_limit,
            fetch_size: config.fetch_size,
            query_log: config.enable_query_log,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn result_limit(&self) -> usize {
        self.result_limit
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    /// Run a statement that returns no rows, e.g. a session setting run
    /// before a sheet query.
    pub async fn execute(&self, source: &SourceInfo, sql: &str) -> SqlbookResult<u64> {
        let sql = sanitize::sanitize(sql)?;
        let started = Instant::now();
        let mut conn = self.pool.handle(source).await?;
        let affected = conn.execute(&sql).await?;
        if self.query_log {
            info!(
                target: QUERY_LOG_TARGET,
                fingerprint = %sql_fingerprint(&sql),
                elapsed_ms = started.elapsed().as_millis() as u64,
                affected,
                "Executed statement"
            );
        }
        Ok(affected)
    }

    /// Every row of `sql`, capped at `limit` and the global cap.
    pub async fn query_list(&self, source: &SourceInfo, sql: &str, limit: i64) -> SqlbookResult<Vec<Row>> {
        let request = PagingRequest::export_all().with_limit(limit);
        Ok(self
            .query_paged(source, sql, request, &BTreeSet::new())
            .await?
            .rows)
    }

    /// Fetch one page of `sql` (or everything, for export-all requests).
    pub async fn query_paged(
        &self,
        source: &SourceInfo,
        sql: &str,
        request: PagingRequest,
        exclude: &BTreeSet<String>,
    ) -> SqlbookResult<PagedResult> {
        let sql = sanitize::sanitize(sql)?;
        let dialect = source.dialect();
        let parser = dialect.parser_dialect();
        let prefixes = alias::column_prefixes(&sql, parser.as_ref());

        let started = Instant::now();
        let mut conn = self.pool.handle(source).await?;

        let result = match plan_page(&request, self.result_limit) {
            PagePlan::ExportAll { max_rows } => {
                let options = StatementOptions {
                    max_rows: Some(max_rows),
                    fetch_size: Some(self.fetch_size),
                    streaming: dialect.streaming_export,
                };
                let (columns, rows) = fetch(&mut conn, &sql, options, 0, None, &prefixes, exclude).await?;
                let count = rows.len();
                PagedResult {
                    columns,
                    rows,
                    page_no: 1,
                    page_size: count,
                    total_count: count,
                }
            }
            PagePlan::Paged(window) => {
                let mut total_count = if window.needs_count {
                    let count_sql = alias::count_query(&sql, parser.as_ref(), dialect.count_alias.as_deref());
                    self.count(&mut conn, &count_sql).await?
                } else {
                    request.normalized().total_count as usize
                };
                if let Some(limit) = window.limit {
                    total_count = total_count.min(limit);
                }

                let (columns, rows) = match dialect.page_clause(window.start_row, window.native_size()) {
                    Some(clause) => {
                        let paged_sql = format!("{}{}", sql.trim_end().trim_end_matches(';'), clause);
                        let options = StatementOptions {
                            fetch_size: Some(self.fetch_size),
                            ..Default::default()
                        };
                        if window.native_size() == 0 {
                            let meta = conn.describe(&sql).await?;
                            (Projection::new(&meta, &prefixes, exclude).columns, Vec::new())
                        } else {
                            fetch(&mut conn, &paged_sql, options, 0, Some(window.page_size), &prefixes, exclude)
                                .await?
                        }
                    }
                    None => {
                        let options = StatementOptions {
                            max_rows: Some(window.max_rows),
                            fetch_size: Some(self.fetch_size),
                            streaming: false,
                        };
                        fetch(
                            &mut conn,
                            &sql,
                            options,
                            window.start_row,
                            Some(window.page_size),
                            &prefixes,
                            exclude,
                        )
                        .await?
                    }
                };

                PagedResult {
                    columns,
                    rows,
                    page_no: window.page_no,
                    page_size: window.page_size,
                    total_count,
                }
            }
        };

        if self.query_log {
            info!(
                target: QUERY_LOG_TARGET,
                fingerprint = %sql_fingerprint(&sql),
                elapsed_ms = started.elapsed().as_millis() as u64,
                total_count = result.total_count,
                page_size = result.page_size,
                columns = result.columns.len(),
                "Executed query"
            );
            debug!(target: QUERY_LOG_TARGET, "{}", sql);
        }
        Ok(result)
    }

    /// [`query_paged`](Self::query_paged) through the result cache.
    ///
    /// Concurrent calls with the same fingerprint share one execution.
    pub async fn query_paged_cached(
        &self,
        source: &SourceInfo,
        sql: &str,
        request: PagingRequest,
        exclude: &BTreeSet<String>,
        requester: &str,
    ) -> SqlbookResult<Arc<PagedResult>> {
        let Some(cache) = &self.cache else {
            return self.query_paged(source, sql, request, exclude).await.map(Arc::new);
        };
        let key = Fingerprint::compute(&source.key(), sql, requester, &request, exclude);
        cache
            .get_or_compute(key, self.query_paged(source, sql, request, exclude))
            .await
    }

    /// Execute and overwrite the cached entry.
    pub async fn refresh_paged(
        &self,
        source: &SourceInfo,
        sql: &str,
        request: PagingRequest,
        exclude: &BTreeSet<String>,
        requester: &str,
    ) -> SqlbookResult<Arc<PagedResult>> {
        let Some(cache) = &self.cache else {
            return self.query_paged(source, sql, request, exclude).await.map(Arc::new);
        };
        let key = Fingerprint::compute(&source.key(), sql, requester, &request, exclude);
        cache
            .put_through(key, self.query_paged(source, sql, request, exclude))
            .await
    }

    async fn count(&self, conn: &mut PooledConnection, count_sql: &str) -> SqlbookResult<usize> {
        let mut cursor = conn.query(count_sql, StatementOptions::default()).await?;
        let value = cursor
            .next_row()
            .await?
            .and_then(|row| row.into_iter().next())
            .ok_or_else(|| SqlbookError::Execution(format!("Count query returned no rows: {count_sql}")))?;
        Ok(count_of(&value))
    }
}

/// Open a cursor, skip to `start_row` and collect up to `take` rows.
///
/// Absolute positioning is tried first; cursors that reject it are
/// advanced row by row.
async fn fetch(
    conn: &mut PooledConnection,
    sql: &str,
    options: StatementOptions,
    start_row: usize,
    take: Option<usize>,
    prefixes: &PrefixSet,
    exclude: &BTreeSet<String>,
) -> SqlbookResult<(Vec<QueryColumn>, Vec<Row>)> {
    let mut raw = Vec::new();
    let mut meta = {
        let mut cursor = conn.query(sql, options).await?;

        if start_row > 0 && !cursor.absolute(start_row).await? {
            let mut skipped = 0;
            while skipped < start_row {
                if cursor.next_row().await?.is_none() {
                    break;
                }
                skipped += 1;
            }
        }

        while take.is_none_or(|n| raw.len() < n) {
            match cursor.next_row().await? {
                Some(values) => raw.push(values),
                None => break,
            }
        }
        cursor.columns().to_vec()
    };

    if meta.is_empty() {
        meta = conn.describe(sql).await?;
    }

    let projection = Projection::new(&meta, prefixes, exclude);
    let rows = raw.into_iter().map(|values| projection.row(values)).collect();
    Ok((projection.columns, rows))
}
