//! One sheet of a workbook: pre-statements, an export-all query, and the
//! rows it produced.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use super::{JobLogger, SheetHeader, SheetRequest};
use crate::error::SqlbookResult;
use crate::executor::{PagingRequest, QueryExecutor};
use crate::source::SourceInfo;

/// Longest sheet name a workbook accepts.
pub const MAX_SHEET_NAME: usize = 31;

/// `"{ordinal}-{name}"`, made acceptable as a worksheet name.
pub fn sheet_name(ordinal: usize, name: &str) -> String {
    let raw = format!("{ordinal}-{name}");
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_SHEET_NAME)
        .collect();
    cleaned.trim_end_matches('\'').to_string()
}

/// A rendered cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Cell {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Empty,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n
                .as_f64()
                .map_or_else(|| Self::Text(n.to_string()), Self::Number),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

/// Output sheet owned by one task until it completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetBuffer {
    pub ordinal: usize,
    pub name: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Everything one sheet task needs. Built before any task starts.
#[derive(Debug, Clone)]
pub struct SheetSpec {
    /// 1-based position in the workbook.
    pub ordinal: usize,
    pub name: String,
    pub source: Arc<SourceInfo>,
    pub execute_sql: Vec<String>,
    pub query_sql: String,
    pub exclude_columns: BTreeSet<String>,
    pub headers: Option<Vec<SheetHeader>>,
    pub row_limit: i64,
    pub sheet: SheetBuffer,
}

impl SheetSpec {
    pub fn new(ordinal: usize, request: SheetRequest, row_limit: i64) -> Self {
        let sheet = SheetBuffer {
            ordinal,
            name: sheet_name(ordinal, &request.name),
            ..Default::default()
        };
        Self {
            ordinal,
            name: request.name,
            source: request.source,
            execute_sql: request.execute_sql,
            query_sql: request.query_sql,
            exclude_columns: request.exclude_columns,
            headers: request.headers,
            row_limit,
            sheet,
        }
    }
}

/// Result of one sheet task. `sheet` is `None` when the task failed.
#[derive(Debug)]
pub struct SheetOutcome {
    pub ordinal: usize,
    pub sheet: Option<SheetBuffer>,
}

impl SheetOutcome {
    pub fn success(&self) -> bool {
        self.sheet.is_some()
    }
}

pub struct SheetTask {
    spec: SheetSpec,
    executor: QueryExecutor,
    task_key: String,
    logger: Option<Arc<dyn JobLogger>>,
}

impl SheetTask {
    pub fn new(
        spec: SheetSpec,
        executor: QueryExecutor,
        task_key: impl Into<String>,
        logger: Option<Arc<dyn JobLogger>>,
    ) -> Self {
        Self {
            spec,
            executor,
            task_key: task_key.into(),
            logger,
        }
    }

    /// Run the sheet. Never fails; errors are logged and reported as an
    /// outcome without a sheet.
    pub async fn run(self) -> SheetOutcome {
        let ordinal = self.spec.ordinal;
        debug!(task_key = %self.task_key, ordinal, "Sheet task started");

        match fill(&self.executor, self.spec).await {
            Ok(sheet) => {
                debug!(task_key = %self.task_key, ordinal, rows = sheet.rows.len(), "Sheet task finished");
                SheetOutcome {
                    ordinal,
                    sheet: Some(sheet),
                }
            }
            Err(e) => {
                error!(task_key = %self.task_key, ordinal, error = %e, "Sheet task failed");
                if let Some(logger) = &self.logger {
                    logger.error(&format!("Task({}) sheet {} failed: {}", self.task_key, ordinal, e));
                }
                SheetOutcome { ordinal, sheet: None }
            }
        }
    }
}

async fn fill(executor: &QueryExecutor, spec: SheetSpec) -> SqlbookResult<SheetBuffer> {
    for sql in spec.execute_sql.iter().filter(|s| !s.trim().is_empty()) {
        executor.execute(&spec.source, sql).await?;
    }

    let request = PagingRequest::export_all().with_limit(spec.row_limit);
    let result = executor
        .query_paged(&spec.source, &spec.query_sql, request, &spec.exclude_columns)
        .await?;

    let (keys, titles): (Vec<String>, Vec<String>) = match &spec.headers {
        Some(headers) if !headers.is_empty() => headers
            .iter()
            .map(|h| (h.key.clone(), h.title.clone()))
            .unzip(),
        _ => result
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.name.clone()))
            .unzip(),
    };

    let mut sheet = spec.sheet;
    sheet.header = titles;
    sheet.rows = result
        .rows
        .iter()
        .map(|row| {
            keys.iter()
                .map(|key| row.get(key).map_or(Cell::Empty, Cell::from_value))
                .collect()
        })
        .collect();
    Ok(sheet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, SourceConfig};
    use crate::dialect::DialectRegistry;
    use crate::driver::memory::{MemoryDriver, MemoryTable};
    use crate::pool::ConnectionPool;
    use serde_json::json;

    #[test]
    fn test_sheet_name() {
        assert_eq!(sheet_name(1, "Sales"), "1-Sales");
        assert_eq!(sheet_name(2, "a/b:c"), "2-a_b_c");
        let long = sheet_name(10, &"x".repeat(50));
        assert_eq!(long.chars().count(), MAX_SHEET_NAME);
        assert!(long.starts_with("10-"));
        assert_eq!(sheet_name(3, "it's'"), "3-it's");
    }

    #[test]
    fn test_cell_from_value() {
        assert_eq!(Cell::from_value(&json!(null)), Cell::Empty);
        assert_eq!(Cell::from_value(&json!(2.5)), Cell::Number(2.5));
        assert_eq!(Cell::from_value(&json!(true)), Cell::Bool(true));
        assert_eq!(Cell::from_value(&json!("a")), Cell::Text("a".into()));
        assert_eq!(Cell::from_value(&json!([1, 2])), Cell::Text("[1,2]".into()));
    }

    fn task(driver: &MemoryDriver, query: &str, headers: Option<Vec<SheetHeader>>) -> SheetTask {
        let pool = Arc::new(ConnectionPool::new(Arc::new(driver.clone()), PoolConfig::default()));
        let executor = QueryExecutor::new(pool, &SourceConfig::default());
        let source = SourceInfo::builder("memory://db")
            .build(&DialectRegistry::builtin(), driver)
            .unwrap();
        let request = SheetRequest {
            name: "Orders".into(),
            source: Arc::new(source),
            execute_sql: vec!["SET search_path = public".into(), " ".into()],
            query_sql: query.into(),
            exclude_columns: ["internal".to_string()].into(),
            headers,
        };
        SheetTask::new(SheetSpec::new(1, request, 2), executor, "job-1", None)
    }

    fn orders() -> MemoryDriver {
        MemoryDriver::new().with_table(
            "orders",
            MemoryTable::new(&[("o.id", "INTEGER"), ("o.total", "REAL"), ("o.internal", "TEXT")])
                .row(vec![json!(1), json!(9.5), json!("x")])
                .row(vec![json!(2), json!(null), json!("y")])
                .row(vec![json!(3), json!(1.0), json!("z")]),
        )
    }

    #[tokio::test]
    async fn test_fills_header_and_rows() {
        let driver = orders();
        let outcome = task(&driver, "SELECT * FROM orders o", None).run().await;

        assert!(outcome.success());
        let sheet = outcome.sheet.unwrap();
        assert_eq!(sheet.name, "1-Orders");
        assert_eq!(sheet.header, vec!["id", "total"]);
        assert_eq!(sheet.rows.len(), 2, "row limit applies");
        assert_eq!(sheet.rows[1], vec![Cell::Number(2.0), Cell::Empty]);
        assert_eq!(driver.executed()[0], "SET search_path = public");
    }

    #[tokio::test]
    async fn test_custom_headers_select_columns() {
        let driver = orders();
        let headers = vec![SheetHeader {
            key: "total".into(),
            title: "Order total".into(),
        }];
        let sheet = task(&driver, "SELECT * FROM orders o", Some(headers))
            .run()
            .await
            .sheet
            .unwrap();
        assert_eq!(sheet.header, vec!["Order total"]);
        assert_eq!(sheet.rows[0], vec![Cell::Number(9.5)]);
    }

    #[tokio::test]
    async fn test_failure_yields_no_sheet() {
        let driver = orders();
        driver.fail_on("orders");
        let outcome = task(&driver, "SELECT * FROM orders o", None).run().await;
        assert!(!outcome.success());
        assert_eq!(outcome.ordinal, 1);
    }
}
