//! End-to-end tests against a SQLite file through the `sqlx` driver.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use sqlbook::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

async fn seed(path: &Path) {
    let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT NOT NULL, total REAL)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE customers (name TEXT PRIMARY KEY, region TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE VIEW big_orders AS SELECT * FROM orders WHERE total > 100")
        .execute(&pool)
        .await
        .unwrap();
    for id in 1..=25 {
        let customer = if id % 2 == 0 { "acme" } else { "globex" };
        sqlx::query("INSERT INTO orders (id, customer, total) VALUES (?, ?, ?)")
            .bind(id)
            .bind(customer)
            .bind(id as f64 * 10.0)
            .execute(&pool)
            .await
            .unwrap();
    }
    for (name, region) in [("acme", "north"), ("globex", "south")] {
        sqlx::query("INSERT INTO customers (name, region) VALUES (?, ?)")
            .bind(name)
            .bind(region)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;
}

struct Fixture {
    book: Sqlbook,
    source: SourceInfo,
    dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("report.db");
    seed(&db).await;

    let config = Config::builder()
        .output_dir(dir.path().join("out"))
        .build();
    let book = Sqlbook::with_sqlx(config);
    let source = book
        .source_info(SourceInfo::builder(format!("sqlite://{}", db.display())).name("report"))
        .unwrap();
    Fixture { book, source, dir }
}

#[tokio::test]
async fn test_native_paging() {
    let f = fixture().await;
    let request = PagingRequest::page(2, 10);

    let page = f
        .book
        .executor()
        .query_paged(&f.source, "SELECT o.id, o.customer FROM orders o ORDER BY o.id", request, &BTreeSet::new())
        .await
        .unwrap();

    assert_eq!(page.total_count, 25);
    assert_eq!(page.page_no, 2);
    assert_eq!(page.rows.len(), 10);
    assert_eq!(page.rows[0]["id"], json!(11));
    assert_eq!(page.rows[9]["id"], json!(20));
    let names: Vec<&str> = page.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "customer"]);
}

#[tokio::test]
async fn test_last_page_is_short() {
    let f = fixture().await;
    let page = f
        .book
        .executor()
        .query_paged(
            &f.source,
            "SELECT id FROM orders ORDER BY id",
            PagingRequest::page(3, 10).with_total_count(25),
            &BTreeSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 5);
    assert_eq!(page.total_count, 25);
}

#[tokio::test]
async fn test_limit_caps_total_and_rows() {
    let f = fixture().await;
    let page = f
        .book
        .executor()
        .query_paged(
            &f.source,
            "SELECT id FROM orders ORDER BY id",
            PagingRequest::page(2, 10).with_limit(15),
            &BTreeSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(page.total_count, 15);
    assert_eq!(page.rows.len(), 5);
    assert_eq!(page.rows[4]["id"], json!(15));
}

#[tokio::test]
async fn test_join_prefixes_and_exclusion() {
    let f = fixture().await;
    let exclude: BTreeSet<String> = ["region".to_string()].into();
    let rows = f
        .book
        .executor()
        .query_paged(
            &f.source,
            "SELECT o.id, c.name, c.region FROM orders o JOIN customers c ON c.name = o.customer ORDER BY o.id",
            PagingRequest::export_all().with_limit(3),
            &exclude,
        )
        .await
        .unwrap()
        .rows;

    assert_eq!(rows.len(), 3);
    let keys: Vec<&String> = rows[0].keys().collect();
    assert_eq!(keys, vec!["id", "name"]);
    assert_eq!(rows[1]["name"], json!("acme"));
}

#[tokio::test]
async fn test_blocked_statement() {
    let f = fixture().await;
    let err = f
        .book
        .executor()
        .query_list(&f.source, "DROP TABLE orders", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlbookError::SecurityViolation { ref token } if token == "DROP"));

    let rows = f
        .book
        .executor()
        .query_list(&f.source, "SELECT COUNT(*) AS n FROM orders", 0)
        .await
        .unwrap();
    assert_eq!(rows[0]["n"], json!(25));
}

#[tokio::test]
async fn test_computed_columns_decode_by_value() {
    let f = fixture().await;
    let rows = f
        .book
        .executor()
        .query_list(&f.source, "SELECT 1 + 1 AS n, 'a' || 'b' AS s, 2.5 * 2 AS x, NULL AS z", 0)
        .await
        .unwrap();
    assert_eq!(rows[0]["n"], json!(2));
    assert_eq!(rows[0]["s"], json!("ab"));
    assert_eq!(rows[0]["x"], json!(5.0));
    assert_eq!(rows[0]["z"], json!(null));
}

#[tokio::test]
async fn test_count_over_union() {
    let f = fixture().await;
    let page = f
        .book
        .executor()
        .query_paged(
            &f.source,
            "SELECT 1 AS n UNION ALL SELECT 2",
            PagingRequest::page(1, 10),
            &BTreeSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(page.total_count, 2);
    let values: Vec<&serde_json::Value> = page.rows.iter().map(|r| &r["n"]).collect();
    assert_eq!(values, vec![&json!(1), &json!(2)]);
}

#[tokio::test]
async fn test_cached_query_shares_result() {
    let f = fixture().await;
    let executor = f.book.executor();
    let sql = "SELECT id FROM orders ORDER BY id";
    let request = PagingRequest::page(1, 5);

    let first = executor
        .query_paged_cached(&f.source, sql, request, &BTreeSet::new(), "alice")
        .await
        .unwrap();
    let second = executor
        .query_paged_cached(&f.source, sql, request, &BTreeSet::new(), "alice")
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.rows.len(), 5);
}

#[tokio::test]
async fn test_metadata() {
    let f = fixture().await;
    let inspector = f.book.inspector();

    assert!(inspector.test_connection(&f.source).await);
    assert_eq!(inspector.databases(&f.source).await.unwrap(), vec!["main"]);

    let tables = inspector.tables(&f.source, "main").await.unwrap();
    assert_eq!(tables, vec!["big_orders", "customers", "orders"]);
    assert!(inspector.table_exists(&f.source, "main", "Orders").await.unwrap());

    let info = inspector.table_info(&f.source, "main", "orders").await.unwrap();
    assert_eq!(info.primary_keys, vec!["id"]);
    let columns: Vec<&str> = info.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["id", "customer", "total"]);
}

#[tokio::test]
async fn test_workbook_export() {
    let f = fixture().await;
    let source = Arc::new(f.source.clone());
    let (notifier, mut rx) = ChannelNotifier::channel();

    let job = WorkbookJob::new("sqlite", "x-9", ActionKind::Export)
        .row_limit(20)
        .sheet(SheetRequest {
            name: "Orders".into(),
            source: source.clone(),
            execute_sql: vec!["PRAGMA foreign_keys = ON".into()],
            query_sql: "SELECT id, customer, total FROM orders ORDER BY id".into(),
            exclude_columns: BTreeSet::new(),
            headers: None,
        })
        .sheet(SheetRequest {
            name: "Customers".into(),
            source,
            execute_sql: Vec::new(),
            query_sql: "SELECT name, region FROM customers".into(),
            exclude_columns: BTreeSet::new(),
            headers: Some(vec![SheetHeader {
                key: "region".into(),
                title: "Region".into(),
            }]),
        });

    let outcome = f.book.orchestrator(Arc::new(notifier)).run(job).await;
    let path = outcome.path().expect("artifact").to_path_buf();
    assert!(path.starts_with(f.dir.path().join("out")));
    assert_eq!(&std::fs::read(&path).unwrap()[..2], b"PK");

    let note = rx.try_recv().unwrap();
    assert_eq!(note.result.as_deref(), Some(path.as_path()));
    assert!(rx.try_recv().is_err());
    f.book.shutdown().await;
}
