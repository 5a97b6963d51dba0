//! sqlbook: paged SQL queries and workbook exports from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Run a workbook job
//! sqlbook export daily.toml
//!
//! # Page through a query
//! sqlbook query sqlite://report.db "SELECT * FROM orders" --page 2 --size 20
//!
//! # Preview sanitizing and the count query
//! sqlbook check "SELECT a, b FROM t ORDER BY a"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Deserialize;
use sqlbook::prelude::*;
use sqlbook::{alias, sanitize};
use sqlbook::source::SourceInfoBuilder;

#[derive(Parser)]
#[command(name = "sqlbook")]
#[command(version)]
#[command(about = "Multi-dialect SQL paging and workbook reports", long_about = None)]
#[command(after_help = "EXAMPLES:
    sqlbook export jobs/daily.toml
    sqlbook query sqlite://report.db 'SELECT * FROM orders' --page 1 --size 20
    sqlbook tables postgres://report@db/app
    sqlbook check 'SELECT a, b FROM t ORDER BY a'")]
struct Cli {
    /// Configuration file (defaults to <config dir>/sqlbook/config.toml)
    #[arg(short, long, global = true, env = "SQLBOOK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Args)]
struct SourceArgs {
    /// Connection URL
    url: String,

    #[arg(short, long, env = "SQLBOOK_USER")]
    username: Option<String>,

    #[arg(short, long, env = "SQLBOOK_PASSWORD")]
    password: Option<String>,

    /// Database product version, used for dialect lookup
    #[arg(long)]
    db_version: Option<String>,
}

impl SourceArgs {
    fn builder(&self) -> SourceInfoBuilder {
        let mut builder = SourceInfo::builder(&self.url);
        if let Some(username) = &self.username {
            builder = builder.username(username);
        }
        if let Some(password) = &self.password {
            builder = builder.password(password);
        }
        if let Some(version) = &self.db_version {
            builder = builder.version(version);
        }
        builder
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workbook job described by a TOML file
    Export {
        job: PathBuf,

        /// Override the artifact directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Run a query and print one page of it
    Query {
        #[command(flatten)]
        source: SourceArgs,

        sql: String,

        /// Page number; 0 exports every row
        #[arg(long, default_value_t = 1)]
        page: i64,

        #[arg(long, default_value_t = 20)]
        size: i64,

        /// Row limit for this call
        #[arg(long, default_value_t = 0)]
        limit: i64,

        /// Columns left out of the result
        #[arg(short, long, value_delimiter = ',')]
        exclude: Vec<String>,

        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// List the tables of a source
    Tables {
        #[command(flatten)]
        source: SourceArgs,

        /// Database to list; defaults to every visible one
        #[arg(short, long)]
        database: Option<String>,
    },
    /// Sanitize SQL and preview its count query
    Check {
        sql: String,

        /// URL whose dialect is used for parsing
        #[arg(long, default_value = "mysql://localhost")]
        url: String,
    },
}

/// Workbook job file.
#[derive(Deserialize)]
struct JobFile {
    task_key: String,
    xid: String,
    #[serde(default = "default_action")]
    action: ActionKind,
    #[serde(default)]
    requester: String,
    #[serde(default)]
    row_limit: i64,
    sources: BTreeMap<String, JobSource>,
    sheets: Vec<JobSheet>,
}

fn default_action() -> ActionKind {
    ActionKind::Export
}

#[derive(Deserialize)]
struct JobSource {
    url: String,
    username: Option<String>,
    password: Option<String>,
    version: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct JobSheet {
    name: String,
    source: String,
    #[serde(default)]
    execute_sql: Vec<String>,
    query_sql: String,
    #[serde(default)]
    exclude_columns: BTreeSet<String>,
    headers: Option<Vec<SheetHeader>>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Export { job, output_dir } => {
            let mut config = config;
            if let Some(dir) = output_dir {
                config.report.output_dir = dir;
            }
            export(Sqlbook::with_sqlx(config), job).await
        }
        Commands::Query {
            source,
            sql,
            page,
            size,
            limit,
            exclude,
            format,
        } => {
            let book = Sqlbook::with_sqlx(config);
            let info = book.source_info(source.builder())?;
            let request = if page < 1 {
                PagingRequest::export_all()
            } else {
                PagingRequest::page(page, size)
            }
            .with_limit(limit);
            let exclude: BTreeSet<String> = exclude.into_iter().collect();

            let result = book.executor().query_paged(&info, &sql, request, &exclude).await?;
            book.shutdown().await;
            print_result(&result, format);
            Ok(())
        }
        Commands::Tables { source, database } => {
            let book = Sqlbook::with_sqlx(config);
            let info = book.source_info(source.builder())?;
            let inspector = book.inspector();

            let databases = match database {
                Some(db) => vec![db],
                None => inspector.databases(&info).await?,
            };
            for db in databases {
                println!("{}", db.cyan().bold());
                for table in inspector.tables(&info, &db).await? {
                    println!("  {}", table.white());
                }
            }
            book.shutdown().await;
            Ok(())
        }
        Commands::Check { sql, url } => check(&config, &sql, &url),
    }
}

async fn export(book: Sqlbook, path: PathBuf) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let file: JobFile = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut sources = BTreeMap::new();
    for (name, src) in file.sources {
        let mut builder = SourceInfo::builder(src.url).name(&name);
        if let Some(username) = src.username {
            builder = builder.username(username);
        }
        if let Some(password) = src.password {
            builder = builder.password(password);
        }
        if let Some(version) = src.version {
            builder = builder.version(version);
        }
        for (key, value) in src.properties {
            builder = builder.property(key, value);
        }
        let info = book
            .source_info(builder)
            .with_context(|| format!("source {name}"))?;
        sources.insert(name, Arc::new(info));
    }

    let mut job = WorkbookJob::new(file.task_key, file.xid, file.action)
        .requester(file.requester)
        .row_limit(file.row_limit);
    for sheet in file.sheets {
        let Some(source) = sources.get(&sheet.source) else {
            bail!("sheet {} references unknown source {}", sheet.name, sheet.source);
        };
        job = job.sheet(SheetRequest {
            name: sheet.name,
            source: source.clone(),
            execute_sql: sheet.execute_sql,
            query_sql: sheet.query_sql,
            exclude_columns: sheet.exclude_columns,
            headers: sheet.headers,
        });
    }

    let outcome = book.orchestrator(Arc::new(LogNotifier)).run(job).await;
    book.shutdown().await;

    match outcome {
        JobOutcome::Success(path) => {
            println!("{} {}", "✓".green(), path.display().to_string().cyan());
            Ok(())
        }
        JobOutcome::Failed(JobFailure::SheetsFailed { failed }) => bail!("sheets {failed:?} failed"),
        JobOutcome::Failed(JobFailure::Timeout { ordinal }) => bail!("sheet {ordinal} timed out"),
        JobOutcome::Failed(JobFailure::Fault(e)) => Err(e.into()),
    }
}

fn check(config: &Config, sql: &str, url: &str) -> anyhow::Result<()> {
    let registry = DialectRegistry::with_custom(&config.dialects);
    let dialect = registry.resolve(url, None, |_| true)?;

    let sanitized = sanitize::sanitize(sql)?;
    let parser = dialect.parser_dialect();
    let prefixes = alias::column_prefixes(&sanitized, parser.as_ref());
    let count = alias::count_query(&sanitized, parser.as_ref(), dialect.count_alias.as_deref());

    println!("{} {}", "Dialect:".dimmed(), dialect.name.cyan());
    println!("{}", "Sanitized SQL:".green().bold());
    println!("  {}", sanitized.white());
    println!("{}", "Count query:".green().bold());
    println!("  {}", count.white());
    if !prefixes.is_empty() {
        let joined: Vec<&str> = prefixes.iter().map(String::as_str).collect();
        println!("{} {}", "Alias prefixes:".dimmed(), joined.join(", ").yellow());
    }
    if let Some(clause) = dialect.page_clause(0, 10) {
        println!("{} {}", "First page clause:".dimmed(), clause.trim().yellow());
    } else {
        println!("{} {}", "Paging:".dimmed(), "scrollable cursor".yellow());
    }
    Ok(())
}

fn print_result(result: &PagedResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
        }
        OutputFormat::Table => {
            if result.rows.is_empty() {
                println!("{}", "(no results)".dimmed());
                return;
            }
            let names: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
            let mut widths: Vec<usize> = names.iter().map(|n| n.chars().count()).collect();
            for row in &result.rows {
                for (i, name) in names.iter().enumerate() {
                    let len = row.get(*name).map(val_to_string).unwrap_or_default().chars().count();
                    widths[i] = widths[i].max(len);
                }
            }

            let header: Vec<String> = names
                .iter()
                .zip(&widths)
                .map(|(n, w)| format!("{:width$}", n, width = *w))
                .collect();
            println!("{}", header.join(" │ ").white().bold());
            let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
            println!("{}", sep.join("─┼─").dimmed());

            for row in &result.rows {
                let cells: Vec<String> = names
                    .iter()
                    .zip(&widths)
                    .map(|(n, w)| {
                        let val = row.get(*n).map(val_to_string).unwrap_or_default();
                        format!("{:width$}", val, width = *w)
                    })
                    .collect();
                println!("{}", cells.join(" │ "));
            }

            println!();
            println!(
                "page {} of {} row(s), {} shown",
                result.page_no.to_string().cyan(),
                result.total_count.to_string().cyan(),
                result.rows.len().to_string().cyan()
            );
        }
    }
}

fn val_to_string(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => val.to_string(),
    }
}
