//! Dialect registry.
//!
//! Maps a connection URL (and optional product version) to the conventions
//! of the target database: how to paginate, how to quote identifiers and
//! aliases, and which schema to scan when listing tables.
//!
//! Custom registrations are consulted first, then the built-in table.

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    ClickHouseDialect, GenericDialect, HiveDialect, MsSqlDialect, MySqlDialect,
    PostgreSqlDialect, SQLiteDialect,
};

use crate::error::{SqlbookError, SqlbookResult};

/// Alias given to the derived table of a count query where one is required.
const COUNT_ALIAS: &str = "CT";

/// Built-in database products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectKind {
    MySql,
    PostgreSql,
    Sqlite,
    Oracle,
    SqlServer,
    H2,
    ClickHouse,
    Presto,
    Hive,
    Impala,
    /// Accepted by the driver but unknown to the registry.
    Generic,
    /// Supplied through configuration.
    Custom,
}

/// Native `LIMIT` syntax variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSyntax {
    /// `LIMIT start, size`
    StartComma,
    /// `LIMIT size OFFSET start`
    LimitOffset,
}

/// How a page of rows is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// Append a LIMIT/OFFSET clause to the query.
    Native(LimitSyntax),
    /// Cap the driver row count and position the cursor.
    ScrollableCursor,
}

/// Schema used when listing tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaPattern {
    /// Every schema.
    Any,
    /// A fixed schema, e.g. `dbo`.
    Fixed(String),
    /// The connecting user name, upper-cased.
    UppercaseUsername,
    /// The connection's current schema, if it reports one.
    CurrentSchema,
}

/// Conventions of one database product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    pub kind: DialectKind,
    pub name: String,
    pub pagination: Pagination,
    pub keyword_prefix: String,
    pub keyword_suffix: String,
    pub alias_prefix: String,
    pub alias_suffix: String,
    pub schema_pattern: SchemaPattern,
    /// Export-all queries must stream rows instead of buffering them.
    pub streaming_export: bool,
    /// Bare alias appended to the derived table of a count query.
    pub count_alias: Option<String>,
}

impl DialectKind {
    /// Match a URL keyword (`mysql`, `postgresql`, ...) to a product.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let kind = match keyword {
            "mysql" | "mariadb" => Self::MySql,
            "postgres" | "postgresql" => Self::PostgreSql,
            "sqlite" => Self::Sqlite,
            "oracle" => Self::Oracle,
            "sqlserver" | "mssql" => Self::SqlServer,
            "h2" => Self::H2,
            "clickhouse" => Self::ClickHouse,
            "presto" => Self::Presto,
            "hive2" => Self::Hive,
            "impala" => Self::Impala,
            _ => return None,
        };
        Some(kind)
    }

    /// The built-in descriptor for this product.
    pub fn descriptor(self) -> Dialect {
        use LimitSyntax::*;
        use Pagination::*;

        let (name, pagination, keyword, alias) = match self {
            Self::MySql => ("mysql", Native(StartComma), ("`", "`"), ("'", "'")),
            Self::PostgreSql => ("postgresql", Native(LimitOffset), ("\"", "\""), ("\"", "\"")),
            Self::Sqlite => ("sqlite", Native(LimitOffset), ("\"", "\""), ("\"", "\"")),
            Self::Oracle => ("oracle", ScrollableCursor, ("\"", "\""), ("\"", "\"")),
            Self::SqlServer => ("sqlserver", ScrollableCursor, ("\"", "\""), ("\"", "\"")),
            Self::H2 => ("h2", Native(LimitOffset), ("`", "`"), ("\"", "\"")),
            Self::ClickHouse => ("clickhouse", Native(LimitOffset), ("`", "`"), ("\"", "\"")),
            Self::Presto => ("presto", ScrollableCursor, ("\"", "\""), ("\"", "\"")),
            Self::Hive => ("hive2", ScrollableCursor, ("`", "`"), ("`", "`")),
            Self::Impala => ("impala", ScrollableCursor, ("`", "`"), ("`", "`")),
            Self::Generic | Self::Custom => ("generic", ScrollableCursor, ("", ""), ("", "")),
        };

        let schema_pattern = match self {
            Self::Oracle => SchemaPattern::UppercaseUsername,
            Self::SqlServer => SchemaPattern::Fixed("dbo".to_string()),
            Self::Presto => SchemaPattern::CurrentSchema,
            _ => SchemaPattern::Any,
        };

        let count_alias = match self {
            Self::MySql | Self::PostgreSql | Self::SqlServer | Self::H2 | Self::Generic => {
                Some(COUNT_ALIAS.to_string())
            }
            _ => None,
        };

        Dialect {
            kind: self,
            name: name.to_string(),
            pagination,
            keyword_prefix: keyword.0.to_string(),
            keyword_suffix: keyword.1.to_string(),
            alias_prefix: alias.0.to_string(),
            alias_suffix: alias.1.to_string(),
            schema_pattern,
            streaming_export: self == Self::MySql,
            count_alias,
        }
    }
}

impl Dialect {
    pub fn is_native_paging(&self) -> bool {
        matches!(self.pagination, Pagination::Native(_))
    }

    /// Wrap an identifier in this dialect's keyword quotes.
    pub fn quote_keyword(&self, ident: &str) -> String {
        format!("{}{}{}", self.keyword_prefix, ident, self.keyword_suffix)
    }

    /// Wrap a column alias in this dialect's alias quotes.
    pub fn quote_alias(&self, alias: &str) -> String {
        format!("{}{}{}", self.alias_prefix, alias, self.alias_suffix)
    }

    /// Schema to scan when listing tables, if any.
    pub fn schema_pattern(
        &self,
        username: Option<&str>,
        current_schema: Option<&str>,
    ) -> Option<String> {
        match &self.schema_pattern {
            SchemaPattern::Any => None,
            SchemaPattern::Fixed(schema) => Some(schema.clone()),
            SchemaPattern::UppercaseUsername => username.map(str::to_uppercase),
            SchemaPattern::CurrentSchema => current_schema
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    /// LIMIT/OFFSET clause for native-paging dialects, `None` otherwise.
    pub fn page_clause(&self, start_row: usize, page_size: usize) -> Option<String> {
        match self.pagination {
            Pagination::Native(LimitSyntax::StartComma) => {
                Some(format!(" LIMIT {start_row}, {page_size}"))
            }
            Pagination::Native(LimitSyntax::LimitOffset) => {
                Some(format!(" LIMIT {page_size} OFFSET {start_row}"))
            }
            Pagination::ScrollableCursor => None,
        }
    }

    /// The sqlparser flavour used for AST work on this dialect's SQL.
    pub fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect + Send + Sync> {
        match self.kind {
            DialectKind::MySql => Box::new(MySqlDialect {}),
            DialectKind::PostgreSql => Box::new(PostgreSqlDialect {}),
            DialectKind::Sqlite => Box::new(SQLiteDialect {}),
            DialectKind::SqlServer => Box::new(MsSqlDialect {}),
            DialectKind::ClickHouse => Box::new(ClickHouseDialect {}),
            DialectKind::Hive | DialectKind::Impala => Box::new(HiveDialect {}),
            _ => Box::new(GenericDialect {}),
        }
    }
}

/// Pagination choices available to custom registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomPagination {
    /// `LIMIT size OFFSET start`
    LimitOffset,
    /// `LIMIT start, size`
    LimitComma,
    #[default]
    Cursor,
}

/// A dialect registered through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CustomDialect {
    pub name: String,
    /// Keyword matched against the URL scheme, e.g. `kylin` for `jdbc:kylin://`.
    pub url_keyword: String,
    /// Product version; `None` matches every version.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub pagination: CustomPagination,
    #[serde(default)]
    pub keyword_prefix: String,
    #[serde(default)]
    pub keyword_suffix: String,
    #[serde(default)]
    pub alias_prefix: String,
    #[serde(default)]
    pub alias_suffix: String,
    /// Fixed schema used when listing tables.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub streaming_export: bool,
    #[serde(default)]
    pub count_alias: Option<String>,
}

impl CustomDialect {
    fn to_dialect(&self) -> Dialect {
        let pagination = match self.pagination {
            CustomPagination::LimitOffset => Pagination::Native(LimitSyntax::LimitOffset),
            CustomPagination::LimitComma => Pagination::Native(LimitSyntax::StartComma),
            CustomPagination::Cursor => Pagination::ScrollableCursor,
        };
        Dialect {
            kind: DialectKind::Custom,
            name: self.name.clone(),
            pagination,
            keyword_prefix: self.keyword_prefix.clone(),
            keyword_suffix: self.keyword_suffix.clone(),
            alias_prefix: self.alias_prefix.clone(),
            alias_suffix: self.alias_suffix.clone(),
            schema_pattern: self
                .schema
                .clone()
                .map(SchemaPattern::Fixed)
                .unwrap_or(SchemaPattern::Any),
            streaming_export: self.streaming_export,
            count_alias: self.count_alias.clone(),
        }
    }
}

/// Extract the product keyword from a JDBC-style or scheme-style URL.
///
/// `jdbc:mysql://host/db` and `mysql://host/db` both yield `mysql`.
pub fn url_keyword(url: &str) -> Option<String> {
    let url = url.trim().to_lowercase();
    let rest = url.strip_prefix("jdbc:").unwrap_or(&url);
    let keyword = rest.split(':').next()?;
    (!keyword.is_empty()).then(|| keyword.to_string())
}

/// Resolves URLs to dialects.
#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    custom: Vec<CustomDialect>,
}

impl DialectRegistry {
    /// A registry with only the built-in dialects.
    pub fn builtin() -> Self {
        Self::default()
    }

    /// A registry seeded with custom registrations.
    pub fn with_custom(custom: &[CustomDialect]) -> Self {
        Self {
            custom: custom.to_vec(),
        }
    }

    pub fn register(&mut self, dialect: CustomDialect) {
        self.custom.push(dialect);
    }

    /// Look a URL up without consulting any driver.
    ///
    /// A custom registration with an exact version wins over one without a
    /// version, which wins over the built-in table.
    pub fn lookup(&self, url: &str, version: Option<&str>) -> Option<Dialect> {
        let keyword = url_keyword(url)?;
        let candidates: Vec<&CustomDialect> = self
            .custom
            .iter()
            .filter(|c| c.url_keyword.eq_ignore_ascii_case(&keyword))
            .collect();

        let exact = version.and_then(|v| {
            candidates
                .iter()
                .find(|c| c.version.as_deref() == Some(v))
        });
        let chosen = exact.or_else(|| candidates.iter().find(|c| c.version.is_none()));
        if let Some(custom) = chosen {
            return Some(custom.to_dialect());
        }

        DialectKind::from_keyword(&keyword).map(DialectKind::descriptor)
    }

    /// Resolve a dialect, falling back to a generic one when the driver
    /// accepts the URL.
    pub fn resolve(
        &self,
        url: &str,
        version: Option<&str>,
        driver_accepts: impl Fn(&str) -> bool,
    ) -> SqlbookResult<Dialect> {
        if let Some(dialect) = self.lookup(url, version) {
            return Ok(dialect);
        }
        if driver_accepts(url) {
            return Ok(DialectKind::Generic.descriptor());
        }
        Err(SqlbookError::Configuration(format!(
            "Not supported data source: {url}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kylin(version: Option<&str>, pagination: CustomPagination) -> CustomDialect {
        CustomDialect {
            name: format!("kylin-{}", version.unwrap_or("any")),
            url_keyword: "kylin".to_string(),
            version: version.map(str::to_string),
            pagination,
            keyword_prefix: "\"".to_string(),
            keyword_suffix: "\"".to_string(),
            alias_prefix: String::new(),
            alias_suffix: String::new(),
            schema: None,
            streaming_export: false,
            count_alias: None,
        }
    }

    #[test]
    fn test_url_keyword() {
        assert_eq!(url_keyword("jdbc:mysql://h:3306/db").as_deref(), Some("mysql"));
        assert_eq!(url_keyword("postgres://u@h/db").as_deref(), Some("postgres"));
        assert_eq!(url_keyword("sqlite::memory:").as_deref(), Some("sqlite"));
        assert_eq!(url_keyword(" JDBC:Oracle:thin:@h:1521").as_deref(), Some("oracle"));
        assert_eq!(url_keyword(""), None);
    }

    #[test]
    fn test_builtin_lookup() {
        let registry = DialectRegistry::builtin();
        let mysql = registry.lookup("jdbc:mysql://h/db", None).unwrap();
        assert_eq!(mysql.kind, DialectKind::MySql);
        assert!(mysql.streaming_export);
        assert_eq!(mysql.quote_keyword("order"), "`order`");

        let oracle = registry.lookup("jdbc:oracle:thin:@h", None).unwrap();
        assert!(!oracle.is_native_paging());
        assert_eq!(oracle.schema_pattern(Some("scott"), None).as_deref(), Some("SCOTT"));

        let mssql = registry.lookup("jdbc:sqlserver://h", None).unwrap();
        assert_eq!(mssql.schema_pattern(Some("sa"), None).as_deref(), Some("dbo"));

        let presto = registry.lookup("jdbc:presto://h", None).unwrap();
        assert_eq!(presto.schema_pattern(None, Some("")), None);
        assert_eq!(presto.schema_pattern(None, Some("hive")).as_deref(), Some("hive"));
    }

    #[test]
    fn test_page_clause() {
        let mysql = DialectKind::MySql.descriptor();
        assert_eq!(mysql.page_clause(10, 5).as_deref(), Some(" LIMIT 10, 5"));

        let pg = DialectKind::PostgreSql.descriptor();
        assert_eq!(pg.page_clause(10, 5).as_deref(), Some(" LIMIT 5 OFFSET 10"));

        assert_eq!(DialectKind::Oracle.descriptor().page_clause(10, 5), None);
    }

    #[test]
    fn test_custom_registration_wins() {
        let mut registry = DialectRegistry::builtin();
        registry.register(kylin(None, CustomPagination::Cursor));
        registry.register(kylin(Some("2.6"), CustomPagination::LimitOffset));

        let any = registry.lookup("jdbc:kylin://h/p", Some("3.0")).unwrap();
        assert_eq!(any.name, "kylin-any");
        assert_eq!(any.pagination, Pagination::ScrollableCursor);

        let exact = registry.lookup("jdbc:kylin://h/p", Some("2.6")).unwrap();
        assert_eq!(exact.name, "kylin-2.6");
        assert!(exact.is_native_paging());
    }

    #[test]
    fn test_custom_overrides_builtin_keyword() {
        let mut custom = kylin(None, CustomPagination::LimitComma);
        custom.url_keyword = "mysql".to_string();
        let registry = DialectRegistry::with_custom(&[custom]);
        let dialect = registry.lookup("mysql://h/db", None).unwrap();
        assert_eq!(dialect.kind, DialectKind::Custom);
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = DialectRegistry::builtin();
        let err = registry.resolve("jdbc:foo://h", None, |_| false).unwrap_err();
        assert!(matches!(err, SqlbookError::Configuration(_)));

        let generic = registry.resolve("jdbc:foo://h", None, |_| true).unwrap();
        assert_eq!(generic.kind, DialectKind::Generic);
    }
}
