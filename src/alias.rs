//! Column alias resolver.
//!
//! Result-set labels of join queries often carry the table alias
//! (`u.name`). This module walks the FROM and JOIN items of a query to learn
//! the alias prefixes, strips them from labels, and builds the COUNT wrapper
//! used for pagination totals.

use std::collections::BTreeSet;

use sqlparser::ast::{ObjectName, Query, Select, SetExpr, Statement, TableAlias, TableFactor};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;

/// Appended to every extracted alias or table name.
pub const PREFIX_SEPARATOR: &str = ".";

/// Alias prefixes (`"u."`, `"orders."`), in lexicographic order.
pub type PrefixSet = BTreeSet<String>;

/// The closed set of FROM-item shapes the resolver distinguishes.
#[derive(Debug)]
enum FromItem<'a> {
    Table(&'a ObjectName),
    Subquery,
    LateralSubquery,
    Join,
    ValuesList,
    TableFunction,
    Parenthesized,
}

impl<'a> FromItem<'a> {
    fn classify(factor: &'a TableFactor) -> Option<(FromItem<'a>, Option<&'a TableAlias>)> {
        let classified = match factor {
            TableFactor::Table { name, alias, .. } => (FromItem::Table(name), alias.as_ref()),
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
                ..
            } => {
                let item = if matches!(subquery.body.as_ref(), SetExpr::Values(_)) {
                    FromItem::ValuesList
                } else if *lateral {
                    FromItem::LateralSubquery
                } else {
                    FromItem::Subquery
                };
                (item, alias.as_ref())
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
                ..
            } => {
                let item = if table_with_joins.joins.is_empty() {
                    FromItem::Parenthesized
                } else {
                    FromItem::Join
                };
                (item, alias.as_ref())
            }
            TableFactor::TableFunction { alias, .. }
            | TableFactor::Function { alias, .. }
            | TableFactor::UNNEST { alias, .. } => (FromItem::TableFunction, alias.as_ref()),
            _ => return None,
        };
        Some(classified)
    }

    /// The prefix this item contributes, if any.
    fn prefix(&self, alias: Option<&TableAlias>) -> Option<String> {
        if let Some(alias) = alias {
            return Some(format!("{}{}", alias.name.value.trim(), PREFIX_SEPARATOR));
        }
        match self {
            FromItem::Table(name) => Some(format!("{}{}", base_table_name(name), PREFIX_SEPARATOR)),
            FromItem::Subquery
            | FromItem::LateralSubquery
            | FromItem::Join
            | FromItem::ValuesList
            | FromItem::TableFunction
            | FromItem::Parenthesized => None,
        }
    }
}

/// Last component of a possibly qualified name, without quotes.
fn base_table_name(name: &ObjectName) -> String {
    let rendered = name.to_string();
    let last = rendered.rsplit('.').next().unwrap_or(&rendered);
    last.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
        .to_string()
}

/// Parse the first statement of `sql` as a query.
pub fn parse_query(sql: &str, dialect: &dyn Dialect) -> Option<Box<Query>> {
    match Parser::parse_sql(dialect, sql) {
        Ok(statements) => match statements.into_iter().next() {
            Some(Statement::Query(query)) => Some(query),
            _ => None,
        },
        Err(e) => {
            tracing::warn!("Failed to parse SQL for alias analysis: {}", e);
            None
        }
    }
}

/// Collect the alias prefixes of every FROM and JOIN item.
///
/// Unparseable SQL yields an empty set, so labels pass through unchanged.
pub fn column_prefixes(sql: &str, dialect: &dyn Dialect) -> PrefixSet {
    let mut prefixes = PrefixSet::new();
    if let Some(query) = parse_query(sql, dialect) {
        collect_query(&query, &mut prefixes);
    }
    prefixes
}

fn collect_query(query: &Query, out: &mut PrefixSet) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, out);
        }
    }
    collect_set_expr(&query.body, out);
}

fn collect_set_expr(expr: &SetExpr, out: &mut PrefixSet) {
    match expr {
        SetExpr::Select(select) => collect_select(select, out),
        SetExpr::Query(query) => collect_query(query, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, out);
            collect_set_expr(right, out);
        }
        _ => {}
    }
}

fn collect_select(select: &Select, out: &mut PrefixSet) {
    let factors = select
        .from
        .iter()
        .flat_map(|twj| std::iter::once(&twj.relation).chain(twj.joins.iter().map(|j| &j.relation)));

    for factor in factors {
        if let Some((item, alias)) = FromItem::classify(factor) {
            if let Some(prefix) = item.prefix(alias) {
                out.insert(prefix);
            }
        }
    }
}

/// Build `SELECT COUNT(*) FROM (<sql without ORDER BY>)`.
///
/// `alias` is appended bare after the derived table for dialects that
/// require one. SQL that does not parse is wrapped as-is.
pub fn count_query(sql: &str, dialect: &dyn Dialect, alias: Option<&str>) -> String {
    let inner = match parse_query(sql, dialect) {
        Some(mut query) => {
            query.order_by = None;
            query.to_string()
        }
        None => sql.trim().trim_end_matches(';').to_string(),
    };
    match alias {
        Some(alias) => format!("SELECT COUNT(*) FROM ({inner}) {alias}"),
        None => format!("SELECT COUNT(*) FROM ({inner})"),
    }
}

/// Strip the first matching prefix from a label.
///
/// Each prefix is tried as-is, lower-cased, then upper-cased. When several
/// aliases could match, the first in set order wins.
pub fn strip_label<'a>(prefixes: &PrefixSet, label: &'a str) -> &'a str {
    for prefix in prefixes {
        if let Some(rest) = label.strip_prefix(prefix.as_str()) {
            return rest;
        }
        if let Some(rest) = label.strip_prefix(prefix.to_lowercase().as_str()) {
            return rest;
        }
        if let Some(rest) = label.strip_prefix(prefix.to_uppercase().as_str()) {
            return rest;
        }
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlparser::dialect::{GenericDialect, MySqlDialect};

    fn prefixes(sql: &str) -> Vec<String> {
        column_prefixes(sql, &GenericDialect {}).into_iter().collect()
    }

    fn set(items: &[&str]) -> PrefixSet {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_count_query_drops_order_by() {
        let sql = count_query("SELECT a,b FROM t ORDER BY a", &GenericDialect {}, None);
        assert_eq!(sql, "SELECT COUNT(*) FROM (SELECT a, b FROM t)");
    }

    #[test]
    fn test_count_query_with_alias() {
        let sql = count_query("SELECT * FROM t ORDER BY id DESC", &MySqlDialect {}, Some("CT"));
        assert_eq!(sql, "SELECT COUNT(*) FROM (SELECT * FROM t) CT");
    }

    #[test]
    fn test_count_query_unparseable_falls_back() {
        let sql = count_query("SELEC nonsense FROM;", &GenericDialect {}, None);
        assert_eq!(sql, "SELECT COUNT(*) FROM (SELEC nonsense FROM)");
    }

    #[test]
    fn test_table_names_without_alias() {
        assert_eq!(prefixes("SELECT * FROM users"), vec!["users."]);
        assert_eq!(prefixes("SELECT * FROM shop.orders"), vec!["orders."]);
    }

    #[test]
    fn test_aliases_and_joins() {
        let found = prefixes(
            "SELECT u.id, o.total FROM users u \
             JOIN orders AS o ON o.user_id = u.id \
             LEFT JOIN items ON items.order_id = o.id",
        );
        assert_eq!(found, vec!["items.", "o.", "u."]);
    }

    #[test]
    fn test_unaliased_subquery_contributes_nothing() {
        assert_eq!(prefixes("SELECT * FROM (SELECT 1 AS x) AS s"), vec!["s."]);
        assert!(prefixes("SELECT * FROM (SELECT 1 AS x)").is_empty());
    }

    #[test]
    fn test_union_walks_every_branch() {
        let found = prefixes("SELECT a.id FROM alpha a UNION ALL SELECT b.id FROM beta b");
        assert_eq!(found, vec!["a.", "b."]);
    }

    #[test]
    fn test_cte_walks_inner_select() {
        let found = prefixes(
            "WITH recent AS (SELECT * FROM orders o WHERE o.day > 1) \
             SELECT r.id FROM recent r",
        );
        assert_eq!(found, vec!["o.", "r."]);
    }

    #[test]
    fn test_unparseable_yields_empty_set() {
        assert!(prefixes("this is not sql").is_empty());
    }

    #[test]
    fn test_strip_label() {
        let prefixes = set(&["t."]);
        assert_eq!(strip_label(&prefixes, "t.name"), "name");
        assert_eq!(strip_label(&prefixes, "name"), "name");
        assert_eq!(strip_label(&prefixes, "T.name"), "name");
        assert_eq!(strip_label(&PrefixSet::new(), "t.name"), "t.name");
    }

    #[test]
    fn test_strip_label_case_variants() {
        let prefixes = set(&["Users."]);
        assert_eq!(strip_label(&prefixes, "users.id"), "id");
        assert_eq!(strip_label(&prefixes, "USERS.id"), "id");
        assert_eq!(strip_label(&prefixes, "Users.id"), "id");
        assert_eq!(strip_label(&prefixes, "orders.id"), "orders.id");
    }
}
