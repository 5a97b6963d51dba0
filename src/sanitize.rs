//! SQL sanitizer.
//!
//! Every SQL string passes through [`sanitize`] before it reaches a
//! connection: comments and line breaks are normalized away, then the text is
//! scanned for mutating statement verbs.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{SqlbookError, SqlbookResult};

/// Quoted literal (kept), line comment, or block comment that is not an
/// optimizer hint (`/*+ ... */`).
static COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)('(?:''|[^'])*')|--.*?$|/\*(?:\*/|[^+].*?\*/)").expect("comment pattern")
});

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r\n|\r|\n").expect("line break pattern"));

static SEMICOLONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(;+\s*)+").expect("semicolon pattern"));

/// A blocked verb as a whole word. Group 2 marks an opening parenthesis right
/// after it.
static SENSITIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(drop|alter|grant|insert|replace|delete|truncate|update|remove)\b(\s*\()?")
        .expect("sensitive pattern")
});

/// Verbs that are also scalar functions (`REPLACE(s, from, to)`,
/// `INSERT(s, pos, len, new)`).
const FUNCTION_VERBS: [&str; 2] = ["REPLACE", "INSERT"];

/// Strip comments, collapse line breaks to spaces and runs of semicolons to
/// one.
///
/// `normalize(normalize(s)) == normalize(s)` for every input.
pub fn normalize(sql: &str) -> String {
    // Removing one comment can expose another (`-/**/- x`), so strip to a
    // fixed point.
    let mut text = sql.to_string();
    loop {
        let stripped = COMMENT.replace_all(&text, "$1").into_owned();
        if stripped == text {
            break;
        }
        text = stripped;
    }
    let text = LINE_BREAK.replace_all(&text, " ");
    SEMICOLONS.replace_all(&text, ";").into_owned()
}

/// Fail with [`SqlbookError::SecurityViolation`] if the text contains a
/// blocked verb.
///
/// The verb only needs to end at a word boundary, so quoted identifiers and
/// hints glued to it (`UPDATE"t"`, `DELETE/*+ x */FROM`) are caught. A
/// function verb followed by `(` is a call and passes.
pub fn check_sensitive(sql: &str) -> SqlbookResult<()> {
    for caps in SENSITIVE.captures_iter(sql) {
        let Some(found) = caps.get(1) else { continue };
        let token = found.as_str().to_uppercase();
        if caps.get(2).is_some() && FUNCTION_VERBS.contains(&token.as_str()) {
            continue;
        }
        tracing::warn!("Sensitive SQL operations are not allowed: {}", token);
        return Err(SqlbookError::security(token));
    }
    Ok(())
}

/// Normalize then guard. Returns the normalized text.
pub fn sanitize(sql: &str) -> SqlbookResult<String> {
    let sql = normalize(sql);
    check_sensitive(&sql)?;
    Ok(sql)
}
