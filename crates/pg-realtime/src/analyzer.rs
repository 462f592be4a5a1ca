//! Query analysis
//!
//! Derives the set of tables and columns a query reads by running the
//! server-side parse routine: the query is compiled into a temporary view
//! and the catalog's view-dependency usage is read back. Positional
//! parameter markers are stripped to literal NULL first so the view
//! compiles without bound parameters (parameter types are irrelevant for
//! dependency analysis).

use crate::driver::SqlDriver;
use crate::error::{LiveQueryError, Result};
use crate::sql;
use crate::table::QualifiedTable;
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// The tables and columns a subscription's query reads. Derived once at
/// subscribe time and immutable for the life of the subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSpec {
    tables: HashSet<QualifiedTable>,
    columns: HashMap<QualifiedTable, HashSet<String>>,
}

impl WatchSpec {
    /// Tables the query reads.
    pub fn tables(&self) -> &HashSet<QualifiedTable> {
        &self.tables
    }

    /// Columns the query reads from one table.
    pub fn columns_for(&self, table: &QualifiedTable) -> Option<&HashSet<String>> {
        self.columns.get(table)
    }

    /// Whether the query reads the given table at all.
    pub fn watches_table(&self, table: &QualifiedTable) -> bool {
        self.tables.contains(table)
    }

    /// Whether the query reads no tables (e.g. `SELECT 1`).
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Replace every positional parameter marker (`$1`, `$2`, …) with the
/// literal `NULL`. Markers inside string literals, quoted identifiers,
/// dollar-quoted strings and comments are left untouched.
pub fn strip_parameters(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < bytes.len() {
        let c = sql[i..].chars().next().expect("scan on char boundary");
        match c {
            '\'' => {
                let end = skip_quoted(bytes, i, b'\'');
                out.push_str(&sql[i..end]);
                i = end;
            }
            '"' => {
                let end = skip_quoted(bytes, i, b'"');
                out.push_str(&sql[i..end]);
                i = end;
            }
            '-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..]
                    .find('\n')
                    .map(|p| i + p + 1)
                    .unwrap_or(bytes.len());
                out.push_str(&sql[i..end]);
                i = end;
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(bytes.len());
                out.push_str(&sql[i..end]);
                i = end;
            }
            '$' => {
                // $1-style marker, or the opening tag of a dollar-quoted string
                let digits = sql[i + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .count();
                if digits > 0 {
                    out.push_str("NULL");
                    i += 1 + digits;
                } else if let Some(end) = skip_dollar_quoted(sql, i) {
                    out.push_str(&sql[i..end]);
                    i = end;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += c.len_utf8();
            }
        }
    }

    out
}

/// Skip past a quoted region starting at `start`, honoring doubled-quote
/// escapes. Returns the index just past the closing quote.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Skip past a dollar-quoted string (`$tag$ ... $tag$`) starting at
/// `start`, or return None if `start` does not open one.
fn skip_dollar_quoted(sql: &str, start: usize) -> Option<usize> {
    let rest = &sql[start + 1..];
    let tag_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
    if !rest[tag_len..].starts_with('$') {
        return None;
    }
    let tag = &sql[start..start + 1 + tag_len + 1];
    let body_start = start + tag.len();
    sql[body_start..]
        .find(tag)
        .map(|p| body_start + p + tag.len())
}

/// Analyze a query through the server-side parse routine, returning its
/// [`WatchSpec`].
pub async fn analyze(driver: &dyn SqlDriver, query: &str) -> Result<WatchSpec> {
    let stripped = strip_parameters(query);
    let rows = driver
        .query(
            &format!(
                "SELECT object_type, tname, cname FROM {}($1)",
                sql::PARSE_QUERY_FUNCTION
            ),
            &[Value::String(stripped)],
        )
        .await
        .map_err(|e| LiveQueryError::analysis(e.to_string()))?;

    let mut spec = WatchSpec::default();
    for row in &rows {
        let object_type = row.get_by_name("object_type").and_then(Value::as_str);
        let tname = row.get_by_name("tname").and_then(Value::as_str);
        let cname = row.get_by_name("cname").and_then(Value::as_str);
        match (object_type, tname) {
            (Some("table"), Some(name)) => {
                spec.tables.insert(QualifiedTable::parse(name));
            }
            (Some("column"), Some(name)) => {
                if let Some(column) = cname {
                    spec.columns
                        .entry(QualifiedTable::parse(name))
                        .or_default()
                        .insert(column.to_string());
                }
            }
            _ => {
                return Err(LiveQueryError::analysis(format!(
                    "unexpected parse row: {row:?}"
                )))
            }
        }
    }

    debug!(tables = spec.tables.len(), "analyzed query dependencies");
    Ok(spec)
}
