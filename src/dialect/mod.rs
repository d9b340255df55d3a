//! Per-engine SQL capabilities.
//!
//! Each supported database registers a [`Dialect`] implementation in the
//! [`DialectRegistry`]; execution code only ever talks to the trait.
//! Adding an engine means registering another implementation.

pub mod mysql;
pub mod oracle;
pub mod postgres;
pub mod sqlite;
pub mod sqlserver;

use std::sync::{Arc, OnceLock};

use regex::Regex;
use sqlparser::ast::{Query, Statement};
use sqlparser::dialect::Dialect as ParserDialect;
use sqlparser::parser::Parser;

use crate::config::template::{cached_regex, split_quoted};
use crate::error::{EngineError, Result};

pub use mysql::MySqlDialect;
pub use oracle::OracleDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;
pub use sqlserver::SqlServerDialect;

/// Row-lock intent for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Lock and wait.
    Upgrade,
    UpgradeNoWait,
    /// Lock, skipping rows locked by others.
    UpgradeSkipLocked,
}

/// Insert-or-update target. Values are SQL expressions aligned with
/// `columns` (usually `?`, or a sequence expression for the key).
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertTarget {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<String>,
    pub key_columns: Vec<String>,
    /// Non-key columns updated on conflict; `true` overwrites with nulls,
    /// `false` keeps the stored value when the new one is null.
    pub update_columns: Vec<(String, bool)>,
}

pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Does a driver-reported product name belong to this engine?
    fn matches_product(&self, product: &str) -> bool;

    /// Grammar used when the statement has to be inspected.
    fn parser_dialect(&self) -> Box<dyn ParserDialect>;

    /// Placeholder for the 1-based parameter position.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String;

    fn top(&self, sql: &str, n: u64) -> String {
        self.paginate(sql, 0, n)
    }

    /// `n` rows in the engine's own random order.
    fn random(&self, sql: &str, n: u64) -> String;

    /// Clause appended for a lock mode, `None` if the engine cannot lock rows.
    fn lock_clause(&self, mode: LockMode) -> Option<&'static str>;

    fn has_lock(&self, sql: &str) -> bool {
        match parse_query(sql, &*self.parser_dialect()) {
            Some(q) => !q.locks.is_empty(),
            None => for_update_pattern().is_some_and(|re| re.is_match(sql)),
        }
    }

    /// Add the lock clause unless the statement already declares a lock.
    fn apply_lock(&self, sql: &str, mode: LockMode) -> String {
        if mode == LockMode::None || self.has_lock(sql) {
            return sql.to_string();
        }
        match self.lock_clause(mode) {
            Some(clause) => format!("{} {}", sql, clause),
            None => {
                tracing::debug!(dialect = self.name(), "row locking not supported, statement left as is");
                sql.to_string()
            }
        }
    }

    /// Can a row-limited select also take a row lock?
    fn locks_limited_rows(&self) -> bool {
        true
    }

    /// Lock a paginated, top or random select.
    fn lock_limited(&self, limited: &str, mode: LockMode) -> Result<String> {
        if mode != LockMode::None && !self.locks_limited_rows() {
            return Err(EngineError::dialect_unsupported(
                self.name(),
                "row locks cannot be combined with row limiting; lock the full result instead",
            ));
        }
        Ok(self.apply_lock(limited, mode))
    }

    fn upsert(&self, target: &UpsertTarget) -> Result<String>;

    /// Insert rows whose key does not exist yet, skip the others.
    fn insert_ignore(&self, target: &UpsertTarget) -> Result<String>;

    /// Expression producing the next value of a sequence.
    fn sequence_next(&self, sequence: &str) -> Result<String>;

    /// Standalone query returning the next sequence value as one row.
    fn sequence_query(&self, sequence: &str) -> Result<String> {
        Ok(format!("SELECT {}", self.sequence_next(sequence)?))
    }

    fn count(&self, sql: &str) -> String {
        count_sql(sql, &*self.parser_dialect())
    }
}

/// Dialects by name, plus driver product-name detection.
#[derive(Clone)]
pub struct DialectRegistry {
    dialects: Vec<Arc<dyn Dialect>>,
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self {
            dialects: vec![
                Arc::new(PostgresDialect),
                Arc::new(MySqlDialect),
                Arc::new(OracleDialect),
                Arc::new(SqlServerDialect),
                Arc::new(SqliteDialect),
            ],
        }
    }
}

impl DialectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dialect. A later registration with the same name wins.
    pub fn register(&mut self, dialect: Arc<dyn Dialect>) {
        self.dialects.retain(|d| d.name() != dialect.name());
        self.dialects.insert(0, dialect);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Dialect>> {
        self.dialects
            .iter()
            .find(|d| d.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn detect(&self, product: &str) -> Result<Arc<dyn Dialect>> {
        self.dialects
            .iter()
            .find(|d| d.matches_product(product))
            .cloned()
            .ok_or_else(|| {
                EngineError::dialect_unsupported(product, "no dialect registered for this database")
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.dialects.iter().map(|d| d.name()).collect()
    }
}

/// Rewrite `?` placeholders outside quotes into the dialect's form.
pub fn render_placeholders(sql: &str, dialect: &dyn Dialect) -> String {
    map_placeholders(sql, |i| dialect.placeholder(i))
}

fn map_placeholders(sql: &str, mut render: impl FnMut(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    for (quoted, part) in split_quoted(sql) {
        if quoted {
            out.push_str(&part);
            continue;
        }
        for c in part.chars() {
            if c == '?' {
                index += 1;
                out.push_str(&render(index));
            } else {
                out.push(c);
            }
        }
    }
    out
}

fn count_placeholders(sql: &str) -> usize {
    split_quoted(sql)
        .iter()
        .filter(|(quoted, _)| !quoted)
        .map(|(_, part)| part.matches('?').count())
        .sum()
}

/// Parse a single query. `?` placeholders are swapped for `$n` first since
/// some grammars read a bare `?` as an operator.
fn parse_query(sql: &str, dialect: &dyn ParserDialect) -> Option<Box<Query>> {
    let numbered = number_placeholders(sql);
    let mut statements = Parser::parse_sql(dialect, &numbered).ok()?;
    if statements.len() != 1 {
        return None;
    }
    match statements.remove(0) {
        Statement::Query(q) => Some(q),
        _ => None,
    }
}

fn number_placeholders(sql: &str) -> String {
    map_placeholders(sql, |i| format!("${}", i))
}

fn dollar_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"\$\d+")
}

fn for_update_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r"(?i)\bfor\s+((no\s+key\s+)?update|share)\b|\block\s+in\s+share\s+mode\b",
    )
}

fn order_by_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"(?i)\border\s+by\b")
}

fn restore_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for (quoted, part) in split_quoted(sql) {
        if quoted {
            out.push_str(&part);
        } else {
            match dollar_pattern() {
                Some(re) => out.push_str(&re.replace_all(&part, "?")),
                None => out.push_str(&part),
            }
        }
    }
    out
}

/// Does the top-level query carry an ORDER BY?
pub fn has_order_by(sql: &str, dialect: &dyn ParserDialect) -> bool {
    match parse_query(sql, dialect) {
        Some(q) => q.order_by.is_some(),
        None => order_by_pattern().is_some_and(|re| re.is_match(sql)),
    }
}

/// Drop a top-level ORDER BY that does not change which rows are returned.
/// Unparseable statements are returned unchanged.
pub fn strip_order_by(sql: &str, dialect: &dyn ParserDialect) -> String {
    let Some(mut q) = parse_query(sql, dialect) else {
        return sql.to_string();
    };
    if q.order_by.is_none() || q.limit.is_some() || q.offset.is_some() || q.fetch.is_some() {
        return sql.to_string();
    }
    q.order_by = None;
    let stripped = restore_placeholders(&q.to_string());
    // parameters inside the ORDER BY would shift positions
    if count_placeholders(&stripped) != count_placeholders(sql) {
        return sql.to_string();
    }
    stripped
}

/// `SELECT COUNT(1)` over the statement with its ORDER BY removed.
pub fn count_sql(sql: &str, dialect: &dyn ParserDialect) -> String {
    format!(
        "SELECT COUNT(1) FROM ({}) sag_count",
        strip_order_by(sql, dialect)
    )
}

/// MERGE statement shared by Oracle and SQL Server. `dual` is the
/// pseudo-table needed for a single-row SELECT, `terminator` ends the
/// statement.
pub(crate) fn merge_sql(target: &UpsertTarget, dual: &str, terminator: &str, update: bool) -> String {
    let source_cols: Vec<String> = target
        .columns
        .iter()
        .zip(&target.values)
        .map(|(c, v)| format!("{} AS {}", v, c))
        .collect();
    let on: Vec<String> = target
        .key_columns
        .iter()
        .map(|k| format!("ta.{} = tv.{}", k, k))
        .collect();
    let mut sql = format!(
        "MERGE INTO {} ta USING (SELECT {}{}) tv ON ({})",
        target.table,
        source_cols.join(", "),
        dual,
        on.join(" AND ")
    );
    if update && !target.update_columns.is_empty() {
        let sets: Vec<String> = target
            .update_columns
            .iter()
            .map(|(c, force)| {
                if *force {
                    format!("ta.{} = tv.{}", c, c)
                } else {
                    format!("ta.{} = COALESCE(tv.{}, ta.{})", c, c, c)
                }
            })
            .collect();
        sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", sets.join(", ")));
    }
    let insert_values: Vec<String> = target.columns.iter().map(|c| format!("tv.{}", c)).collect();
    sql.push_str(&format!(
        " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({}){}",
        target.columns.join(", "),
        insert_values.join(", "),
        terminator
    ));
    sql
}

pub(crate) fn insert_sql(target: &UpsertTarget, verb: &str) -> String {
    format!(
        "{} {} ({}) VALUES ({})",
        verb,
        target.table,
        target.columns.join(", "),
        target.values.join(", ")
    )
}

#[cfg(test)]
pub(crate) fn sample_target() -> UpsertTarget {
    UpsertTarget {
        table: "sys_staff".into(),
        columns: vec!["staff_id".into(), "staff_name".into(), "status".into()],
        values: vec!["?".into(), "?".into(), "?".into()],
        key_columns: vec!["staff_id".into()],
        update_columns: vec![("staff_name".into(), false), ("status".into(), true)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;

    #[test]
    fn test_registry_lookup_and_detection() {
        let registry = DialectRegistry::new();
        assert_eq!(registry.get("MySQL").unwrap().name(), "mysql");
        assert_eq!(registry.detect("PostgreSQL 16.2").unwrap().name(), "postgresql");
        assert_eq!(registry.detect("Microsoft SQL Server").unwrap().name(), "sqlserver");
        assert_eq!(registry.detect("MariaDB").unwrap().name(), "mysql");
        let err = registry.detect("Informix").err().unwrap();
        assert!(matches!(
            err.kind,
            crate::error::ErrorKind::DialectUnsupported { .. }
        ));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = DialectRegistry::new();
        let before = registry.names().len();
        registry.register(Arc::new(PostgresDialect));
        assert_eq!(registry.names().len(), before);
    }

    #[test]
    fn test_render_placeholders_skips_literals() {
        let sql = "select '?' from t where a = ? and b = ?";
        assert_eq!(
            render_placeholders(sql, &PostgresDialect),
            "select '?' from t where a = $1 and b = $2"
        );
        assert_eq!(render_placeholders(sql, &MySqlDialect), sql);
    }

    #[test]
    fn test_count_strips_order_by() {
        let sql = count_sql("SELECT id, name FROM staff WHERE dept = ? ORDER BY name", &GenericDialect {});
        assert_eq!(
            sql,
            "SELECT COUNT(1) FROM (SELECT id, name FROM staff WHERE dept = ?) sag_count"
        );
    }

    #[test]
    fn test_count_keeps_order_by_with_limit() {
        let inner = "SELECT id FROM staff ORDER BY id LIMIT 10";
        assert_eq!(strip_order_by(inner, &GenericDialect {}), inner);
    }

    #[test]
    fn test_unparseable_count_falls_back() {
        let odd = "SELECT * FROM staff WHERE a = = 1 ORDER BY 1";
        assert_eq!(strip_order_by(odd, &GenericDialect {}), odd);
        assert!(has_order_by(odd, &GenericDialect {}));
    }

    #[test]
    fn test_lock_not_doubled() {
        let pg = PostgresDialect;
        let locked = pg.apply_lock("SELECT * FROM t WHERE id = ?", LockMode::Upgrade);
        assert_eq!(locked, "SELECT * FROM t WHERE id = ? FOR UPDATE");
        assert_eq!(pg.apply_lock(&locked, LockMode::Upgrade), locked);
        assert_eq!(
            pg.apply_lock("SELECT * FROM t", LockMode::None),
            "SELECT * FROM t"
        );
    }

    #[test]
    fn test_merge_sql() {
        let sql = merge_sql(&sample_target(), " FROM DUAL", "", true);
        assert!(sql.starts_with("MERGE INTO sys_staff ta USING (SELECT ? AS staff_id, ? AS staff_name, ? AS status FROM DUAL) tv ON (ta.staff_id = tv.staff_id)"));
        assert!(sql.contains("ta.staff_name = COALESCE(tv.staff_name, ta.staff_name)"));
        assert!(sql.contains("ta.status = tv.status"));
        assert!(sql.ends_with("INSERT (staff_id, staff_name, status) VALUES (tv.staff_id, tv.staff_name, tv.status)"));
    }
}
