use std::sync::OnceLock;

use regex::Regex;
use sqlparser::dialect::{Dialect as ParserDialect, MsSqlDialect};

use super::{has_order_by, merge_sql, strip_order_by, Dialect, LockMode, UpsertTarget};
use crate::config::template::cached_regex;
use crate::error::Result;

/// SQL Server 2012 and later (OFFSET/FETCH paging, table lock hints).
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

const NOT_ALIAS: &[&str] = &[
    "where", "order", "group", "having", "join", "inner", "left", "right", "full", "cross",
    "outer", "union", "with", "on", "option",
];

fn hint_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r"(?i)\bwith\s*\([^)]*\b(updlock|xlock|holdlock|rowlock|tablockx|readpast)\b",
    )
}

fn from_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r#"(?i)\bfrom\s+([\w.\[\]"]+)(\s+(?:as\s+)?([\w\[\]"]+))?"#,
    )
}

impl Dialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn matches_product(&self, product: &str) -> bool {
        let p = product.to_ascii_lowercase();
        p.contains("sql server") || p.contains("sqlserver")
    }

    fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        Box::new(MsSqlDialect {})
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String {
        // OFFSET/FETCH is only legal after an ORDER BY
        let ordered = if has_order_by(sql, &*self.parser_dialect()) {
            sql.to_string()
        } else {
            format!("{} ORDER BY (SELECT NULL)", sql)
        };
        format!("{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", ordered, offset, limit)
    }

    fn random(&self, sql: &str, n: u64) -> String {
        // derived tables may not carry their own ORDER BY
        format!(
            "SELECT TOP {} * FROM ({}) sag_random ORDER BY NEWID()",
            n,
            strip_order_by(sql, &*self.parser_dialect())
        )
    }

    fn lock_clause(&self, mode: LockMode) -> Option<&'static str> {
        match mode {
            LockMode::None => None,
            LockMode::Upgrade => Some("WITH (UPDLOCK, ROWLOCK)"),
            LockMode::UpgradeNoWait => Some("WITH (UPDLOCK, ROWLOCK, NOWAIT)"),
            LockMode::UpgradeSkipLocked => Some("WITH (UPDLOCK, ROWLOCK, READPAST)"),
        }
    }

    fn has_lock(&self, sql: &str) -> bool {
        hint_pattern().is_some_and(|re| re.is_match(sql))
    }

    /// Lock hints follow the first table (and its alias) of the FROM clause.
    fn apply_lock(&self, sql: &str, mode: LockMode) -> String {
        let Some(clause) = self.lock_clause(mode) else {
            return sql.to_string();
        };
        if self.has_lock(sql) {
            return sql.to_string();
        }
        let Some(caps) = from_pattern().and_then(|re| re.captures(sql)) else {
            return sql.to_string();
        };
        let table_end = caps.get(1).map(|m| m.end()).unwrap_or(0);
        let insert_at = match (caps.get(2), caps.get(3)) {
            (Some(whole), Some(alias))
                if !NOT_ALIAS.contains(&alias.as_str().to_ascii_lowercase().as_str()) =>
            {
                whole.end()
            }
            _ => table_end,
        };
        format!("{} {}{}", &sql[..insert_at], clause, &sql[insert_at..])
    }

    fn upsert(&self, target: &UpsertTarget) -> Result<String> {
        Ok(merge_sql(target, "", ";", true))
    }

    fn insert_ignore(&self, target: &UpsertTarget) -> Result<String> {
        Ok(merge_sql(target, "", ";", false))
    }

    fn sequence_next(&self, sequence: &str) -> Result<String> {
        Ok(format!("NEXT VALUE FOR {}", sequence))
    }
}
