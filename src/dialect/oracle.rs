use sqlparser::dialect::{Dialect as ParserDialect, GenericDialect};

use super::{merge_sql, Dialect, LockMode, UpsertTarget};
use crate::error::Result;

/// Oracle 12c and later (row limiting clause).
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn matches_product(&self, product: &str) -> bool {
        product.to_ascii_lowercase().contains("oracle")
    }

    fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        Box::new(GenericDialect {})
    }

    fn placeholder(&self, index: usize) -> String {
        format!(":{}", index)
    }

    fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String {
        format!("{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", sql, offset, limit)
    }

    fn top(&self, sql: &str, n: u64) -> String {
        format!("{} FETCH FIRST {} ROWS ONLY", sql, n)
    }

    fn random(&self, sql: &str, n: u64) -> String {
        format!(
            "SELECT * FROM ({}) sag_random ORDER BY DBMS_RANDOM.VALUE FETCH FIRST {} ROWS ONLY",
            sql, n
        )
    }

    fn lock_clause(&self, mode: LockMode) -> Option<&'static str> {
        match mode {
            LockMode::None => None,
            LockMode::Upgrade => Some("FOR UPDATE"),
            LockMode::UpgradeNoWait => Some("FOR UPDATE NOWAIT"),
            LockMode::UpgradeSkipLocked => Some("FOR UPDATE SKIP LOCKED"),
        }
    }

    // FOR UPDATE with OFFSET/FETCH is ORA-02014
    fn locks_limited_rows(&self) -> bool {
        false
    }

    fn upsert(&self, target: &UpsertTarget) -> Result<String> {
        Ok(merge_sql(target, " FROM DUAL", "", true))
    }

    fn insert_ignore(&self, target: &UpsertTarget) -> Result<String> {
        Ok(merge_sql(target, " FROM DUAL", "", false))
    }

    fn sequence_next(&self, sequence: &str) -> Result<String> {
        Ok(format!("{}.NEXTVAL", sequence))
    }

    fn sequence_query(&self, sequence: &str) -> Result<String> {
        Ok(format!("SELECT {}.NEXTVAL FROM DUAL", sequence))
    }
}
