use sqlparser::dialect::{Dialect as ParserDialect, SQLiteDialect};

use super::{insert_sql, Dialect, LockMode, UpsertTarget};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn matches_product(&self, product: &str) -> bool {
        product.to_ascii_lowercase().contains("sqlite")
    }

    fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        Box::new(SQLiteDialect {})
    }

    fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String {
        format!("{} LIMIT {} OFFSET {}", sql, limit, offset)
    }

    fn random(&self, sql: &str, n: u64) -> String {
        format!("SELECT * FROM ({}) sag_random ORDER BY RANDOM() LIMIT {}", sql, n)
    }

    /// SQLite locks the whole database per transaction; there is no row lock.
    fn lock_clause(&self, _mode: LockMode) -> Option<&'static str> {
        None
    }

    fn upsert(&self, target: &UpsertTarget) -> Result<String> {
        let insert = insert_sql(target, "INSERT INTO");
        if target.update_columns.is_empty() {
            return Ok(format!(
                "{} ON CONFLICT ({}) DO NOTHING",
                insert,
                target.key_columns.join(", ")
            ));
        }
        let sets: Vec<String> = target
            .update_columns
            .iter()
            .map(|(c, force)| {
                if *force {
                    format!("{} = excluded.{}", c, c)
                } else {
                    format!("{} = COALESCE(excluded.{}, {})", c, c, c)
                }
            })
            .collect();
        Ok(format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {}",
            insert,
            target.key_columns.join(", "),
            sets.join(", ")
        ))
    }

    fn insert_ignore(&self, target: &UpsertTarget) -> Result<String> {
        Ok(insert_sql(target, "INSERT OR IGNORE INTO"))
    }

    fn sequence_next(&self, _sequence: &str) -> Result<String> {
        Err(EngineError::dialect_unsupported(
            self.name(),
            "sequences are not available; use identity keys",
        ))
    }
}
