use sqlparser::dialect::{Dialect as ParserDialect, MySqlDialect as MySqlGrammar};

use super::{insert_sql, Dialect, LockMode, UpsertTarget};
use crate::error::{EngineError, Result};

/// MySQL and MariaDB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn matches_product(&self, product: &str) -> bool {
        let p = product.to_ascii_lowercase();
        p.contains("mysql") || p.contains("mariadb")
    }

    fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        Box::new(MySqlGrammar {})
    }

    fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String {
        format!("{} LIMIT {}, {}", sql, offset, limit)
    }

    fn random(&self, sql: &str, n: u64) -> String {
        format!("SELECT * FROM ({}) sag_random ORDER BY RAND() LIMIT {}", sql, n)
    }

    fn lock_clause(&self, mode: LockMode) -> Option<&'static str> {
        match mode {
            LockMode::None => None,
            LockMode::Upgrade => Some("FOR UPDATE"),
            LockMode::UpgradeNoWait => Some("FOR UPDATE NOWAIT"),
            LockMode::UpgradeSkipLocked => Some("FOR UPDATE SKIP LOCKED"),
        }
    }

    fn upsert(&self, target: &UpsertTarget) -> Result<String> {
        if target.update_columns.is_empty() {
            return self.insert_ignore(target);
        }
        let sets: Vec<String> = target
            .update_columns
            .iter()
            .map(|(c, force)| {
                if *force {
                    format!("{} = VALUES({})", c, c)
                } else {
                    format!("{} = COALESCE(VALUES({}), {})", c, c, c)
                }
            })
            .collect();
        Ok(format!(
            "{} ON DUPLICATE KEY UPDATE {}",
            insert_sql(target, "INSERT INTO"),
            sets.join(", ")
        ))
    }

    fn insert_ignore(&self, target: &UpsertTarget) -> Result<String> {
        Ok(insert_sql(target, "INSERT IGNORE INTO"))
    }

    fn sequence_next(&self, _sequence: &str) -> Result<String> {
        Err(EngineError::dialect_unsupported(
            self.name(),
            "sequences are not available; use identity keys",
        ))
    }
}
