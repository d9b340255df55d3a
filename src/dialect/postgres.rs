use sqlparser::dialect::{Dialect as ParserDialect, PostgreSqlDialect};

use super::{insert_sql, Dialect, LockMode, UpsertTarget};
use crate::error::Result;

/// PostgreSQL (and wire-compatible engines reporting a PostgreSQL product).
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn matches_product(&self, product: &str) -> bool {
        product.to_ascii_lowercase().contains("postgres")
    }

    fn parser_dialect(&self) -> Box<dyn ParserDialect> {
        Box::new(PostgreSqlDialect {})
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String {
        format!("{} LIMIT {} OFFSET {}", sql, limit, offset)
    }

    fn random(&self, sql: &str, n: u64) -> String {
        format!("SELECT * FROM ({}) sag_random ORDER BY RANDOM() LIMIT {}", sql, n)
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
        let insert = format!(
            "INSERT INTO {} AS ta ({}) VALUES ({})",
            target.table,
            target.columns.join(", "),
            target.values.join(", ")
        );
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
                    format!("{} = EXCLUDED.{}", c, c)
                } else {
                    format!("{} = COALESCE(EXCLUDED.{}, ta.{})", c, c, c)
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
        Ok(format!("{} ON CONFLICT DO NOTHING", insert_sql(target, "INSERT INTO")))
    }

    fn sequence_next(&self, sequence: &str) -> Result<String> {
        Ok(format!("NEXTVAL('{}')", sequence))
    }
}
