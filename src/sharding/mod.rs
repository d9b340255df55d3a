//! Routing of a logical operation to a physical data source and tables.

pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::template::split_quoted;
use crate::error::{EngineError, Result};
use crate::value::CellValue;

pub use strategy::{HashModStrategy, MonthlyTableStrategy, ShardingStrategy, StrategyResult};

/// A strategy reference and the attributes (or parameters) it consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRef {
    pub strategy: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSharding {
    /// Logical table name as written in the statement.
    pub table: String,
    pub strategy: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(default)]
    pub data_source: Option<StrategyRef>,
    #[serde(default)]
    pub tables: Vec<TableSharding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRoute {
    pub logical: String,
    pub physical: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTarget {
    /// `None` means the caller's default data source.
    pub data_source: Option<String>,
    pub tables: Vec<TableRoute>,
}

impl RouteTarget {
    /// One table mapping per physical execution: the cartesian product of
    /// every table's physical names.
    pub fn table_sets(&self) -> Vec<Vec<(String, String)>> {
        let mut sets: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for route in &self.tables {
            let mut next = Vec::with_capacity(sets.len() * route.physical.len().max(1));
            for set in &sets {
                for physical in &route.physical {
                    let mut s = set.clone();
                    s.push((route.logical.clone(), physical.clone()));
                    next.push(s);
                }
            }
            sets = next;
        }
        sets
    }

    pub fn is_multi(&self) -> bool {
        self.tables.iter().any(|t| t.physical.len() > 1)
    }

    /// Physical name for a logical table, when it routes to exactly one.
    pub fn single_table(&self, logical: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.logical.eq_ignore_ascii_case(logical))
            .and_then(|t| match t.physical.as_slice() {
                [one] => Some(one.as_str()),
                _ => None,
            })
    }
}

/// Named strategies plus the routing rules that use them.
#[derive(Clone, Default)]
pub struct ShardingRouter {
    strategies: HashMap<String, Arc<dyn ShardingStrategy>>,
}

impl ShardingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<dyn ShardingStrategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    fn strategy(&self, name: &str) -> Result<&Arc<dyn ShardingStrategy>> {
        self.strategies
            .get(name)
            .ok_or_else(|| EngineError::sharding(format!("strategy `{}` is not registered", name)))
    }

    /// Resolve placement. `value_of` supplies the value for an attribute or
    /// parameter name. A failing strategy aborts the operation.
    pub fn route(
        &self,
        config: Option<&ShardingConfig>,
        value_of: &dyn Fn(&str) -> CellValue,
    ) -> Result<RouteTarget> {
        let Some(config) = config else {
            return Ok(RouteTarget::default());
        };
        let mut target = RouteTarget::default();

        if let Some(ds) = &config.data_source {
            let values: Vec<CellValue> = ds.fields.iter().map(|f| value_of(f)).collect();
            target.data_source = self
                .strategy(&ds.strategy)?
                .data_source(&values)
                .map_err(|e| {
                    EngineError::sharding(format!("strategy `{}` failed: {}", ds.strategy, e))
                })?;
        }

        for table in &config.tables {
            let values: Vec<CellValue> = table.fields.iter().map(|f| value_of(f)).collect();
            let suffixes = self
                .strategy(&table.strategy)?
                .table_suffixes(&values)
                .map_err(|e| {
                    EngineError::sharding(format!("strategy `{}` failed: {}", table.strategy, e))
                })?;
            let physical = if suffixes.is_empty() {
                vec![table.table.clone()]
            } else {
                suffixes
                    .iter()
                    .map(|s| format!("{}_{}", table.table, s))
                    .collect()
            };
            tracing::debug!(table = %table.table, ?physical, "table route");
            target.tables.push(TableRoute {
                logical: table.table.clone(),
                physical,
            });
        }
        Ok(target)
    }
}

/// Replace whole-word logical table names outside quoted text.
pub fn apply_tables(sql: &str, tables: &[(String, String)]) -> String {
    if tables.iter().all(|(l, p)| l == p) {
        return sql.to_string();
    }
    let patterns: Vec<(Regex, &str)> = tables
        .iter()
        .filter(|(l, p)| l != p)
        .filter_map(|(l, p)| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(l)))
                .ok()
                .map(|re| (re, p.as_str()))
        })
        .collect();
    let mut out = String::with_capacity(sql.len() + 16);
    for (quoted, part) in split_quoted(sql) {
        if quoted {
            out.push_str(&part);
            continue;
        }
        let mut replaced = part;
        for (re, physical) in &patterns {
            replaced = re
                .replace_all(&replaced, regex::NoExpand(physical))
                .into_owned();
        }
        out.push_str(&replaced);
    }
    out
}
