//! Scripted in-memory driver for engine tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Connection, DataSourceProvider, DriverResult, RowCursor, VecCursor};
use crate::error::{DriverError, ErrorCategory};
use crate::value::{CellValue, ColumnInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Query { data_source: String, sql: String, params: Vec<CellValue> },
    Execute { data_source: String, sql: String, params: Vec<CellValue> },
    Batch { data_source: String, sql: String, rows: usize },
    Commit(String),
    Rollback(String),
}

impl Call {
    pub fn sql(&self) -> Option<&str> {
        match self {
            Call::Query { sql, .. } | Call::Execute { sql, .. } | Call::Batch { sql, .. } => {
                Some(sql)
            }
            _ => None,
        }
    }
}

struct Rule {
    pattern: String,
    columns: Vec<ColumnInfo>,
    rows: Vec<Vec<CellValue>>,
    once: bool,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    products: HashMap<String, String>,
    calls: Vec<Call>,
    fail_batch_at: Option<usize>,
    batches: usize,
    fail_on: Option<String>,
}

/// Answers queries from rules matched by SQL substring (case-insensitive,
/// first match wins) and records every call.
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<State>>,
}

pub fn cols(names: &[&str]) -> Vec<ColumnInfo> {
    names.iter().map(|n| ColumnInfo::new(*n, "text")).collect()
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn product(&self, data_source: &str, product: &str) -> &Self {
        self.state
            .lock()
            .products
            .insert(data_source.to_string(), product.to_string());
        self
    }

    pub fn respond(&self, pattern: &str, columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>) -> &Self {
        self.push_rule(pattern, columns, rows, false)
    }

    pub fn respond_once(&self, pattern: &str, columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>) -> &Self {
        self.push_rule(pattern, columns, rows, true)
    }

    fn push_rule(&self, pattern: &str, columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>, once: bool) -> &Self {
        self.state.lock().rules.push(Rule {
            pattern: pattern.to_lowercase(),
            columns,
            rows,
            once,
        });
        self
    }

    /// The n-th batch submission (zero based) fails.
    pub fn fail_batch_at(&self, n: usize) -> &Self {
        self.state.lock().fail_batch_at = Some(n);
        self
    }

    /// Any statement containing `pattern` fails.
    pub fn fail_on(&self, pattern: &str) -> &Self {
        self.state.lock().fail_on = Some(pattern.to_lowercase());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn sqls(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.sql().map(str::to_string))
            .collect()
    }

    pub fn provider(&self) -> Arc<dyn DataSourceProvider> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl DataSourceProvider for MockDatabase {
    async fn acquire(&self, data_source: &str) -> DriverResult<Box<dyn Connection>> {
        Ok(Box::new(MockConnection {
            data_source: data_source.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    data_source: String,
    state: Arc<Mutex<State>>,
}

impl MockConnection {
    fn check_failure(state: &State, sql: &str) -> DriverResult<()> {
        match &state.fail_on {
            Some(p) if sql.to_lowercase().contains(p.as_str()) => {
                Err(DriverError::with_code("23505", format!("scripted failure for `{}`", sql)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn product_name(&mut self) -> DriverResult<String> {
        Ok(self
            .state
            .lock()
            .products
            .get(&self.data_source)
            .cloned()
            .unwrap_or_else(|| "PostgreSQL 16.2".to_string()))
    }

    async fn query(&mut self, sql: &str, params: &[CellValue]) -> DriverResult<Box<dyn RowCursor>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Query {
            data_source: self.data_source.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        Self::check_failure(&state, sql)?;
        let lower = sql.to_lowercase();
        let Some(pos) = state.rules.iter().position(|r| lower.contains(&r.pattern)) else {
            return Ok(Box::new(VecCursor::new(Vec::new(), Vec::new())));
        };
        let cursor = {
            let rule = &state.rules[pos];
            VecCursor::new(rule.columns.clone(), rule.rows.clone())
        };
        if state.rules[pos].once {
            state.rules.remove(pos);
        }
        Ok(Box::new(cursor))
    }

    async fn execute(&mut self, sql: &str, params: &[CellValue]) -> DriverResult<u64> {
        let mut state = self.state.lock();
        state.calls.push(Call::Execute {
            data_source: self.data_source.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        Self::check_failure(&state, sql)?;
        Ok(1)
    }

    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<CellValue>]) -> DriverResult<u64> {
        let mut state = self.state.lock();
        state.calls.push(Call::Batch {
            data_source: self.data_source.clone(),
            sql: sql.to_string(),
            rows: rows.len(),
        });
        let n = state.batches;
        state.batches += 1;
        if state.fail_batch_at == Some(n) {
            return Err(DriverError::new(ErrorCategory::Execution, "scripted batch failure"));
        }
        Self::check_failure(&state, sql)?;
        Ok(rows.len() as u64)
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.state.lock().calls.push(Call::Commit(self.data_source.clone()));
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.state.lock().calls.push(Call::Rollback(self.data_source.clone()));
        Ok(())
    }
}
