//! Connection seam between the engine and a database driver.
//!
//! The engine only talks to [`DataSourceProvider`], [`Connection`] and
//! [`RowCursor`]; `postgres` implements them over pooled tokio-postgres
//! clients.

pub mod diagnostics;
pub mod extract;
pub mod postgres;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::value::{CellValue, ColumnInfo};

pub use diagnostics::ExecutionContext;
pub use extract::{extract, Extraction, ExtractLimits};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Column labels and rows of one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RawResult {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn labels(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Append rows of another execution of the same statement.
    pub fn concat(&mut self, other: RawResult) {
        if self.columns.is_empty() {
            self.columns = other.columns;
        }
        self.rows.extend(other.rows);
    }
}

#[async_trait]
pub trait RowCursor: Send {
    fn columns(&self) -> &[ColumnInfo];

    async fn next_row(&mut self) -> DriverResult<Option<Vec<CellValue>>>;
}

/// One live connection inside a unit of work owned by the provider. The
/// engine commits only when a call asks for it.
#[async_trait]
pub trait Connection: Send {
    /// Product string used to pick the dialect, e.g. `PostgreSQL 16.2`.
    async fn product_name(&mut self) -> DriverResult<String>;

    async fn query(&mut self, sql: &str, params: &[CellValue]) -> DriverResult<Box<dyn RowCursor>>;

    async fn execute(&mut self, sql: &str, params: &[CellValue]) -> DriverResult<u64>;

    /// Run one statement for every parameter row as a single grouped
    /// submission. Returns the summed affected-row count.
    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<CellValue>]) -> DriverResult<u64>;

    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;
}

#[async_trait]
pub trait DataSourceProvider: Send + Sync {
    async fn acquire(&self, data_source: &str) -> DriverResult<Box<dyn Connection>>;
}

/// Cursor over rows already in memory.
pub struct VecCursor {
    columns: Vec<ColumnInfo>,
    rows: VecDeque<Vec<CellValue>>,
}

impl VecCursor {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    async fn next_row(&mut self) -> DriverResult<Option<Vec<CellValue>>> {
        Ok(self.rows.pop_front())
    }
}
