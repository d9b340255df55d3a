use chrono::{Datelike, NaiveDate};

use crate::value::CellValue;

pub type StrategyResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Maps attribute values to a physical placement. Implementations must be
/// pure: the same values always give the same answer.
///
/// `values` are aligned by position with the attribute list declared next
/// to the strategy reference.
pub trait ShardingStrategy: Send + Sync {
    /// Data source for the values; `None` leaves the choice to the default.
    fn data_source(&self, _values: &[CellValue]) -> StrategyResult<Option<String>> {
        Ok(None)
    }

    /// Suffixes appended (`<table>_<suffix>`) to the logical table. Several
    /// suffixes mean the values span several shards; none keeps the logical
    /// table.
    fn table_suffixes(&self, _values: &[CellValue]) -> StrategyResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// FNV-1a, stable across processes and compiler versions.
fn stable_hash(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn bucket(value: &CellValue, buckets: usize) -> Option<usize> {
    if buckets == 0 || value.is_null() {
        return None;
    }
    let n = match value.as_i64() {
        Some(i) => i.unsigned_abs(),
        None => stable_hash(&value.key_string()),
    };
    Some((n % buckets as u64) as usize)
}

/// Spread rows by hash of the first value: integer keys use the value
/// itself, anything else its FNV hash.
#[derive(Debug, Clone)]
pub struct HashModStrategy {
    pub data_sources: Vec<String>,
    pub table_count: usize,
}

impl HashModStrategy {
    pub fn new(data_sources: Vec<String>, table_count: usize) -> Self {
        Self {
            data_sources,
            table_count,
        }
    }
}

impl ShardingStrategy for HashModStrategy {
    fn data_source(&self, values: &[CellValue]) -> StrategyResult<Option<String>> {
        let Some(first) = values.first() else {
            return Ok(None);
        };
        Ok(bucket(first, self.data_sources.len()).map(|i| self.data_sources[i].clone()))
    }

    /// A missing key cannot be placed, so it spans every table.
    fn table_suffixes(&self, values: &[CellValue]) -> StrategyResult<Vec<String>> {
        match values.first().and_then(|v| bucket(v, self.table_count)) {
            Some(i) => Ok(vec![i.to_string()]),
            None => Ok((0..self.table_count).map(|i| i.to_string()).collect()),
        }
    }
}

/// Monthly tables (`<table>_YYYYMM`). One value picks a month; two values
/// are an inclusive date range spanning every month between them.
#[derive(Debug, Clone, Default)]
pub struct MonthlyTableStrategy;

fn as_date(value: &CellValue) -> Option<NaiveDate> {
    match value {
        CellValue::Date(d) => Some(*d),
        CellValue::DateTime(dt) => Some(dt.date()),
        CellValue::TimestampTz(dt) => Some(dt.date_naive()),
        CellValue::Text(_) => match value.clone().coerce(crate::value::ColumnType::Date) {
            CellValue::Date(d) => Some(d),
            _ => match value.clone().coerce(crate::value::ColumnType::DateTime) {
                CellValue::DateTime(dt) => Some(dt.date()),
                _ => None,
            },
        },
        _ => None,
    }
}

impl ShardingStrategy for MonthlyTableStrategy {
    fn table_suffixes(&self, values: &[CellValue]) -> StrategyResult<Vec<String>> {
        let start = values
            .first()
            .and_then(as_date)
            .ok_or("monthly sharding needs a date value")?;
        let end = values.get(1).and_then(as_date).unwrap_or(start);
        if end < start {
            return Err(format!("date range {} .. {} is reversed", start, end).into());
        }
        let mut suffixes = Vec::new();
        let (mut year, mut month) = (start.year(), start.month());
        while (year, month) <= (end.year(), end.month()) {
            suffixes.push(format!("{:04}{:02}", year, month));
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        Ok(suffixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_mod_is_deterministic() {
        let s = HashModStrategy::new(vec!["ds0".into(), "ds1".into()], 4);
        assert_eq!(s.data_source(&[CellValue::Int64(7)]).unwrap().as_deref(), Some("ds1"));
        assert_eq!(s.data_source(&[CellValue::Int64(8)]).unwrap().as_deref(), Some("ds0"));
        let a = s.table_suffixes(&["S001".into()]).unwrap();
        let b = s.table_suffixes(&["S001".into()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_hash_mod_null_spans_all_tables() {
        let s = HashModStrategy::new(vec![], 3);
        assert_eq!(s.table_suffixes(&[CellValue::Null]).unwrap(), vec!["0", "1", "2"]);
        assert!(s.data_source(&[CellValue::Int32(1)]).unwrap().is_none());
    }

    #[test]
    fn test_monthly_range() {
        let s = MonthlyTableStrategy;
        let one = s.table_suffixes(&["2024-03-15".into()]).unwrap();
        assert_eq!(one, vec!["202403"]);
        let range = s
            .table_suffixes(&["2023-11-02".into(), "2024-02-01 08:00:00".into()])
            .unwrap();
        assert_eq!(range, vec!["202311", "202312", "202401", "202402"]);
        assert!(s.table_suffixes(&[CellValue::Null]).is_err());
    }
}
