use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A single cell flowing through binding, extraction and shaping.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<CellValue>),
    Unknown(String),
}

/// Declared storage type of an entity column. Used to coerce loosely typed
/// values (JSON numbers, ISO strings) before they are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int16,
    Int32,
    Int64,
    Float64,
    #[default]
    Text,
    Bytes,
    Date,
    Time,
    DateTime,
    TimestampTz,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display()).collect();
                format!("{{{}}}", items.join(", "))
            }
            CellValue::Unknown(s) => s.clone(),
        }
    }

    /// String form used for cache keys and group identities. Absent values
    /// render as the literal `null`.
    pub fn key_string(&self) -> String {
        match self {
            CellValue::Null => "null".to_string(),
            other => other.display(),
        }
    }

    pub fn display_width(&self) -> usize {
        unicode_width::UnicodeWidthStr::width(self.display().as_str())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Null, blank text or an empty array. Optional `#[...]` blocks are
    /// dropped when all their parameters are empty in this sense.
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Array(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int16(i) => Some(f64::from(*i)),
            CellValue::Int32(i) => Some(f64::from(*i)),
            CellValue::Int64(i) => Some(*i as f64),
            CellValue::Float32(f) => Some(f64::from(*f)),
            CellValue::Float64(f) => Some(*f),
            CellValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int16(i) => Some(i64::from(*i)),
            CellValue::Int32(i) => Some(i64::from(*i)),
            CellValue::Int64(i) => Some(*i),
            CellValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Bool(b) => serde_json::Value::Bool(*b),
            CellValue::Int16(i) => serde_json::json!(*i),
            CellValue::Int32(i) => serde_json::json!(*i),
            CellValue::Int64(i) => serde_json::json!(*i),
            CellValue::Float32(f) => serde_json::json!(*f),
            CellValue::Float64(f) => serde_json::json!(*f),
            CellValue::Json(j) => j.clone(),
            CellValue::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(CellValue::to_json).collect())
            }
            // chrono's serde forms, so typed records can deserialize them back
            CellValue::Date(d) => serde_json::to_value(d).unwrap_or(serde_json::Value::Null),
            CellValue::Time(t) => serde_json::to_value(t).unwrap_or(serde_json::Value::Null),
            CellValue::DateTime(dt) => serde_json::to_value(dt).unwrap_or(serde_json::Value::Null),
            CellValue::TimestampTz(dt) => {
                serde_json::to_value(dt).unwrap_or(serde_json::Value::Null)
            }
            other => serde_json::Value::String(other.display()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CellValue::Null,
            serde_json::Value::Bool(b) => CellValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CellValue::Int64(i)
                } else {
                    n.as_f64().map(CellValue::Float64).unwrap_or(CellValue::Null)
                }
            }
            serde_json::Value::String(s) => CellValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                CellValue::Array(items.iter().map(CellValue::from_json).collect())
            }
            serde_json::Value::Object(_) => CellValue::Json(value.clone()),
        }
    }

    /// Convert into the declared column type where the conversion is lossless
    /// enough to be unsurprising. Values that cannot be converted are returned
    /// unchanged and left to the driver to reject.
    pub fn coerce(self, ty: ColumnType) -> Self {
        match (ty, self) {
            (_, CellValue::Null) => CellValue::Null,
            (ColumnType::Int16, v) => match v.as_i64().and_then(|i| i16::try_from(i).ok()) {
                Some(i) => CellValue::Int16(i),
                None => v,
            },
            (ColumnType::Int32, v) => match v.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) => CellValue::Int32(i),
                None => v,
            },
            (ColumnType::Int64, v) => match v.as_i64() {
                Some(i) => CellValue::Int64(i),
                None => v,
            },
            (ColumnType::Float64, v) => match v.as_f64() {
                Some(f) => CellValue::Float64(f),
                None => v,
            },
            (ColumnType::Bool, CellValue::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "y" => CellValue::Bool(true),
                "false" | "0" | "n" => CellValue::Bool(false),
                _ => CellValue::Text(s),
            },
            (ColumnType::Date, CellValue::Text(s)) => {
                match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
                    Ok(d) => CellValue::Date(d),
                    Err(_) => CellValue::Text(s),
                }
            }
            (ColumnType::Date, CellValue::DateTime(dt)) => CellValue::Date(dt.date()),
            (ColumnType::Time, CellValue::Text(s)) => {
                match NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f") {
                    Ok(t) => CellValue::Time(t),
                    Err(_) => CellValue::Text(s),
                }
            }
            (ColumnType::DateTime, CellValue::Text(s)) => match parse_datetime(&s) {
                Some(dt) => CellValue::DateTime(dt),
                None => CellValue::Text(s),
            },
            (ColumnType::DateTime, CellValue::Date(d)) => {
                CellValue::DateTime(d.and_time(NaiveTime::MIN))
            }
            (ColumnType::TimestampTz, CellValue::Text(s)) => {
                match DateTime::parse_from_rfc3339(s.trim()) {
                    Ok(dt) => CellValue::TimestampTz(dt.with_timezone(&Utc)),
                    Err(_) => match parse_datetime(&s) {
                        Some(dt) => CellValue::TimestampTz(dt.and_utc()),
                        None => CellValue::Text(s),
                    },
                }
            }
            (ColumnType::Text, v @ CellValue::Text(_)) => v,
            (ColumnType::Text, CellValue::Json(j)) => CellValue::Text(j.to_string()),
            (ColumnType::Json, CellValue::Text(s)) => match serde_json::from_str(&s) {
                Ok(j) => CellValue::Json(j),
                Err(_) => CellValue::Text(s),
            },
            (_, v) => v,
        }
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        CellValue::Int32(v)
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int64(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float64(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(v: NaiveDate) -> Self {
        CellValue::Date(v)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(v: NaiveDateTime) -> Self {
        CellValue::DateTime(v)
    }
}

impl<T: Into<CellValue>> From<Vec<T>> for CellValue {
    fn from(v: Vec<T>) -> Self {
        CellValue::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CellValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_display() {
        assert_eq!(CellValue::Null.display(), "NULL");
        assert_eq!(CellValue::Null.key_string(), "null");
    }

    #[test]
    fn test_integer_display() {
        assert_eq!(CellValue::Int16(42).display(), "42");
        assert_eq!(CellValue::Int32(-100).display(), "-100");
        assert_eq!(CellValue::Int64(9_999_999).display(), "9999999");
    }

    #[test]
    fn test_array_display() {
        let arr = CellValue::from(vec![1, 2, 3]);
        assert_eq!(arr.display(), "{1, 2, 3}");
    }

    #[test]
    fn test_display_width() {
        assert_eq!(CellValue::Text("hello".into()).display_width(), 5);
        assert_eq!(CellValue::Text("中文".into()).display_width(), 4);
    }

    #[test]
    fn test_is_empty() {
        assert!(CellValue::Null.is_empty());
        assert!(CellValue::Text("  ".into()).is_empty());
        assert!(CellValue::Array(vec![]).is_empty());
        assert!(!CellValue::Int32(0).is_empty());
    }

    #[test]
    fn test_json_round_trip_keeps_dates_readable() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let json = CellValue::Date(d).to_json();
        assert_eq!(json, serde_json::json!("2024-03-01"));
        let back = CellValue::from_json(&json).coerce(ColumnType::Date);
        assert_eq!(back, CellValue::Date(d));
    }

    #[test]
    fn test_coerce_numbers() {
        assert_eq!(CellValue::Int64(7).coerce(ColumnType::Int32), CellValue::Int32(7));
        assert_eq!(
            CellValue::Text("12.5".into()).coerce(ColumnType::Float64),
            CellValue::Float64(12.5)
        );
        // out of range stays as-is
        assert_eq!(
            CellValue::Int64(i64::MAX).coerce(ColumnType::Int16),
            CellValue::Int64(i64::MAX)
        );
    }

    #[test]
    fn test_coerce_datetime_forms() {
        let v = CellValue::Text("2024-03-01T10:20:30".into()).coerce(ColumnType::DateTime);
        assert!(matches!(v, CellValue::DateTime(_)));
        let v = CellValue::Text("2024-03-01 10:20:30".into()).coerce(ColumnType::DateTime);
        assert!(matches!(v, CellValue::DateTime(_)));
        assert_eq!(CellValue::Null.coerce(ColumnType::Date), CellValue::Null);
    }
}
