//! Key and business-id generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;

use crate::error::Result;
use crate::value::{CellValue, ColumnType};

/// Everything a generator may use to build one id.
#[derive(Debug, Clone, PartialEq)]
pub struct IdRequest {
    pub table: String,
    pub signature: Option<String>,
    pub related_columns: Vec<String>,
    pub related_values: Vec<CellValue>,
    pub timestamp: NaiveDateTime,
    pub target_type: ColumnType,
    /// Total length of a string id; 0 leaves it to the generator.
    pub length: usize,
    /// Digits reserved for the running sequence; 0 means the default.
    pub sequence_size: usize,
}

impl IdRequest {
    pub fn new(table: impl Into<String>, target_type: ColumnType) -> Self {
        Self {
            table: table.into(),
            signature: None,
            related_columns: Vec::new(),
            related_values: Vec::new(),
            timestamp: Local::now().naive_local(),
            target_type,
            length: 0,
            sequence_size: 0,
        }
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self, request: &IdRequest) -> Result<CellValue>;
}

const DEFAULT_SEQUENCE_SIZE: usize = 4;

/// Time-ordered ids.
///
/// Numeric targets get `epoch_millis * 1000 + sequence`. String targets
/// without a signature get `yyMMddHHmmssSSS` + node + sequence; with a
/// signature (business ids) they get signature + related values + `yyMMdd`
/// + a sequence counted per prefix.
pub struct TimeSequenceGenerator {
    node: u16,
    sequence: AtomicU64,
    prefixes: Mutex<HashMap<String, u64>>,
}

impl TimeSequenceGenerator {
    pub fn new(node: u16) -> Self {
        Self {
            node: node % 1000,
            sequence: AtomicU64::new(0),
            prefixes: Mutex::new(HashMap::new()),
        }
    }

    fn sequence_width(request: &IdRequest, prefix_len: usize) -> usize {
        if request.length > prefix_len {
            request.length - prefix_len
        } else if request.sequence_size > 0 {
            request.sequence_size
        } else {
            DEFAULT_SEQUENCE_SIZE
        }
    }

    fn business_id(&self, request: &IdRequest, signature: &str) -> String {
        let mut prefix = signature.to_string();
        for value in &request.related_values {
            if !value.is_null() {
                prefix.push_str(&value.display());
            }
        }
        prefix.push_str(&request.timestamp.format("%y%m%d").to_string());
        let width = Self::sequence_width(request, prefix.len());
        let seq = {
            let mut prefixes = self.prefixes.lock();
            let counter = prefixes.entry(prefix.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        format!("{}{}", prefix, pad_sequence(seq, width))
    }
}

impl Default for TimeSequenceGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

fn pad_sequence(seq: u64, width: usize) -> String {
    let modulus = 10u64.checked_pow(width as u32).unwrap_or(u64::MAX);
    format!("{:0width$}", seq % modulus, width = width)
}

impl IdGenerator for TimeSequenceGenerator {
    fn next_id(&self, request: &IdRequest) -> Result<CellValue> {
        if let Some(signature) = &request.signature {
            return Ok(CellValue::Text(self.business_id(request, signature)));
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        match request.target_type {
            ColumnType::Int64 | ColumnType::Float64 => {
                let millis = request.timestamp.and_utc().timestamp_millis();
                Ok(CellValue::Int64(millis * 1000 + (seq % 1000) as i64))
            }
            ColumnType::Int32 | ColumnType::Int16 => Ok(CellValue::Int32((seq % i32::MAX as u64) as i32)),
            _ => {
                let prefix = format!(
                    "{}{:03}",
                    request.timestamp.format("%y%m%d%H%M%S%3f"),
                    self.node
                );
                let width = Self::sequence_width(request, prefix.len());
                Ok(CellValue::Text(format!("{}{}", prefix, pad_sequence(seq, width))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(req: IdRequest) -> IdRequest {
        IdRequest {
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_milli_opt(8, 30, 15, 123)
                .unwrap(),
            ..req
        }
    }

    #[test]
    fn test_string_ids_are_time_prefixed_and_unique() {
        let generator = TimeSequenceGenerator::new(7);
        let req = at(IdRequest::new("sys_staff", ColumnType::Text));
        let a = generator.next_id(&req).unwrap().display();
        let b = generator.next_id(&req).unwrap().display();
        assert_eq!(a, "2403010830151230070001");
        assert_ne!(a, b);
    }

    #[test]
    fn test_numeric_ids() {
        let generator = TimeSequenceGenerator::default();
        let req = at(IdRequest::new("orders", ColumnType::Int64));
        let CellValue::Int64(a) = generator.next_id(&req).unwrap() else {
            panic!("expected an integer id");
        };
        let CellValue::Int64(b) = generator.next_id(&req).unwrap() else {
            panic!("expected an integer id");
        };
        assert!(b > a);
    }

    #[test]
    fn test_business_id_sequence_per_prefix() {
        let generator = TimeSequenceGenerator::default();
        let mut req = at(IdRequest::new("orders", ColumnType::Text));
        req.signature = Some("SO".into());
        req.related_values = vec!["BJ".into()];
        req.length = 14;
        assert_eq!(generator.next_id(&req).unwrap().display(), "SOBJ2403010001");
        assert_eq!(generator.next_id(&req).unwrap().display(), "SOBJ2403010002");
        req.related_values = vec!["SH".into()];
        assert_eq!(generator.next_id(&req).unwrap().display(), "SOSH2403010001");
    }
}
