use super::{DriverResult, RawResult, RowCursor};
use crate::config::EngineSettings;
use crate::exec::ExecutionContext;

/// Row-volume limits applied while reading a cursor, before any shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    pub warn_threshold: usize,
    pub max_threshold: Option<usize>,
    pub ignore_empty_rows: bool,
}

impl ExtractLimits {
    pub fn from_settings(settings: &EngineSettings, ignore_empty_rows: bool) -> Self {
        Self {
            warn_threshold: settings.warn_threshold,
            max_threshold: settings.max_threshold,
            ignore_empty_rows,
        }
    }

    /// No limits; used for internal lookups such as counts and key loads.
    pub fn unbounded() -> Self {
        Self {
            warn_threshold: usize::MAX,
            max_threshold: None,
            ignore_empty_rows: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub result: RawResult,
    pub warned: bool,
    /// The cursor held more rows than the max threshold allowed.
    pub truncated: bool,
}

/// Drain a cursor. Reaching the max threshold stops reading and logs one
/// error; the rows read so far are a prefix of the full result and are
/// returned normally.
pub async fn extract(
    cursor: &mut dyn RowCursor,
    limits: ExtractLimits,
    ctx: &mut ExecutionContext,
) -> DriverResult<Extraction> {
    let columns = cursor.columns().to_vec();
    let mut rows = Vec::new();
    let mut warned = false;
    let mut truncated = false;
    let warn_below_max = limits
        .max_threshold
        .map_or(true, |max| limits.warn_threshold < max);
    while let Some(row) = cursor.next_row().await? {
        if limits.max_threshold.is_some_and(|max| rows.len() >= max) {
            truncated = true;
            break;
        }
        if limits.ignore_empty_rows && row.iter().all(|v| v.is_empty()) {
            continue;
        }
        debug_assert_eq!(row.len(), columns.len());
        rows.push(row);
        if warn_below_max && !warned && rows.len() >= limits.warn_threshold {
            warned = true;
            tracing::warn!(
                uid = ctx.uid(),
                rows = rows.len(),
                "large result: row count reached the warn threshold"
            );
            ctx.log(format!("row count reached warn threshold {}", limits.warn_threshold));
        }
    }
    if truncated {
        let max = rows.len();
        tracing::error!(
            uid = ctx.uid(),
            max,
            "result truncated at the max threshold; remaining rows were not read"
        );
        ctx.log(format!("result truncated at max threshold {}", max));
    }
    Ok(Extraction {
        result: RawResult::new(columns, rows),
        warned,
        truncated,
    })
}
