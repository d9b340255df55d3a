//! Date and number formatting of result columns.
//!
//! Date patterns are either strftime (`%Y-%m-%d`) or the common
//! `yyyy-MM-dd HH:mm:ss` form. Number patterns follow the `#,##0.00`
//! convention: `,` enables grouping, zeros are mandatory digits, `#` after
//! the point is an optional digit and a trailing `%` scales by 100.

use chrono::{Locale, NaiveDateTime};

use super::DataSet;
use crate::config::{Format, FormatKind, Rounding};
use crate::exec::ExecutionContext;
use crate::value::{CellValue, ColumnType};

pub fn apply(data: &mut DataSet, format: &Format, ctx: &mut ExecutionContext) {
    let Some(idx) = data.column_index(&format.column) else {
        return;
    };
    let mut failures = 0usize;
    for row in &mut data.rows {
        if row[idx].is_null() {
            continue;
        }
        let formatted = match format.kind {
            FormatKind::Date => format_date(&row[idx], &format.pattern, format.locale.as_deref()),
            FormatKind::Number => format_number(&row[idx], &format.pattern, format.rounding, format.locale.as_deref()),
        };
        match formatted {
            Some(text) => row[idx] = CellValue::Text(text),
            None => failures += 1,
        }
    }
    if failures > 0 {
        ctx.log(format!(
            "{} value(s) of `{}` could not be formatted with `{}`",
            failures, format.column, format.pattern
        ));
    }
}

fn to_datetime(value: &CellValue) -> Option<NaiveDateTime> {
    match value.clone().coerce(ColumnType::DateTime) {
        CellValue::DateTime(dt) => Some(dt),
        CellValue::TimestampTz(dt) => Some(dt.naive_utc()),
        _ => None,
    }
}

/// `yyyy-MM-dd HH:mm:ss` style pattern to strftime.
pub fn strftime_pattern(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }
    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MMMM", "%B"),
        ("MMM", "%b"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("SSS", "%3f"),
        ("EEEE", "%A"),
        ("EEE", "%a"),
        ("a", "%p"),
    ];
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (token, spec) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(spec);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

pub fn format_date(value: &CellValue, pattern: &str, locale: Option<&str>) -> Option<String> {
    let dt = to_datetime(value)?;
    let spec = strftime_pattern(pattern);
    let locale = locale.and_then(|l| Locale::try_from(l.replace('-', "_").as_str()).ok());
    Some(match locale {
        Some(locale) => dt.and_utc().format_localized(&spec, locale).to_string(),
        None => dt.format(&spec).to_string(),
    })
}

/// Grouping and decimal separators for a locale tag.
fn separators(locale: Option<&str>) -> (&'static str, char) {
    let lang = locale
        .and_then(|l| l.split(['_', '-']).next())
        .unwrap_or("")
        .to_ascii_lowercase();
    match lang.as_str() {
        "de" | "es" | "it" | "pt" | "nl" | "id" | "tr" | "da" => (".", ','),
        "fr" | "ru" | "pl" | "cs" | "sv" | "fi" | "nb" | "uk" => ("\u{a0}", ','),
        "ch" => ("'", '.'),
        _ => (",", '.'),
    }
}

struct NumberPattern {
    grouping: bool,
    min_int: usize,
    min_frac: usize,
    max_frac: usize,
    percent: bool,
}

fn parse_pattern(pattern: &str) -> NumberPattern {
    let percent = pattern.trim_end().ends_with('%');
    let body = pattern.trim().trim_end_matches('%');
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    NumberPattern {
        grouping: int_part.contains(','),
        min_int: int_part.chars().filter(|c| *c == '0').count(),
        min_frac: frac_part.chars().filter(|c| *c == '0').count(),
        max_frac: frac_part.chars().filter(|c| *c == '0' || *c == '#').count(),
        percent,
    }
}

/// Exact decimal digits of a value: sign, integer digits, fraction digits.
fn decimal_digits(value: &CellValue) -> Option<(bool, String, String)> {
    let text = match value {
        CellValue::Int16(_) | CellValue::Int32(_) | CellValue::Int64(_) => value.display(),
        CellValue::Float32(f) if f.is_finite() => f64::from(*f).to_string(),
        CellValue::Float64(f) if f.is_finite() => f.to_string(),
        CellValue::Text(s) => s.trim().to_string(),
        _ => return None,
    };
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.to_string()),
        None => (false, text.trim_start_matches('+').to_string()),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned.as_str(), ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((negative, int_part.to_string(), frac_part.to_string()))
}

/// Add one unit in the last place of a digit string, returning the carry.
fn increment(digits: &mut [u8]) -> bool {
    for d in digits.iter_mut().rev() {
        if *d == b'9' {
            *d = b'0';
        } else {
            *d += 1;
            return false;
        }
    }
    true
}

pub fn format_number(value: &CellValue, pattern: &str, rounding: Rounding, locale: Option<&str>) -> Option<String> {
    let (negative, mut int_part, mut frac_part) = decimal_digits(value)?;
    let p = parse_pattern(pattern);
    if p.percent {
        // shift the decimal point two places right
        while frac_part.len() < 2 {
            frac_part.push('0');
        }
        int_part.push_str(&frac_part[..2]);
        frac_part = frac_part[2..].to_string();
    }

    let frac_count = frac_part.len().min(p.max_frac);
    let mut digits: Vec<u8> = int_part.bytes().collect();
    digits.extend_from_slice(&frac_part.as_bytes()[..frac_count]);
    if frac_part.len() > p.max_frac {
        let dropped = &frac_part.as_bytes()[p.max_frac..];
        let round_up = match rounding {
            Rounding::HalfUp => dropped[0] >= b'5',
            Rounding::Down => false,
            Rounding::Up => dropped.iter().any(|d| *d != b'0'),
        };
        if round_up && increment(&mut digits) {
            digits.insert(0, b'1');
        }
    }
    let (int_digits, frac_digits) = digits.split_at(digits.len() - frac_count);

    let mut int_str: String = String::from_utf8_lossy(int_digits)
        .trim_start_matches('0')
        .to_string();
    while int_str.len() < p.min_int.max(1) {
        int_str.insert(0, '0');
    }
    let mut frac_str = String::from_utf8_lossy(frac_digits).to_string();
    while frac_str.len() < p.min_frac {
        frac_str.push('0');
    }
    while frac_str.len() > p.min_frac && frac_str.ends_with('0') {
        frac_str.pop();
    }

    let (group_sep, decimal_sep) = separators(locale);
    if p.grouping {
        let len = int_str.len();
        let mut grouped = String::with_capacity(len + len / 3 * group_sep.len());
        for (i, c) in int_str.chars().enumerate() {
            if i > 0 && (len - i) % 3 == 0 {
                grouped.push_str(group_sep);
            }
            grouped.push(c);
        }
        int_str = grouped;
    }

    let is_zero = int_str.chars().chain(frac_str.chars()).all(|c| !c.is_ascii_digit() || c == '0');
    let mut out = String::new();
    if negative && !is_zero {
        out.push('-');
    }
    out.push_str(&int_str);
    if !frac_str.is_empty() {
        out.push(decimal_sep);
        out.push_str(&frac_str);
    }
    if p.percent {
        out.push('%');
    }
    Some(out)
}
