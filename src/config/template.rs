//! Statement text with named (`:name`) or positional (`?`) parameters and
//! optional `#[ ... ]` condition blocks.
//!
//! A template is parsed once when its descriptor is built. Binding walks the
//! segments, drops blocks whose parameters are all empty, expands array
//! values into one placeholder per element and returns canonical `?` SQL with
//! the values in placeholder order.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{EngineError, Result};
use crate::value::CellValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Named(String),
    Positional(usize),
    Block(Vec<Segment>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlTemplate {
    segments: Vec<Segment>,
    /// Distinct names in order of first appearance.
    param_names: Vec<String>,
    /// Placeholder positions in the canonical SQL.
    placeholder_count: usize,
}

/// SQL ready for a dialect: `?` placeholders and values in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSql {
    pub sql: String,
    pub params: Vec<CellValue>,
}

/// Source of parameter values during binding.
pub trait ParamLookup {
    fn named(&self, name: &str) -> CellValue;
    fn positional(&self, index: usize) -> Option<CellValue>;
}

impl SqlTemplate {
    pub fn parse(sql: &str) -> Result<Self> {
        let chars: Vec<char> = sql.chars().collect();
        let mut stack: Vec<(Vec<Segment>, usize)> = Vec::new();
        let mut current: Vec<Segment> = Vec::new();
        let mut depth = 0usize;
        let mut text = String::new();
        let mut positional = 0usize;
        let mut has_named = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            match c {
                '\'' | '"' | '`' => {
                    let end = scan_quoted(&chars, i).ok_or_else(|| {
                        EngineError::config_parse(format!("unterminated quote at offset {}", i))
                    })?;
                    text.extend(&chars[i..end]);
                    i = end;
                    continue;
                }
                '-' if next == Some('-') => {
                    let end = chars[i..]
                        .iter()
                        .position(|&ch| ch == '\n')
                        .map(|p| i + p)
                        .unwrap_or(chars.len());
                    text.extend(&chars[i..end]);
                    i = end;
                    continue;
                }
                '/' if next == Some('*') => {
                    let end = find_comment_end(&chars, i + 2).ok_or_else(|| {
                        EngineError::config_parse(format!("unterminated comment at offset {}", i))
                    })?;
                    text.extend(&chars[i..end]);
                    i = end;
                    continue;
                }
                '#' if next == Some('[') => {
                    flush(&mut text, &mut current);
                    stack.push((std::mem::take(&mut current), depth));
                    depth = 0;
                    i += 2;
                    continue;
                }
                '[' if !stack.is_empty() => {
                    depth += 1;
                    text.push(c);
                }
                ']' if !stack.is_empty() => {
                    if depth > 0 {
                        depth -= 1;
                        text.push(c);
                    } else {
                        flush(&mut text, &mut current);
                        let block = std::mem::take(&mut current);
                        // stack is non-empty in this arm
                        if let Some((parent, parent_depth)) = stack.pop() {
                            current = parent;
                            depth = parent_depth;
                        }
                        current.push(Segment::Block(block));
                    }
                }
                ':' if next == Some(':') => {
                    text.push_str("::");
                    i += 2;
                    continue;
                }
                ':' if next.is_some_and(|n| n.is_alphabetic() || n == '_') => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len()
                        && (chars[end].is_alphanumeric() || chars[end] == '_' || chars[end] == '.')
                    {
                        end += 1;
                    }
                    // a trailing dot belongs to the surrounding text
                    while end > start && chars[end - 1] == '.' {
                        end -= 1;
                    }
                    flush(&mut text, &mut current);
                    current.push(Segment::Named(chars[start..end].iter().collect()));
                    has_named = true;
                    i = end;
                    continue;
                }
                '?' => {
                    flush(&mut text, &mut current);
                    current.push(Segment::Positional(positional));
                    positional += 1;
                }
                _ => text.push(c),
            }
            i += 1;
        }

        if !stack.is_empty() {
            return Err(EngineError::config_parse(
                "unterminated optional block `#[`",
            ));
        }
        flush(&mut text, &mut current);

        if has_named && positional > 0 {
            return Err(EngineError::config_parse(
                "statement mixes named and positional parameters",
            ));
        }

        let mut param_names = Vec::new();
        let mut placeholder_count = 0;
        collect_names(&current, &mut param_names, &mut placeholder_count);

        Ok(Self {
            segments: current,
            param_names,
            placeholder_count,
        })
    }

    /// Parse and check the placeholders against declared parameter names.
    /// Positional statements take the declared names in order.
    pub fn parse_declared(sql: &str, declared: Option<&[String]>) -> Result<Self> {
        let template = Self::parse(sql)?;
        match declared {
            None => Ok(template),
            Some(names) => template.with_declared_names(names),
        }
    }

    fn with_declared_names(mut self, names: &[String]) -> Result<Self> {
        if self.is_positional() {
            if names.len() != self.placeholder_count {
                return Err(EngineError::config_parse(format!(
                    "{} declared parameter name(s) for {} placeholder(s)",
                    names.len(),
                    self.placeholder_count
                )));
            }
            self.segments = name_positionals(std::mem::take(&mut self.segments), names);
            self.param_names.clear();
            let mut count = 0;
            collect_names(&self.segments, &mut self.param_names, &mut count);
            return Ok(self);
        }
        let matches = names.len() == self.param_names.len()
            && names
                .iter()
                .all(|n| self.param_names.iter().any(|p| p.eq_ignore_ascii_case(n)));
        if !matches {
            return Err(EngineError::config_parse(format!(
                "declared parameters [{}] do not match placeholders [{}]",
                names.join(", "),
                self.param_names.join(", ")
            )));
        }
        Ok(self)
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholder_count
    }

    pub fn is_positional(&self) -> bool {
        self.param_names.is_empty() && self.placeholder_count > 0
    }

    /// SQL with every block kept and each parameter as `?`.
    pub fn canonical_sql(&self) -> String {
        let mut out = String::new();
        render_canonical(&self.segments, &mut out);
        out
    }

    pub fn bind(&self, lookup: &dyn ParamLookup) -> Result<BoundSql> {
        let mut sql = String::new();
        let mut params = Vec::new();
        let mut dropped = false;
        bind_segments(&self.segments, lookup, &mut sql, &mut params, &mut dropped)?;
        if dropped {
            sql = tidy_conditions(&sql);
        }
        Ok(BoundSql { sql, params })
    }
}

fn flush(text: &mut String, segments: &mut Vec<Segment>) {
    if !text.is_empty() {
        segments.push(Segment::Text(std::mem::take(text)));
    }
}

/// Index just past the closing quote. Doubled quotes are escapes.
fn scan_quoted(chars: &[char], start: usize) -> Option<usize> {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn find_comment_end(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len().saturating_sub(1))
        .find(|&i| chars[i] == '*' && chars[i + 1] == '/')
        .map(|i| i + 2)
}

fn collect_names(segments: &[Segment], names: &mut Vec<String>, count: &mut usize) {
    for seg in segments {
        match seg {
            Segment::Text(_) => {}
            Segment::Named(n) => {
                *count += 1;
                if !names.iter().any(|e| e.eq_ignore_ascii_case(n)) {
                    names.push(n.clone());
                }
            }
            Segment::Positional(_) => *count += 1,
            Segment::Block(inner) => collect_names(inner, names, count),
        }
    }
}

fn name_positionals(segments: Vec<Segment>, names: &[String]) -> Vec<Segment> {
    segments
        .into_iter()
        .map(|seg| match seg {
            Segment::Positional(i) => Segment::Named(names[i].clone()),
            Segment::Block(inner) => Segment::Block(name_positionals(inner, names)),
            other => other,
        })
        .collect()
}

fn render_canonical(segments: &[Segment], out: &mut String) {
    for seg in segments {
        match seg {
            Segment::Text(t) => out.push_str(t),
            Segment::Named(_) | Segment::Positional(_) => out.push('?'),
            Segment::Block(inner) => render_canonical(inner, out),
        }
    }
}

fn lookup_value(seg: &Segment, lookup: &dyn ParamLookup) -> Result<Option<CellValue>> {
    match seg {
        Segment::Named(n) => Ok(Some(lookup.named(n))),
        Segment::Positional(i) => lookup
            .positional(*i)
            .map(Some)
            .ok_or_else(|| EngineError::binding(format!("missing value for placeholder #{}", i + 1))),
        _ => Ok(None),
    }
}

/// A block is kept when it has no parameters at all or at least one
/// non-empty value directly inside it or inside a kept nested block.
fn block_kept(segments: &[Segment], lookup: &dyn ParamLookup) -> Result<bool> {
    let mut saw_param = false;
    for seg in segments {
        match seg {
            Segment::Block(inner) => {
                if block_has_params(inner) {
                    saw_param = true;
                    if block_kept(inner, lookup)? {
                        return Ok(true);
                    }
                }
            }
            Segment::Text(_) => {}
            other => {
                saw_param = true;
                if let Some(v) = lookup_value(other, lookup)? {
                    if !v.is_empty() {
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(!saw_param)
}

fn block_has_params(segments: &[Segment]) -> bool {
    segments.iter().any(|seg| match seg {
        Segment::Text(_) => false,
        Segment::Block(inner) => block_has_params(inner),
        _ => true,
    })
}

fn bind_segments(
    segments: &[Segment],
    lookup: &dyn ParamLookup,
    sql: &mut String,
    params: &mut Vec<CellValue>,
    dropped: &mut bool,
) -> Result<()> {
    for seg in segments {
        match seg {
            Segment::Text(t) => sql.push_str(t),
            Segment::Block(inner) => {
                if block_kept(inner, lookup)? {
                    bind_segments(inner, lookup, sql, params, dropped)?;
                } else {
                    *dropped = true;
                    sql.push(' ');
                }
            }
            param => {
                let value = lookup_value(param, lookup)?.unwrap_or_default();
                match value {
                    // `in (:ids)` with an array binds one placeholder per element
                    CellValue::Array(items) if !items.is_empty() => {
                        let marks = vec!["?"; items.len()].join(", ");
                        sql.push_str(&marks);
                        params.extend(items);
                    }
                    CellValue::Array(_) => {
                        sql.push('?');
                        params.push(CellValue::Null);
                    }
                    v => {
                        sql.push('?');
                        params.push(v);
                    }
                }
            }
        }
    }
    Ok(())
}

fn tidy_regexes() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)\bwhere\s+(and|or)\b", "where"),
            (r"(?i)\(\s*(and|or)\b", "("),
            (r"(?i)\b(and|or)\s*\)", ")"),
            (
                r"(?i)\bwhere\s+(order\s+by|group\s+by|having|limit|union|offset|fetch|for\s+update)\b",
                "$1",
            ),
            (r"(?i)\bwhere\s*\)", ")"),
            (r"[ \t]{2,}", " "),
        ]
        .into_iter()
        .filter_map(|(pattern, rep)| Regex::new(pattern).ok().map(|re| (re, rep)))
        .collect()
    })
}

/// Remove connectives left dangling after optional blocks were dropped.
/// Quoted literals and comments are left as written.
fn tidy_conditions(sql: &str) -> String {
    static TRAILING: OnceLock<Option<Regex>> = OnceLock::new();
    let parts = split_quoted(sql);
    let last = parts.len().saturating_sub(1);
    let mut out = String::with_capacity(sql.len());
    for (i, (quoted, part)) in parts.into_iter().enumerate() {
        if quoted {
            out.push_str(&part);
            continue;
        }
        let mut part = part;
        for (re, rep) in tidy_regexes() {
            part = re.replace_all(&part, *rep).into_owned();
        }
        if i == last {
            if let Some(re) = cached_regex(&TRAILING, r"(?i)\b(where|and|or)\s*$") {
                part = re.replace(&part, "").into_owned();
            }
        }
        out.push_str(&part);
    }
    out.trim_end().to_string()
}

/// Compile a constant pattern once. `None` only if the pattern is invalid,
/// which callers treat as "no match".
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Split SQL into quoted and unquoted runs; `true` marks a quoted run.
/// Comments count as quoted so rewriting never touches them.
pub(crate) fn split_quoted(sql: &str) -> Vec<(bool, String)> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out: Vec<(bool, String)> = Vec::new();
    let mut plain = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let end = match c {
            '\'' | '"' | '`' => Some(scan_quoted(&chars, i).unwrap_or(chars.len())),
            '-' if next == Some('-') => Some(
                chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map(|p| i + p)
                    .unwrap_or(chars.len()),
            ),
            '/' if next == Some('*') => {
                Some(find_comment_end(&chars, i + 2).unwrap_or(chars.len()))
            }
            _ => None,
        };
        match end {
            Some(end) => {
                if !plain.is_empty() {
                    out.push((false, std::mem::take(&mut plain)));
                }
                out.push((true, chars[i..end].iter().collect()));
                i = end;
            }
            None => {
                plain.push(c);
                i += 1;
            }
        }
    }
    if !plain.is_empty() {
        out.push((false, plain));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Values(HashMap<String, CellValue>);

    impl ParamLookup for Values {
        fn named(&self, name: &str) -> CellValue {
            self.0.get(name).cloned().unwrap_or_default()
        }
        fn positional(&self, index: usize) -> Option<CellValue> {
            self.0.get(&index.to_string()).cloned()
        }
    }

    fn values(pairs: &[(&str, CellValue)]) -> Values {
        Values(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_named_params_in_order() {
        let t = SqlTemplate::parse("select * from staff where dept = :dept and status = :status or dept = :dept")
            .unwrap();
        assert_eq!(t.param_names(), &["dept".to_string(), "status".to_string()]);
        assert_eq!(t.placeholder_count(), 3);
        assert_eq!(
            t.canonical_sql(),
            "select * from staff where dept = ? and status = ? or dept = ?"
        );
    }

    #[test]
    fn test_quotes_casts_and_comments_are_not_params() {
        let t = SqlTemplate::parse(
            "select created::date, ':skip' from t -- :also\nwhere id = :id /* :no */",
        )
        .unwrap();
        assert_eq!(t.param_names(), &["id".to_string()]);
        assert!(t.canonical_sql().contains("created::date"));
        assert!(t.canonical_sql().contains("':skip'"));
    }

    #[test]
    fn test_mixed_params_rejected() {
        let err = SqlTemplate::parse("select * from t where a = :a and b = ?").unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::ConfigParse(_)));
    }

    #[test]
    fn test_unterminated_block_rejected() {
        assert!(SqlTemplate::parse("select * from t where 1=1 #[and a = :a").is_err());
        assert!(SqlTemplate::parse("select 'open from t").is_err());
    }

    #[test]
    fn test_declared_names_must_match() {
        let declared = vec!["dept".to_string()];
        assert!(SqlTemplate::parse_declared("select * from t where dept = :dept", Some(declared.as_slice())).is_ok());
        let wrong = vec!["dept".to_string(), "extra".to_string()];
        assert!(SqlTemplate::parse_declared("select * from t where dept = :dept", Some(wrong.as_slice())).is_err());
    }

    #[test]
    fn test_declared_names_label_positionals() {
        let declared = vec!["name".to_string(), "id".to_string()];
        let t = SqlTemplate::parse_declared("update t set name = ? where id = ?", Some(declared.as_slice()))
            .unwrap();
        assert_eq!(t.param_names(), &["name".to_string(), "id".to_string()]);
        let bound = t
            .bind(&values(&[("id", 5.into()), ("name", "x".into())]))
            .unwrap();
        assert_eq!(bound.params, vec![CellValue::from("x"), CellValue::Int32(5)]);
    }

    #[test]
    fn test_empty_block_dropped_and_where_tidied() {
        let t = SqlTemplate::parse(
            "select * from staff where #[dept = :dept] #[and status = :status] order by id",
        )
        .unwrap();
        let bound = t.bind(&values(&[])).unwrap();
        assert_eq!(bound.sql, "select * from staff order by id");
        assert!(bound.params.is_empty());

        let bound = t.bind(&values(&[("status", 1.into())])).unwrap();
        assert_eq!(bound.sql, "select * from staff where status = ? order by id");
        assert_eq!(bound.params, vec![CellValue::Int32(1)]);
    }

    #[test]
    fn test_tidy_leaves_literals_alone() {
        let t = SqlTemplate::parse(
            "select * from staff where #[status = :status] and note <> 'where and' order by id",
        )
        .unwrap();
        let bound = t.bind(&values(&[])).unwrap();
        assert_eq!(
            bound.sql,
            "select * from staff where note <> 'where and' order by id"
        );
        let t = SqlTemplate::parse("select * from staff where name = 'a  or' #[and dept = :dept]").unwrap();
        assert_eq!(
            t.bind(&values(&[])).unwrap().sql,
            "select * from staff where name = 'a  or'"
        );
    }

    #[test]
    fn test_nested_block_and_array_brackets() {
        let t = SqlTemplate::parse(
            "select tags[1] from t where 1=1 #[and (a = :a #[or b = :b]) and arr[2] = 0]",
        )
        .unwrap();
        let bound = t.bind(&values(&[("b", "x".into())])).unwrap();
        assert!(bound.sql.contains("and (a = ? or b = ?) and arr[2] = 0"));
        assert_eq!(bound.params, vec![CellValue::Null, CellValue::from("x")]);

        let bound = t.bind(&values(&[("a", "y".into())])).unwrap();
        assert!(bound.sql.contains("(a = ? )"));
        assert_eq!(bound.params.len(), 1);
    }

    #[test]
    fn test_array_expands_in_list() {
        let t = SqlTemplate::parse("select * from t where id in (:ids)").unwrap();
        let bound = t
            .bind(&values(&[("ids", CellValue::from(vec![1, 2, 3]))]))
            .unwrap();
        assert_eq!(bound.sql, "select * from t where id in (?, ?, ?)");
        assert_eq!(bound.params.len(), 3);

        let bound = t
            .bind(&values(&[("ids", CellValue::Array(vec![]))]))
            .unwrap();
        assert_eq!(bound.sql, "select * from t where id in (?)");
        assert_eq!(bound.params, vec![CellValue::Null]);
    }

    #[test]
    fn test_missing_positional_value() {
        let t = SqlTemplate::parse("select * from t where a = ? and b = ?").unwrap();
        let err = t.bind(&values(&[("0", 1.into())])).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::ParameterBinding(_)));
    }

    #[test]
    fn test_split_quoted() {
        let parts = split_quoted("select 'a''b' from t where x = 1");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], (true, "'a''b'".to_string()));
        assert!(!parts[2].0);
    }
}
