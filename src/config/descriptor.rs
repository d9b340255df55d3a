use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::template::SqlTemplate;
use crate::sharding::ShardingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlKind {
    #[default]
    Search,
    Update,
}

/// Replace a key column with the name cached under that key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translate {
    /// Result label (or typed attribute) that receives the translated name.
    pub column: String,
    /// Label holding the key. Defaults to `column` (translate in place).
    #[serde(default)]
    pub key_column: Option<String>,
    pub cache: String,
    #[serde(default)]
    pub cache_type: Option<String>,
    /// Index of the name inside the cached row; index 0 is the key itself.
    #[serde(default = "default_cache_index")]
    pub index: usize,
    /// Split a multi-key value on this separator and translate each part.
    #[serde(default)]
    pub split: Option<String>,
    #[serde(default = "default_link_sign")]
    pub link_sign: String,
    /// Output for keys missing from the cache; `${value}` is the raw key.
    #[serde(default)]
    pub uncached: Option<String>,
    /// Lookup key template; `{}` is replaced with the raw key.
    #[serde(default)]
    pub key_template: Option<String>,
}

fn default_cache_index() -> usize {
    1
}

fn default_link_sign() -> String {
    String::from(",")
}

impl Translate {
    pub fn new(column: impl Into<String>, cache: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            key_column: None,
            cache: cache.into(),
            cache_type: None,
            index: default_cache_index(),
            split: None,
            link_sign: default_link_sign(),
            uncached: None,
            key_template: None,
        }
    }

    pub fn key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = Some(column.into());
        self
    }

    pub fn cache_type(mut self, cache_type: impl Into<String>) -> Self {
        self.cache_type = Some(cache_type.into());
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn split(mut self, split: impl Into<String>) -> Self {
        self.split = Some(split.into());
        self
    }

    pub fn uncached(mut self, template: impl Into<String>) -> Self {
        self.uncached = Some(template.into());
        self
    }

    pub fn source_column(&self) -> &str {
        self.key_column.as_deref().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    /// Content first, fill appended.
    #[default]
    Left,
    /// Fill first, content last.
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decorate {
    pub fill: char,
    pub size: usize,
    #[serde(default)]
    pub align: Align,
}

/// Collapse consecutive rows sharing an identity into one row, joining the
/// linked columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub columns: Vec<String>,
    /// Identity columns. Empty means the whole result is one group.
    #[serde(default)]
    pub id_columns: Vec<String>,
    #[serde(default = "default_link_sign")]
    pub sign: String,
    #[serde(default)]
    pub distinct: bool,
    #[serde(default)]
    pub decorate: Option<Decorate>,
}

impl Link {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            id_columns: Vec::new(),
            sign: default_link_sign(),
            distinct: false,
            decorate: None,
        }
    }

    pub fn id_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.id_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sign(mut self, sign: impl Into<String>) -> Self {
        self.sign = sign.into();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

/// Rows to columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    pub category_columns: Vec<String>,
    #[serde(default)]
    pub group_columns: Vec<String>,
    /// First and last value column (inclusive) spread under each category.
    pub start_column: String,
    #[serde(default)]
    pub end_column: Option<String>,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    /// Fixed category list; each entry holds one value per category column.
    #[serde(default)]
    pub categories: Option<Vec<Vec<String>>>,
}

/// Columns to rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unpivot {
    pub columns: Vec<String>,
    /// Label written for each exploded column; defaults to the column name.
    #[serde(default)]
    pub labels: Vec<String>,
    pub label_column: String,
    pub value_column: String,
}

fn default_multiply() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

/// Ratio of each row to the previous row in its group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsChain {
    pub columns: Vec<String>,
    #[serde(default)]
    pub group_column: Option<String>,
    /// Compare with the next row instead of the previous one.
    #[serde(default)]
    pub reverse: bool,
    #[serde(default = "default_multiply")]
    pub multiply: f64,
    /// Add a `<column>_ratio` column instead of overwriting the source value.
    #[serde(default = "default_true")]
    pub insert: bool,
}

/// Ratio of each period group of columns to the previous group in the same
/// row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColsChain {
    pub start_column: String,
    pub group_size: usize,
    /// Column inside each group the ratio is computed on.
    #[serde(default)]
    pub relative_index: usize,
    #[serde(default = "default_multiply")]
    pub multiply: f64,
    #[serde(default = "default_true")]
    pub insert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChainRelative {
    Rows(RowsChain),
    Cols(ColsChain),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    Name,
    Mobile,
    Tel,
    Email,
    IdCard,
    BankCard,
    Address,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureMask {
    pub column: String,
    pub kind: MaskKind,
    /// Visible leading characters for `custom` masks.
    #[serde(default)]
    pub head: Option<usize>,
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub mask_code: Option<char>,
}

impl SecureMask {
    pub fn new(column: impl Into<String>, kind: MaskKind) -> Self {
        Self {
            column: column.into(),
            kind,
            head: None,
            tail: None,
            mask_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Date,
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    #[default]
    HalfUp,
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub column: String,
    pub kind: FormatKind,
    pub pattern: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub rounding: Rounding,
}

impl Format {
    pub fn date(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            kind: FormatKind::Date,
            pattern: pattern.into(),
            locale: None,
            rounding: Rounding::default(),
        }
    }

    pub fn number(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            kind: FormatKind::Number,
            ..Self::date(column, pattern)
        }
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Document-store statement. Carried through the catalog so it can be
/// inspected, but relational execution refuses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoSqlDescriptor {
    pub collection: String,
    pub query: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Everything the shaping pipeline applies after extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapingDirectives {
    pub decrypt_columns: Vec<String>,
    pub translates: Vec<Translate>,
    pub link: Option<Link>,
    pub pivot: Option<Pivot>,
    pub unpivot: Option<Unpivot>,
    pub chain: Vec<ChainRelative>,
    pub masks: Vec<SecureMask>,
    pub formats: Vec<Format>,
}

impl ShapingDirectives {
    pub fn is_empty(&self) -> bool {
        *self == ShapingDirectives::default()
    }

    /// Overlay per-request directives. A request entry replaces the
    /// configured entry for the same column.
    pub fn merged(&self, overlay: &ShapingDirectives) -> ShapingDirectives {
        let mut out = self.clone();
        for t in &overlay.translates {
            out.translates
                .retain(|e| !e.column.eq_ignore_ascii_case(&t.column));
            out.translates.push(t.clone());
        }
        for m in &overlay.masks {
            out.masks.retain(|e| !e.column.eq_ignore_ascii_case(&m.column));
            out.masks.push(m.clone());
        }
        for f in &overlay.formats {
            out.formats
                .retain(|e| !e.column.eq_ignore_ascii_case(&f.column));
            out.formats.push(f.clone());
        }
        for c in &overlay.decrypt_columns {
            if !out.decrypt_columns.iter().any(|e| e.eq_ignore_ascii_case(c)) {
                out.decrypt_columns.push(c.clone());
            }
        }
        if overlay.link.is_some() {
            out.link = overlay.link.clone();
        }
        if overlay.pivot.is_some() {
            out.pivot = overlay.pivot.clone();
        }
        if overlay.unpivot.is_some() {
            out.unpivot = overlay.unpivot.clone();
        }
        out.chain.extend(overlay.chain.iter().cloned());
        out
    }
}

/// A statement as written in the catalog, before dialect selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStatement {
    pub id: String,
    #[serde(default)]
    pub kind: SqlKind,
    /// Dialect-neutral text used when no dialect branch matches.
    #[serde(default)]
    pub sql: Option<String>,
    /// Per-dialect text keyed by dialect name.
    #[serde(default)]
    pub dialect_sql: BTreeMap<String, String>,
    #[serde(default)]
    pub count_sql: Option<String>,
    /// Declared parameter names, checked against the placeholders found.
    #[serde(default)]
    pub params: Option<Vec<String>>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub decrypt: Vec<String>,
    #[serde(default)]
    pub translate: Vec<Translate>,
    #[serde(default)]
    pub link: Option<Link>,
    #[serde(default)]
    pub pivot: Option<Pivot>,
    #[serde(default)]
    pub unpivot: Option<Unpivot>,
    #[serde(default)]
    pub chain: Vec<ChainRelative>,
    #[serde(default)]
    pub mask: Vec<SecureMask>,
    #[serde(default)]
    pub format: Vec<Format>,
    #[serde(default)]
    pub sharding: Option<ShardingConfig>,
    #[serde(default)]
    pub nosql: Option<NoSqlDescriptor>,
    /// Drop rows whose every cell is null or blank.
    #[serde(default)]
    pub ignore_empty_rows: bool,
}

impl RawStatement {
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sql: Some(sql.into()),
            ..Default::default()
        }
    }

    pub fn directives(&self) -> ShapingDirectives {
        ShapingDirectives {
            decrypt_columns: self.decrypt.clone(),
            translates: self.translate.clone(),
            link: self.link.clone(),
            pivot: self.pivot.clone(),
            unpivot: self.unpivot.clone(),
            chain: self.chain.clone(),
            masks: self.mask.clone(),
            formats: self.format.clone(),
        }
    }
}

/// A statement resolved for one dialect. Immutable once built and shared
/// between concurrent executions.
#[derive(Debug, Clone)]
pub struct StatementDescriptor {
    pub id: String,
    pub dialect: String,
    pub kind: SqlKind,
    pub template: SqlTemplate,
    pub count_template: Option<SqlTemplate>,
    pub data_source: Option<String>,
    pub shaping: ShapingDirectives,
    pub sharding: Option<ShardingConfig>,
    pub nosql: Option<NoSqlDescriptor>,
    pub ignore_empty_rows: bool,
}

impl StatementDescriptor {
    /// Canonical SQL with every optional block kept and `?` placeholders.
    pub fn sql(&self) -> String {
        self.template.canonical_sql()
    }

    pub fn param_names(&self) -> &[String] {
        self.template.param_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_statement_from_toml() {
        let raw: RawStatement = toml::from_str(
            r#"
id = "qStaff"
sql = "select * from staff where dept = :dept"
dialect_sql = { mysql = "select * from staff where dept = :dept limit 100" }
ignore_empty_rows = true

[[translate]]
column = "dept_name"
key_column = "dept"
cache = "deptCache"

[[chain]]
kind = "rows"
columns = ["amount"]

[[mask]]
column = "tel"
kind = "mobile"
"#,
        )
        .unwrap();
        assert_eq!(raw.id, "qStaff");
        assert_eq!(raw.kind, SqlKind::Search);
        assert!(raw.dialect_sql.contains_key("mysql"));
        assert_eq!(raw.translate[0].index, 1);
        assert_eq!(raw.translate[0].source_column(), "dept");
        assert!(matches!(&raw.chain[0], ChainRelative::Rows(r) if r.insert && r.multiply == 100.0));
        assert_eq!(raw.mask[0].kind, MaskKind::Mobile);
        assert!(raw.ignore_empty_rows);
    }

    #[test]
    fn test_merge_overrides_same_column() {
        let base = ShapingDirectives {
            translates: vec![Translate::new("dept", "deptCache")],
            ..Default::default()
        };
        let overlay = ShapingDirectives {
            translates: vec![
                Translate::new("DEPT", "orgCache"),
                Translate::new("sex", "dict").cache_type("SEX"),
            ],
            ..Default::default()
        };
        let merged = base.merged(&overlay);
        assert_eq!(merged.translates.len(), 2);
        assert_eq!(merged.translates[0].cache, "orgCache");
        assert!(!merged.is_empty());
        assert!(ShapingDirectives::default().is_empty());
    }
}
