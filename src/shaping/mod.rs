//! Post-query shaping.
//!
//! Stages run in a fixed order over a [`DataSet`]: decrypt, translate,
//! link, pivot, unpivot, chain-relative, mask, format. Each stage is a
//! no-op when its directive is absent. Materialization into maps, raw rows
//! or typed records happens afterwards in [`materialize`].

pub mod chain;
pub mod format;
pub mod link;
pub mod mask;
pub mod materialize;
pub mod pivot;
pub mod translate;

use crate::cache::TranslationCache;
use crate::config::ShapingDirectives;
use crate::entity::normalize_name;
use crate::error::Result;
use crate::exec::{ExecutionContext, RawResult};
use crate::secure::{Desensitizer, FieldDecryptor};
use crate::value::CellValue;

pub use materialize::{to_hump, LabelStyle, RowMap, RowModel};

/// Labels and rows being shaped. Every row has `labels.len()` cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    pub labels: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Set by stages that change the column layout (pivot, unpivot,
    /// chain-relative). Typed materialization is refused afterwards.
    pub shape_changed: bool,
}

impl DataSet {
    pub fn new(labels: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            labels,
            rows,
            shape_changed: false,
        }
    }

    pub fn from_raw(raw: RawResult) -> Self {
        Self::new(raw.labels(), raw.rows)
    }

    /// Position of a label, matched case-insensitively and ignoring
    /// underscores. A purely numeric name is taken as a column index.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        if let Ok(idx) = name.trim().parse::<usize>() {
            return (idx < self.labels.len()).then_some(idx);
        }
        let wanted = normalize_name(name);
        self.labels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(name))
            .or_else(|| self.labels.iter().position(|l| normalize_name(l) == wanted))
    }

    /// Index of `name`, appending an all-null column when it is missing.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.labels.push(name.to_string());
        for row in &mut self.rows {
            row.push(CellValue::Null);
        }
        self.labels.len() - 1
    }

    pub fn width(&self) -> usize {
        self.labels.len()
    }

    pub fn is_consistent(&self) -> bool {
        self.rows.iter().all(|r| r.len() == self.labels.len())
    }
}

/// Collaborators consulted while shaping.
pub struct ShapeEnv<'a> {
    pub caches: Option<&'a dyn TranslationCache>,
    pub decryptor: Option<&'a dyn FieldDecryptor>,
    pub desensitizer: &'a dyn Desensitizer,
}

pub fn run_pipeline(
    data: &mut DataSet,
    directives: &ShapingDirectives,
    env: &ShapeEnv<'_>,
    ctx: &mut ExecutionContext,
) -> Result<()> {
    if directives.is_empty() || data.labels.is_empty() {
        return Ok(());
    }
    decrypt(data, &directives.decrypt_columns, env, ctx);
    for t in &directives.translates {
        translate::apply(data, t, env.caches, ctx);
    }
    if let Some(link) = &directives.link {
        link::apply(data, link, ctx)?;
    }
    if let Some(p) = &directives.pivot {
        pivot::pivot(data, p)?;
    }
    if let Some(u) = &directives.unpivot {
        pivot::unpivot(data, u)?;
    }
    for c in &directives.chain {
        chain::apply(data, c)?;
    }
    for m in &directives.masks {
        mask::apply(data, m, env.desensitizer);
    }
    for f in &directives.formats {
        format::apply(data, f, ctx);
    }
    debug_assert!(data.is_consistent());
    Ok(())
}

fn decrypt(data: &mut DataSet, columns: &[String], env: &ShapeEnv<'_>, ctx: &mut ExecutionContext) {
    if columns.is_empty() {
        return;
    }
    let Some(decryptor) = env.decryptor else {
        ctx.log("decrypt columns declared but no decryptor is configured");
        return;
    };
    for column in columns {
        let Some(idx) = data.column_index(column) else {
            continue;
        };
        let label = data.labels[idx].clone();
        for row in &mut data.rows {
            let CellValue::Text(cipher) = &row[idx] else {
                continue;
            };
            match decryptor.decrypt(&label, cipher) {
                Ok(plain) => row[idx] = CellValue::Text(plain),
                Err(e) => {
                    tracing::warn!(column = %label, "decrypt failed: {}", e);
                    ctx.log(format!("decrypt of `{}` failed: {}", label, e));
                }
            }
        }
    }
}
