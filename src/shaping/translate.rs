use std::collections::BTreeSet;

use super::DataSet;
use crate::cache::{CacheSnapshot, TranslationCache};
use crate::config::Translate;
use crate::exec::ExecutionContext;
use crate::value::CellValue;

/// Outcome of translating one key.
enum Lookup {
    Hit(CellValue),
    Miss(String),
}

/// Translate one key against a snapshot. The key template is applied to
/// the lookup key only; the uncached template sees the raw key.
fn lookup_one(snapshot: &CacheSnapshot, t: &Translate, raw: &str) -> Lookup {
    let key = match &t.key_template {
        Some(template) => template.replace("{}", raw),
        None => raw.to_string(),
    };
    match snapshot.get(&key).and_then(|row| row.get(t.index)) {
        Some(value) => Lookup::Hit(value.clone()),
        None => match &t.uncached {
            Some(template) => Lookup::Hit(CellValue::Text(template.replace("${value}", raw))),
            None => Lookup::Miss(raw.to_string()),
        },
    }
}

/// Translate a cell. Misses without an uncached template keep the raw
/// value and are collected into `missed`.
pub fn translate_value(
    value: &CellValue,
    snapshot: &CacheSnapshot,
    t: &Translate,
    missed: &mut BTreeSet<String>,
) -> CellValue {
    if value.is_null() {
        return CellValue::Null;
    }
    let raw = value.display();
    let Some(split) = &t.split else {
        return match lookup_one(snapshot, t, &raw) {
            Lookup::Hit(v) => v,
            Lookup::Miss(key) => {
                missed.insert(key);
                value.clone()
            }
        };
    };
    let parts: Vec<String> = if split.trim().is_empty() {
        raw.split_whitespace().map(str::to_string).collect()
    } else {
        raw.split(split.trim()).map(|p| p.trim().to_string()).collect()
    };
    let translated: Vec<String> = parts
        .iter()
        .map(|part| match lookup_one(snapshot, t, part) {
            Lookup::Hit(v) => match v {
                CellValue::Null => String::new(),
                other => other.display(),
            },
            Lookup::Miss(key) => {
                missed.insert(key.clone());
                key
            }
        })
        .collect();
    CellValue::Text(translated.join(&t.link_sign))
}

pub fn log_misses(t: &Translate, missed: &BTreeSet<String>, ctx: &mut ExecutionContext) {
    if missed.is_empty() {
        return;
    }
    let keys: Vec<&str> = missed.iter().map(String::as_str).collect();
    tracing::warn!(
        cache = %t.cache,
        cache_type = t.cache_type.as_deref().unwrap_or(""),
        "no cached value for key(s) {}",
        keys.join(",")
    );
    ctx.log(format!(
        "translate cache `{}` has no value for key(s) {}",
        t.cache,
        keys.join(",")
    ));
}

/// Apply one translate directive. The target column is appended when the
/// translation writes to a new label.
pub fn apply(
    data: &mut DataSet,
    t: &Translate,
    caches: Option<&dyn TranslationCache>,
    ctx: &mut ExecutionContext,
) {
    let Some(source) = data.column_index(t.source_column()) else {
        ctx.log(format!(
            "translate source column `{}` is not in the result",
            t.source_column()
        ));
        return;
    };
    let target = data.ensure_column(&t.column);
    let snapshot = caches.and_then(|c| c.snapshot(&t.cache, t.cache_type.as_deref()));
    let Some(snapshot) = snapshot else {
        ctx.log(format!("translate cache `{}` does not exist", t.cache));
        if target != source {
            for row in &mut data.rows {
                row[target] = row[source].clone();
            }
        }
        return;
    };
    let mut missed = BTreeSet::new();
    for row in &mut data.rows {
        row[target] = translate_value(&row[source], &snapshot, t, &mut missed);
    }
    log_misses(t, &missed, ctx);
}
