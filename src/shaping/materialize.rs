use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::translate::{log_misses, translate_value};
use super::{DataSet, ShapeEnv};
use crate::cache::TranslationCache;
use crate::config::{ConfigSource, Translate};
use crate::entity::{normalize_name, Entity, EntityDescriptor, Record};
use crate::error::{EngineError, Result};
use crate::exec::ExecutionContext;
use crate::value::{CellValue, ColumnInfo};

/// Dynamic row keyed by (optionally camel-cased) label, in label order.
pub type RowMap = serde_json::Map<String, Value>;

/// How result labels map onto the serde names of a non-entity row type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelStyle {
    /// `STAFF_NAME` -> `staff_name`
    #[default]
    Snake,
    /// `STAFF_NAME` -> `staffName`
    Hump,
    /// Labels are used as they come.
    Keep,
}

/// A type result rows can be deserialized into. Every [`Entity`] is one,
/// mapped through its registered column/attribute table.
pub trait RowModel: DeserializeOwned + Send {
    fn entity_type() -> Option<&'static str> {
        None
    }

    fn label_style() -> LabelStyle {
        LabelStyle::Snake
    }

    /// Translations filling attributes the query left empty.
    fn translations() -> Vec<Translate> {
        Vec::new()
    }
}

impl<E: Entity> RowModel for E {
    fn entity_type() -> Option<&'static str> {
        Some(E::TYPE_NAME)
    }
}

/// `STAFF_NAME` / `staff_name` -> `staffName`. Labels without underscores
/// that already contain lowercase letters are kept.
pub fn to_hump(label: &str) -> String {
    if !label.contains('_') && label.chars().any(char::is_lowercase) {
        return label.to_string();
    }
    let mut out = String::with_capacity(label.len());
    let mut upper_next = false;
    for c in label.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

fn styled(label: &str, style: LabelStyle) -> String {
    match style {
        LabelStyle::Snake => label.to_lowercase(),
        LabelStyle::Hump => to_hump(label),
        LabelStyle::Keep => label.to_string(),
    }
}

pub fn to_maps(data: &DataSet, hump: bool) -> Vec<RowMap> {
    let keys: Vec<String> = data
        .labels
        .iter()
        .map(|l| if hump { to_hump(l) } else { l.clone() })
        .collect();
    data.rows
        .iter()
        .map(|row| {
            keys.iter()
                .cloned()
                .zip(row.iter().map(CellValue::to_json))
                .collect()
        })
        .collect()
}

fn find_key(map: &RowMap, name: &str) -> Option<String> {
    let wanted = normalize_name(name);
    map.keys().find(|k| normalize_name(k) == wanted).cloned()
}

/// Translate attributes of JSON objects in place. With `only_unset`,
/// attributes already holding a value are left alone.
pub fn translate_objects(
    objects: &mut [RowMap],
    translates: &[Translate],
    caches: Option<&dyn TranslationCache>,
    only_unset: bool,
    ctx: &mut ExecutionContext,
) {
    let Some(caches) = caches else {
        if !translates.is_empty() {
            ctx.log("translations declared but no translation cache is configured");
        }
        return;
    };
    for t in translates {
        let Some(snapshot) = caches.snapshot(&t.cache, t.cache_type.as_deref()) else {
            ctx.log(format!("translate cache `{}` does not exist", t.cache));
            continue;
        };
        let mut missed = BTreeSet::new();
        for obj in objects.iter_mut() {
            let target = find_key(obj, &t.column).unwrap_or_else(|| t.column.clone());
            if only_unset && obj.get(&target).is_some_and(|v| !v.is_null()) {
                continue;
            }
            let Some(source) = find_key(obj, t.source_column()) else {
                continue;
            };
            let key = CellValue::from_json(&obj[&source]);
            let value = translate_value(&key, &snapshot, t, &mut missed);
            obj.insert(target, value.to_json());
        }
        log_misses(t, &missed, ctx);
    }
}

/// Entity records to `E`, filling attributes the rows left empty from the
/// descriptor's translations.
pub fn records_to_models<E: Entity>(
    records: &[Record],
    desc: &EntityDescriptor,
    source: &dyn ConfigSource,
    env: &ShapeEnv<'_>,
    ctx: &mut ExecutionContext,
) -> Result<Vec<E>> {
    let mut objects = records
        .iter()
        .map(|r| object_of(r, desc, source))
        .collect::<Result<Vec<_>>>()?;
    if !desc.translates.is_empty() {
        translate_objects(&mut objects, &desc.translates, env.caches, true, ctx);
    }
    objects.into_iter().map(from_object).collect()
}

fn object_of(record: &Record, desc: &EntityDescriptor, source: &dyn ConfigSource) -> Result<RowMap> {
    match record.to_json(desc, source)? {
        Value::Object(map) => Ok(map),
        _ => Err(EngineError::mapping("entity row did not map to an object")),
    }
}

fn from_object<T: DeserializeOwned>(obj: RowMap) -> Result<T> {
    serde_json::from_value(Value::Object(obj))
        .map_err(|e| EngineError::mapping(format!("cannot map row: {}", e)))
}

/// Deserialize shaped rows into `T`. Refused once a stage changed the
/// column layout.
pub fn to_models<T: RowModel>(
    data: DataSet,
    source: &dyn ConfigSource,
    env: &ShapeEnv<'_>,
    ctx: &mut ExecutionContext,
) -> Result<Vec<T>> {
    if data.shape_changed {
        tracing::warn!(
            uid = ctx.uid(),
            "column layout changed by pivot/unpivot/chain; only rows or maps can be returned"
        );
        ctx.log("typed mapping refused after a column-changing stage");
        return Err(EngineError::mapping(
            "result columns were reshaped; request rows or maps instead of a typed record",
        ));
    }
    let mut translates = T::translations();
    let mut objects: Vec<RowMap> = match T::entity_type() {
        Some(type_name) => {
            let desc = source
                .entity(type_name)
                .ok_or_else(|| EngineError::config_not_found(type_name))?;
            translates.extend(desc.translates.iter().cloned());
            let columns: Vec<ColumnInfo> = data
                .labels
                .iter()
                .map(|l| ColumnInfo::new(l.clone(), ""))
                .collect();
            data.rows
                .into_iter()
                .map(|row| object_of(&Record::from_row(&columns, row, &desc), &desc, source))
                .collect::<Result<Vec<_>>>()?
        }
        None => {
            let keys: Vec<String> = data
                .labels
                .iter()
                .map(|l| styled(l, T::label_style()))
                .collect();
            data.rows
                .into_iter()
                .map(|row| {
                    keys.iter()
                        .cloned()
                        .zip(row.iter().map(CellValue::to_json))
                        .collect()
                })
                .collect()
        }
    };
    if !translates.is_empty() {
        translate_objects(&mut objects, &translates, env.caches, true, ctx);
    }
    objects.into_iter().map(from_object).collect()
}
