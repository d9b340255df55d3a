use serde_json::{Map, Value};

use super::{CascadeKind, Entity, EntityDescriptor};
use crate::config::ConfigSource;
use crate::error::{EngineError, Result};
use crate::value::{CellValue, ColumnInfo};

/// Case-insensitive, underscore-blind form used for every attribute match.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Attribute values of one entity instance plus its cascade children.
///
/// Children are present only for cascade properties that were supplied;
/// an absent property means "leave stored children alone" while an empty
/// list means "the child set is now empty".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(String, CellValue)>,
    children: Vec<(String, Vec<Record>)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: &str, value: impl Into<CellValue>) -> Self {
        self.set(attribute, value.into());
        self
    }

    pub fn set(&mut self, attribute: &str, value: CellValue) {
        let wanted = normalize_name(attribute);
        match self
            .values
            .iter_mut()
            .find(|(name, _)| normalize_name(name) == wanted)
        {
            Some(slot) => slot.1 = value,
            None => self.values.push((attribute.to_string(), value)),
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&CellValue> {
        let wanted = normalize_name(attribute);
        self.values
            .iter()
            .find(|(name, _)| normalize_name(name) == wanted)
            .map(|(_, v)| v)
    }

    /// Value of an attribute, `Null` when absent.
    pub fn value(&self, attribute: &str) -> CellValue {
        self.get(attribute).cloned().unwrap_or_default()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn with_children(mut self, property: &str, children: Vec<Record>) -> Self {
        self.set_children(property, children);
        self
    }

    pub fn set_children(&mut self, property: &str, children: Vec<Record>) {
        let wanted = normalize_name(property);
        match self
            .children
            .iter_mut()
            .find(|(name, _)| normalize_name(name) == wanted)
        {
            Some(slot) => slot.1 = children,
            None => self.children.push((property.to_string(), children)),
        }
    }

    pub fn children(&self, property: &str) -> Option<&[Record]> {
        let wanted = normalize_name(property);
        self.children
            .iter()
            .find(|(name, _)| normalize_name(name) == wanted)
            .map(|(_, c)| c.as_slice())
    }

    pub fn children_mut(&mut self, property: &str) -> Option<&mut Vec<Record>> {
        let wanted = normalize_name(property);
        self.children
            .iter_mut()
            .find(|(name, _)| normalize_name(name) == wanted)
            .map(|(_, c)| c)
    }

    pub fn key_values(&self, desc: &EntityDescriptor) -> Vec<CellValue> {
        desc.key_fields()
            .iter()
            .map(|f| self.value(&f.attribute))
            .collect()
    }

    pub fn has_key(&self, desc: &EntityDescriptor) -> bool {
        self.key_values(desc).iter().all(|v| !v.is_null())
    }

    /// Values for the given attributes, in order.
    pub fn values_of(&self, attributes: &[String]) -> Vec<CellValue> {
        attributes.iter().map(|a| self.value(a)).collect()
    }

    pub fn from_json(
        value: &Value,
        desc: &EntityDescriptor,
        source: &dyn ConfigSource,
    ) -> Result<Record> {
        let obj = value.as_object().ok_or_else(|| {
            EngineError::mapping(format!("`{}` did not serialize to an object", desc.type_name))
        })?;
        let mut record = Record::new();
        for (key, v) in obj {
            if let Some(field) = desc.field(key) {
                let cell = CellValue::from_json(v).coerce(field.column_type);
                record.values.push((field.attribute.clone(), cell));
                continue;
            }
            let Some(cascade) = desc.cascade(key) else {
                continue;
            };
            let child_desc = source
                .entity(&cascade.child_type)
                .ok_or_else(|| EngineError::config_not_found(cascade.child_type.clone()))?;
            let children = match v {
                Value::Null => continue,
                Value::Array(items) => items
                    .iter()
                    .map(|item| Record::from_json(item, &child_desc, source))
                    .collect::<Result<Vec<_>>>()?,
                other => vec![Record::from_json(other, &child_desc, source)?],
            };
            record.children.push((cascade.property.clone(), children));
        }
        Ok(record)
    }

    pub fn to_json(&self, desc: &EntityDescriptor, source: &dyn ConfigSource) -> Result<Value> {
        let mut obj = Map::new();
        for field in &desc.fields {
            obj.insert(field.attribute.clone(), self.value(&field.attribute).to_json());
        }
        for cascade in &desc.cascades {
            let child_desc = source
                .entity(&cascade.child_type)
                .ok_or_else(|| EngineError::config_not_found(cascade.child_type.clone()))?;
            let children = self.children(&cascade.property).unwrap_or(&[]);
            let json = match cascade.kind {
                CascadeKind::OneToMany => Value::Array(
                    children
                        .iter()
                        .map(|c| c.to_json(&child_desc, source))
                        .collect::<Result<Vec<_>>>()?,
                ),
                CascadeKind::OneToOne => match children.first() {
                    Some(child) => child.to_json(&child_desc, source)?,
                    None => Value::Null,
                },
            };
            obj.insert(cascade.property.clone(), json);
        }
        Ok(Value::Object(obj))
    }

    pub fn from_entity<E: Entity>(
        entity: &E,
        desc: &EntityDescriptor,
        source: &dyn ConfigSource,
    ) -> Result<Record> {
        let json = serde_json::to_value(entity).map_err(|e| {
            EngineError::mapping(format!("cannot serialize `{}`: {}", desc.type_name, e))
        })?;
        Record::from_json(&json, desc, source)
    }

    pub fn into_entity<E: Entity>(
        &self,
        desc: &EntityDescriptor,
        source: &dyn ConfigSource,
    ) -> Result<E> {
        let json = self.to_json(desc, source)?;
        serde_json::from_value(json).map_err(|e| {
            EngineError::mapping(format!("cannot build `{}` from row: {}", desc.type_name, e))
        })
    }

    /// Map a result row onto entity attributes by column name. Labels that
    /// match no field are ignored.
    pub fn from_row(columns: &[ColumnInfo], row: Vec<CellValue>, desc: &EntityDescriptor) -> Record {
        let mut record = Record::new();
        for (col, value) in columns.iter().zip(row) {
            if let Some(field) = desc.field_for_label(&col.name) {
                record.values.push((field.attribute.clone(), value));
            }
        }
        record
    }
}
