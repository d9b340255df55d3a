//! Entity metadata: table, column/attribute map, keys, cascades and
//! sharding. Descriptors are registered once (catalog file or builder) and
//! indexed at registration so no per-call name probing is needed.

pub mod record;
pub mod sql;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Translate;
use crate::error::{EngineError, Result};
use crate::sharding::ShardingConfig;
use crate::value::ColumnType;

pub use record::{normalize_name, Record};

/// A serde type persisted through an [`EntityDescriptor`] registered under
/// `TYPE_NAME`. Serialized field names must equal the descriptor's
/// attribute names.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const TYPE_NAME: &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub attribute: String,
    pub column: String,
    #[serde(default)]
    pub column_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Caller supplies the key.
    #[default]
    Assigned,
    /// Database generates the key; the column is omitted on insert.
    Identity,
    /// Key taken from a database sequence inside the insert.
    Sequence { name: String },
    /// Key produced by the id generator before insert.
    Generator {
        #[serde(default)]
        length: usize,
        #[serde(default)]
        sequence_size: usize,
    },
}

/// Business identifier filled on save when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessIdConfig {
    pub field: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub related_fields: Vec<String>,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub sequence_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadeKind {
    OneToOne,
    #[default]
    OneToMany,
}

/// Value written to stale children instead of deleting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invalidate {
    pub field: String,
    pub value: serde_json::Value,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeModel {
    /// Attribute of the parent holding the child collection (or child).
    pub property: String,
    pub child_type: String,
    #[serde(default)]
    pub kind: CascadeKind,
    /// Child attributes receiving the parent's key values, in key order.
    pub mapped_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub delete: bool,
    #[serde(default = "default_true")]
    pub update: bool,
    #[serde(default)]
    pub invalidate: Option<Invalidate>,
    /// A supplied collection replaces the stored one: stored children that
    /// are not supplied are deleted (or invalidated).
    #[serde(default = "default_true")]
    pub replace_children: bool,
}

impl CascadeModel {
    pub fn one_to_many<S: Into<String>>(
        property: impl Into<String>,
        child_type: impl Into<String>,
        mapped_fields: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            property: property.into(),
            child_type: child_type.into(),
            kind: CascadeKind::OneToMany,
            mapped_fields: mapped_fields.into_iter().map(Into::into).collect(),
            delete: true,
            update: true,
            invalidate: None,
            replace_children: true,
        }
    }

    pub fn one_to_one<S: Into<String>>(
        property: impl Into<String>,
        child_type: impl Into<String>,
        mapped_fields: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            kind: CascadeKind::OneToOne,
            ..Self::one_to_many(property, child_type, mapped_fields)
        }
    }

    pub fn keep_unlisted(mut self) -> Self {
        self.replace_children = false;
        self
    }

    pub fn invalidate(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.invalidate = Some(Invalidate {
            field: field.into(),
            value,
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub type_name: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub fields: Vec<FieldMeta>,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    #[serde(default)]
    pub business_id: Option<BusinessIdConfig>,
    #[serde(default)]
    pub cascades: Vec<CascadeModel>,
    #[serde(default)]
    pub sharding: Option<ShardingConfig>,
    /// Attribute translations applied when query results are mapped into
    /// this type, for attributes the query left unset.
    #[serde(default)]
    pub translates: Vec<Translate>,
    #[serde(skip)]
    attr_index: HashMap<String, usize>,
    #[serde(skip)]
    column_index: HashMap<String, usize>,
}

impl EntityDescriptor {
    pub fn builder(type_name: impl Into<String>, table: impl Into<String>) -> EntityBuilder {
        EntityBuilder {
            desc: EntityDescriptor {
                type_name: type_name.into(),
                table: table.into(),
                schema: None,
                fields: Vec::new(),
                key_strategy: KeyStrategy::default(),
                business_id: None,
                cascades: Vec::new(),
                sharding: None,
                translates: Vec::new(),
                attr_index: HashMap::new(),
                column_index: HashMap::new(),
            },
        }
    }

    /// Validate and build the lookup tables. Must run before the descriptor
    /// is handed to the engine.
    pub fn finish(mut self) -> Result<Self> {
        self.attr_index.clear();
        self.column_index.clear();
        for (i, f) in self.fields.iter().enumerate() {
            if self
                .attr_index
                .insert(normalize_name(&f.attribute), i)
                .is_some()
            {
                return Err(EngineError::config_parse(format!(
                    "entity `{}` declares attribute `{}` twice",
                    self.type_name, f.attribute
                )));
            }
            self.column_index.insert(f.column.to_lowercase(), i);
        }
        let key_count = self.fields.iter().filter(|f| f.primary_key).count();
        if key_count == 0 {
            return Err(EngineError::config_parse(format!(
                "entity `{}` has no primary key",
                self.type_name
            )));
        }
        for c in &self.cascades {
            if c.mapped_fields.len() != key_count {
                return Err(EngineError::config_parse(format!(
                    "cascade `{}` of `{}` maps {} field(s) for {} key(s)",
                    c.property,
                    self.type_name,
                    c.mapped_fields.len(),
                    key_count
                )));
            }
        }
        if let Some(biz) = &self.business_id {
            if self.field(&biz.field).is_none() {
                return Err(EngineError::config_parse(format!(
                    "business id field `{}` is not an attribute of `{}`",
                    biz.field, self.type_name
                )));
            }
        }
        Ok(self)
    }

    /// Table name, schema-qualified when a schema is set.
    pub fn qualified_table(&self) -> String {
        self.qualify(&self.table)
    }

    pub fn qualify(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, table),
            None => table.to_string(),
        }
    }

    /// Attribute lookup, case-insensitive with underscores ignored.
    pub fn field(&self, attribute: &str) -> Option<&FieldMeta> {
        self.attr_index
            .get(&normalize_name(attribute))
            .map(|&i| &self.fields[i])
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldMeta> {
        self.column_index
            .get(&column.to_lowercase())
            .map(|&i| &self.fields[i])
    }

    /// Field for a result label: column name first, then attribute name.
    pub fn field_for_label(&self, label: &str) -> Option<&FieldMeta> {
        self.field_by_column(label).or_else(|| self.field(label))
    }

    pub fn key_fields(&self) -> Vec<&FieldMeta> {
        self.fields.iter().filter(|f| f.primary_key).collect()
    }

    pub fn non_key_fields(&self) -> Vec<&FieldMeta> {
        self.fields.iter().filter(|f| !f.primary_key).collect()
    }

    pub fn cascade(&self, property: &str) -> Option<&CascadeModel> {
        let wanted = normalize_name(property);
        self.cascades
            .iter()
            .find(|c| normalize_name(&c.property) == wanted)
    }

    pub fn column_list(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.column.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct EntityBuilder {
    desc: EntityDescriptor,
}

impl EntityBuilder {
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.desc.schema = Some(schema.into());
        self
    }

    pub fn key(mut self, attribute: &str, column: &str, column_type: ColumnType) -> Self {
        self.desc.fields.push(FieldMeta {
            attribute: attribute.to_string(),
            column: column.to_string(),
            column_type,
            primary_key: true,
        });
        self
    }

    pub fn field(mut self, attribute: &str, column: &str, column_type: ColumnType) -> Self {
        self.desc.fields.push(FieldMeta {
            attribute: attribute.to_string(),
            column: column.to_string(),
            column_type,
            primary_key: false,
        });
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.desc.key_strategy = strategy;
        self
    }

    pub fn business_id(mut self, config: BusinessIdConfig) -> Self {
        self.desc.business_id = Some(config);
        self
    }

    pub fn cascade(mut self, cascade: CascadeModel) -> Self {
        self.desc.cascades.push(cascade);
        self
    }

    pub fn sharding(mut self, sharding: ShardingConfig) -> Self {
        self.desc.sharding = Some(sharding);
        self
    }

    pub fn translate(mut self, translate: Translate) -> Self {
        self.desc.translates.push(translate);
        self
    }

    pub fn build(self) -> Result<EntityDescriptor> {
        self.desc.finish()
    }
}
