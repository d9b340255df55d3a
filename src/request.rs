//! Per-call request builder.
//!
//! Setters never fail; problems (an object that does not serialize, a
//! wrong argument count, a null key on an update) surface when the engine
//! consumes the request.

use serde::Serialize;

use crate::config::{
    ChainRelative, Format, Link, ParamLookup, Pivot, SecureMask, ShapingDirectives, SqlKind,
    StatementDescriptor, Translate, Unpivot,
};
use crate::dialect::LockMode;
use crate::entity::{normalize_name, Entity, Record};
use crate::error::{EngineError, Result};
use crate::value::CellValue;

#[derive(Debug, Clone, Default)]
struct Params {
    names: Vec<String>,
    values: Vec<CellValue>,
    /// `?` values; ignored once any named value is set.
    positional: Vec<CellValue>,
    record: Option<Record>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    statement: String,
    update: bool,
    params: Params,
    data_source: Option<String>,
    shaping: ShapingDirectives,
    lock: LockMode,
    auto_commit: Option<bool>,
    hump_labels: bool,
    page_over_to_first: Option<bool>,
    key_params: Vec<String>,
    entity_type: Option<&'static str>,
    deferred: Option<String>,
}

impl QueryRequest {
    /// A statement id from the catalog or literal SQL.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            update: false,
            params: Params::default(),
            data_source: None,
            shaping: ShapingDirectives::default(),
            lock: LockMode::None,
            auto_commit: None,
            hump_labels: true,
            page_over_to_first: None,
            key_params: Vec::new(),
            entity_type: None,
            deferred: None,
        }
    }

    /// Mark the statement as a write. Null values for key parameters are
    /// then rejected.
    pub fn update(mut self) -> Self {
        self.update = true;
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        let name = name.into();
        let wanted = normalize_name(&name);
        match self
            .params
            .names
            .iter()
            .position(|n| normalize_name(n) == wanted)
        {
            Some(i) => self.params.values[i] = value.into(),
            None => {
                self.params.names.push(name);
                self.params.values.push(value.into());
            }
        }
        self
    }

    /// Values for `?` placeholders, in order.
    pub fn positional<V: Into<CellValue>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.params.positional = values.into_iter().map(Into::into).collect();
        self
    }

    /// Take named parameter values from the serialized attributes of an
    /// object. Explicit `param` values still win.
    pub fn bind_object<T: Serialize>(mut self, object: &T) -> Self {
        match serde_json::to_value(object) {
            Ok(serde_json::Value::Object(map)) => {
                let mut record = Record::new();
                for (k, v) in &map {
                    record.set(k, CellValue::from_json(v));
                }
                self.params.record = Some(record);
            }
            Ok(_) => self.deferred = Some("bound object is not a struct or map".to_string()),
            Err(e) => self.deferred = Some(format!("bound object does not serialize: {}", e)),
        }
        self
    }

    /// Like [`bind_object`](Self::bind_object); the entity's key attributes
    /// also become key parameters.
    pub fn bind_entity<E: Entity>(mut self, entity: &E) -> Self {
        self.entity_type = Some(E::TYPE_NAME);
        self.bind_object(entity)
    }

    pub fn bind_record(mut self, record: Record) -> Self {
        self.params.record = Some(record);
        self
    }

    /// Parameters that must not be null when the statement writes.
    pub fn key_params<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.key_params.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn data_source(mut self, name: impl Into<String>) -> Self {
        self.data_source = Some(name.into());
        self
    }

    pub fn translate(mut self, translate: Translate) -> Self {
        self.shaping.translates.push(translate);
        self
    }

    pub fn decrypt(mut self, column: impl Into<String>) -> Self {
        self.shaping.decrypt_columns.push(column.into());
        self
    }

    pub fn link(mut self, link: Link) -> Self {
        self.shaping.link = Some(link);
        self
    }

    pub fn pivot(mut self, pivot: Pivot) -> Self {
        self.shaping.pivot = Some(pivot);
        self
    }

    pub fn unpivot(mut self, unpivot: Unpivot) -> Self {
        self.shaping.unpivot = Some(unpivot);
        self
    }

    pub fn chain(mut self, chain: ChainRelative) -> Self {
        self.shaping.chain.push(chain);
        self
    }

    pub fn mask(mut self, mask: SecureMask) -> Self {
        self.shaping.masks.push(mask);
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.shaping.formats.push(format);
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = mode;
        self
    }

    pub fn auto_commit(mut self, commit: bool) -> Self {
        self.auto_commit = Some(commit);
        self
    }

    /// Convert map keys to camelCase (default) or keep result labels.
    pub fn hump_labels(mut self, hump: bool) -> Self {
        self.hump_labels = hump;
        self
    }

    /// Override the engine setting for pages past the last one.
    pub fn page_over_to_first(mut self, first: bool) -> Self {
        self.page_over_to_first = Some(first);
        self
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn kind(&self) -> SqlKind {
        if self.update {
            SqlKind::Update
        } else {
            SqlKind::Search
        }
    }

    pub fn data_source_override(&self) -> Option<&str> {
        self.data_source.as_deref()
    }

    pub fn shaping(&self) -> &ShapingDirectives {
        &self.shaping
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock
    }

    pub fn auto_commit_flag(&self) -> Option<bool> {
        self.auto_commit
    }

    pub fn uses_hump_labels(&self) -> bool {
        self.hump_labels
    }

    pub fn page_over_policy(&self) -> Option<bool> {
        self.page_over_to_first
    }

    pub fn entity_type(&self) -> Option<&'static str> {
        self.entity_type
    }

    pub(crate) fn with_statement(mut self, statement: String) -> Self {
        self.statement = statement;
        self
    }

    /// Check the parameters against the resolved statement. `entity_keys`
    /// are key attributes contributed by the bound entity type.
    pub fn validate(&self, desc: &StatementDescriptor, entity_keys: &[String]) -> Result<()> {
        if let Some(problem) = &self.deferred {
            return Err(EngineError::binding(problem.clone()));
        }
        if desc.template.is_positional() && self.params.names.is_empty() {
            let expected = desc.template.placeholder_count();
            if self.params.positional.len() != expected {
                return Err(EngineError::binding(format!(
                    "statement takes {} argument(s), {} given",
                    expected,
                    self.params.positional.len()
                )));
            }
        }
        if self.update || desc.kind == SqlKind::Update {
            let keys: Vec<String> = self
                .key_params
                .iter()
                .chain(entity_keys)
                .map(|k| normalize_name(k))
                .collect();
            for name in desc.param_names() {
                if keys.contains(&normalize_name(name)) && self.named(name).is_null() {
                    return Err(EngineError::binding(format!(
                        "null value for key parameter `{}`",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ParamLookup for QueryRequest {
    fn named(&self, name: &str) -> CellValue {
        let wanted = normalize_name(name);
        if let Some(i) = self
            .params
            .names
            .iter()
            .position(|n| normalize_name(n) == wanted)
        {
            return self.params.values[i].clone();
        }
        self.params
            .record
            .as_ref()
            .map(|r| r.value(name))
            .unwrap_or_default()
    }

    fn positional(&self, index: usize) -> Option<CellValue> {
        if !self.params.names.is_empty() {
            return None;
        }
        self.params.positional.get(index).cloned()
    }
}
