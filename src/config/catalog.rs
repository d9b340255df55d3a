use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use super::descriptor::RawStatement;
use super::settings::EngineSettings;
use crate::entity::EntityDescriptor;
use crate::error::{EngineError, Result};
use crate::exec::postgres::DataSourceConfig;

/// Read-only view of the loaded configuration. The engine never writes
/// through it.
pub trait ConfigSource: Send + Sync {
    fn statement(&self, id: &str) -> Option<RawStatement>;
    fn entity(&self, type_name: &str) -> Option<Arc<EntityDescriptor>>;
}

/// Statements, entities and data sources loaded from a TOML catalog file or
/// registered in code.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub settings: EngineSettings,
    pub data_sources: Vec<DataSourceConfig>,
    statements: HashMap<String, RawStatement>,
    entities: HashMap<String, Arc<EntityDescriptor>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogFile {
    engine: EngineSettings,
    data_sources: Vec<DataSourceConfig>,
    statements: Vec<RawStatement>,
    entities: Vec<EntityDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlweave")
            .join("catalog.toml")
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| EngineError::config_parse(e.to_string()))?;
        let mut catalog = Catalog {
            settings: file.engine,
            data_sources: file.data_sources,
            ..Default::default()
        };
        for statement in file.statements {
            if catalog.statements.contains_key(&statement.id) {
                return Err(EngineError::config_parse(format!(
                    "statement `{}` is declared twice",
                    statement.id
                )));
            }
            catalog.add_statement(statement);
        }
        for entity in file.entities {
            catalog.register_entity(entity.finish()?);
        }
        tracing::debug!(
            statements = catalog.statements.len(),
            entities = catalog.entities.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config_not_found(format!("{} ({})", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load the catalog from the user config directory; a missing file is
    /// an empty catalog.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn add_statement(&mut self, statement: RawStatement) -> &mut Self {
        self.statements.insert(statement.id.clone(), statement);
        self
    }

    /// Register a finished descriptor (see [`EntityDescriptor::builder`]).
    pub fn register_entity(&mut self, desc: EntityDescriptor) -> &mut Self {
        self.entities
            .insert(desc.type_name.clone(), Arc::new(desc));
        self
    }

    pub fn statement_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.statements.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl ConfigSource for Catalog {
    fn statement(&self, id: &str) -> Option<RawStatement> {
        self.statements.get(id).cloned()
    }

    fn entity(&self, type_name: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.get(type_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
[engine]
batch_size = 20
max_threshold = 1000

[[data_sources]]
name = "default"
host = "localhost"
database = "app"
username = "app"

[[statements]]
id = "qStaff"
sql = "select * from sys_staff where dept_id = :deptId"

[[statements]]
id = "qDept"
sql = "select * from sys_dept"

[[entities]]
type_name = "Staff"
table = "sys_staff"

[[entities.fields]]
attribute = "staffId"
column = "staff_id"
primary_key = true
"#;

    #[test]
    fn test_from_toml_str() {
        let catalog = Catalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.settings.batch_size, 20);
        assert_eq!(catalog.settings.max_threshold, Some(1000));
        assert_eq!(catalog.settings.warn_threshold, 25_000);
        assert_eq!(catalog.data_sources.len(), 1);
        assert_eq!(catalog.statement_ids(), vec!["qDept", "qStaff"]);
        let staff = catalog.entity("Staff").unwrap();
        assert_eq!(staff.field("STAFF_ID").unwrap().column, "staff_id");
    }

    #[test]
    fn test_duplicate_statement_rejected() {
        let doubled = format!(
            "{}\n[[statements]]\nid = \"qDept\"\nsql = \"select 1\"\n",
            CATALOG
        );
        let err = Catalog::from_toml_str(&doubled).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = Catalog::from_toml_str("[[statements]]\nid = ").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = Catalog::load(Path::new("/nonexistent/sqlweave/catalog.toml")).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::ConfigNotFound(_)));
    }
}
