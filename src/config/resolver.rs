use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::catalog::ConfigSource;
use super::descriptor::{RawStatement, SqlKind, StatementDescriptor};
use super::template::SqlTemplate;
use crate::error::{EngineError, ErrorContext, Result};
use crate::sharding::ShardingConfig;

/// Text containing whitespace is SQL; anything else is a statement id.
pub fn is_literal_sql(id_or_text: &str) -> bool {
    id_or_text.trim().contains(char::is_whitespace)
}

/// Turns statement ids (or literal SQL) into dialect-specific descriptors.
///
/// Descriptors for catalog ids are built once per (id, dialect) and kept for
/// the life of the resolver. Literal SQL is parsed on every call so ad-hoc
/// text cannot grow the cache without bound.
pub struct ConfigResolver {
    source: Arc<dyn ConfigSource>,
    cache: RwLock<HashMap<(String, String), Arc<StatementDescriptor>>>,
}

impl ConfigResolver {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &Arc<dyn ConfigSource> {
        &self.source
    }

    pub fn resolve(
        &self,
        id_or_text: &str,
        kind: SqlKind,
        dialect: &str,
    ) -> Result<Arc<StatementDescriptor>> {
        let context = ErrorContext {
            statement: Some(id_or_text.to_string()),
            dialect: Some(dialect.to_string()),
            caller: None,
        };
        if is_literal_sql(id_or_text) {
            return literal(id_or_text, kind, dialect)
                .map(Arc::new)
                .map_err(|e| e.with_context(&context));
        }

        let key = (id_or_text.to_string(), dialect.to_ascii_lowercase());
        if let Some(hit) = self.cache.read().get(&key) {
            return Ok(Arc::clone(hit));
        }
        let raw = self
            .source
            .statement(id_or_text)
            .ok_or_else(|| EngineError::config_not_found(id_or_text).with_context(&context))?;
        let built = Arc::new(build(&raw, dialect).map_err(|e| e.with_context(&context))?);
        tracing::debug!(statement = id_or_text, dialect, "statement descriptor cached");

        // a concurrent resolve may have won; keep its instance
        let mut cache = self.cache.write();
        Ok(Arc::clone(cache.entry(key).or_insert(built)))
    }

    /// Data-source override and sharding rules of a statement. Needed before
    /// the dialect is known, since the dialect depends on the data source.
    pub fn placement(
        &self,
        id_or_text: &str,
    ) -> Result<(Option<String>, Option<ShardingConfig>)> {
        if is_literal_sql(id_or_text) {
            return Ok((None, None));
        }
        let raw = self
            .source
            .statement(id_or_text)
            .ok_or_else(|| EngineError::config_not_found(id_or_text))?;
        Ok((raw.data_source, raw.sharding))
    }
}

fn literal(sql: &str, kind: SqlKind, dialect: &str) -> Result<StatementDescriptor> {
    Ok(StatementDescriptor {
        id: sql.to_string(),
        dialect: dialect.to_string(),
        kind,
        template: SqlTemplate::parse(sql)?,
        count_template: None,
        data_source: None,
        shaping: Default::default(),
        sharding: None,
        nosql: None,
        ignore_empty_rows: false,
    })
}

fn build(raw: &RawStatement, dialect: &str) -> Result<StatementDescriptor> {
    let branch = raw
        .dialect_sql
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(dialect))
        .map(|(_, sql)| sql.as_str())
        .or(raw.sql.as_deref());
    let text = match (branch, &raw.nosql) {
        (Some(sql), _) => sql,
        // document statements carry no SQL text at all
        (None, Some(_)) => "",
        (None, None) => {
            return Err(EngineError::dialect_unsupported(
                dialect,
                format!("statement `{}` has no branch for this dialect", raw.id),
            ))
        }
    };
    let template = SqlTemplate::parse_declared(text, raw.params.as_deref())?;
    let count_template = raw
        .count_sql
        .as_deref()
        .map(SqlTemplate::parse)
        .transpose()?;
    Ok(StatementDescriptor {
        id: raw.id.clone(),
        dialect: dialect.to_ascii_lowercase(),
        kind: raw.kind,
        template,
        count_template,
        data_source: raw.data_source.clone(),
        shaping: raw.directives(),
        sharding: raw.sharding.clone(),
        nosql: raw.nosql.clone(),
        ignore_empty_rows: raw.ignore_empty_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Catalog;
    use crate::error::ErrorKind;

    fn resolver() -> ConfigResolver {
        let mut catalog = Catalog::new();
        let mut branched = RawStatement::new("qStaff", "select * from sys_staff where dept_id = :deptId");
        branched.dialect_sql.insert(
            "mysql".into(),
            "select * from sys_staff where dept_id = :deptId and deleted = 0".into(),
        );
        let mut only_oracle = RawStatement::default();
        only_oracle.id = "qOracle".into();
        only_oracle
            .dialect_sql
            .insert("oracle".into(), "select sysdate from dual".into());
        let mut declared = RawStatement::new("qPos", "select * from t where a = ? and b = ?");
        declared.params = Some(vec!["a".into()]);
        catalog
            .add_statement(branched)
            .add_statement(only_oracle)
            .add_statement(declared);
        ConfigResolver::new(Arc::new(catalog))
    }

    #[test]
    fn test_resolve_is_memoized() {
        let r = resolver();
        let a = r.resolve("qStaff", SqlKind::Search, "postgresql").unwrap();
        let b = r.resolve("qStaff", SqlKind::Search, "postgresql").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.sql(), b.sql());
        assert_eq!(a.param_names(), &["deptId".to_string()]);
    }

    #[test]
    fn test_dialect_branch_selected() {
        let r = resolver();
        let my = r.resolve("qStaff", SqlKind::Search, "MySQL").unwrap();
        assert!(my.sql().contains("deleted = 0"));
        let pg = r.resolve("qStaff", SqlKind::Search, "postgresql").unwrap();
        assert!(!pg.sql().contains("deleted"));
    }

    #[test]
    fn test_errors_carry_statement_and_dialect() {
        let r = resolver();
        let err = r.resolve("qMissing", SqlKind::Search, "mysql").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ConfigNotFound(_)));
        assert_eq!(err.context.dialect.as_deref(), Some("mysql"));

        let err = r.resolve("qOracle", SqlKind::Search, "mysql").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::DialectUnsupported { .. }));

        let err = r.resolve("qPos", SqlKind::Search, "mysql").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ConfigParse(_)));
        assert_eq!(err.context.statement.as_deref(), Some("qPos"));
    }

    #[test]
    fn test_literal_sql() {
        let r = resolver();
        assert!(is_literal_sql("select 1"));
        assert!(!is_literal_sql("qStaff"));
        let desc = r
            .resolve("update t set a = :a where id = :id", SqlKind::Update, "postgresql")
            .unwrap();
        assert_eq!(desc.kind, SqlKind::Update);
        assert_eq!(desc.param_names().len(), 2);
        assert_eq!(r.placement("select 1").unwrap(), (None, None));
    }
}
