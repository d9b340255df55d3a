//! The engine: turns a request into dialect-correct SQL, routes it to a
//! data source and physical tables, runs it and shapes the result.
//!
//! Every public operation owns one [`ExecutionContext`] and one [`Unit`].
//! The unit holds at most one connection per data source for the whole
//! call and either commits (when asked to) or rolls back on failure.

mod cache_ops;
mod persist;
mod query;
mod statement;

#[cfg(test)]
pub(crate) mod fixtures;

pub use query::Paging;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::TranslationCache;
use crate::config::{
    BoundSql, Catalog, ConfigResolver, ConfigSource, EngineSettings, ParamLookup, SqlKind,
    StatementDescriptor,
};
use crate::dialect::{render_placeholders, Dialect, DialectRegistry};
use crate::entity::{Entity, EntityDescriptor, Record};
use crate::error::{EngineError, ErrorKind, Result};
use crate::exec::postgres::PgProvider;
use crate::exec::{
    extract, Connection, DataSourceProvider, ExecutionContext, ExtractLimits, Extraction, RawResult,
};
use crate::idgen::{IdGenerator, TimeSequenceGenerator};
use crate::request::QueryRequest;
use crate::secure::{DefaultDesensitizer, Desensitizer, FieldDecryptor};
use crate::shaping::ShapeEnv;
use crate::sharding::{apply_tables, ShardingRouter, ShardingStrategy};
use crate::value::CellValue;

/// One page of a paginated search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Page actually returned; 1 when an out-of-range page was clamped.
    pub page_no: u64,
    pub page_size: u64,
    /// Matched row count; `None` in skip-count mode.
    pub total: Option<u64>,
    pub has_next: bool,
    pub rows: Vec<T>,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> Option<u64> {
        self.total.map(|t| t.div_ceil(self.page_size.max(1)))
    }

    fn map<U>(self, rows: Vec<U>) -> Page<U> {
        Page {
            page_no: self.page_no,
            page_size: self.page_size,
            total: self.total,
            has_next: self.has_next,
            rows,
        }
    }
}

/// A live connection of the current call with the dialect of its data
/// source.
pub(crate) struct Session {
    data_source: String,
    conn: Box<dyn Connection>,
    dialect: Arc<dyn Dialect>,
    wrote: bool,
}

impl Session {
    pub(crate) fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub(crate) async fn query(
        &mut self,
        sql: &str,
        params: &[CellValue],
        limits: ExtractLimits,
        ctx: &mut ExecutionContext,
    ) -> Result<Extraction> {
        let rendered = render_placeholders(sql, &*self.dialect);
        ctx.record_sql(&rendered, params);
        let mut cursor = self.conn.query(&rendered, params).await?;
        Ok(extract(&mut *cursor, limits, ctx).await?)
    }

    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: &[CellValue],
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let rendered = render_placeholders(sql, &*self.dialect);
        ctx.record_sql(&rendered, params);
        self.wrote = true;
        Ok(self.conn.execute(&rendered, params).await?)
    }

    /// One grouped submission of `rows`.
    pub(crate) async fn batch(
        &mut self,
        sql: &str,
        rows: &[Vec<CellValue>],
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let rendered = render_placeholders(sql, &*self.dialect);
        ctx.record_sql(&rendered, rows.first().map(Vec::as_slice).unwrap_or(&[]));
        ctx.log(format!("batch of {} row(s)", rows.len()));
        self.wrote = true;
        Ok(self.conn.execute_batch(&rendered, rows).await?)
    }
}

/// Connections opened by one call.
#[derive(Default)]
pub(crate) struct Unit {
    sessions: Vec<Session>,
}

impl Unit {
    /// Commit when asked to and the work succeeded; roll back every
    /// session when it failed.
    pub(crate) async fn close<T>(mut self, result: Result<T>, commit: bool) -> Result<T> {
        match result {
            Ok(value) => {
                for session in &mut self.sessions {
                    if commit {
                        session.conn.commit().await?;
                    } else if session.wrote {
                        tracing::debug!(
                            data_source = %session.data_source,
                            "writes left uncommitted for the connection owner"
                        );
                    }
                }
                Ok(value)
            }
            Err(err) => {
                for session in &mut self.sessions {
                    if let Err(e) = session.conn.rollback().await {
                        tracing::warn!(data_source = %session.data_source, "rollback failed: {}", e);
                    }
                }
                Err(err)
            }
        }
    }
}

/// Per-call counters of grouped submissions.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub chunks: usize,
    pub affected: u64,
}

/// Physical placement of one entity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub data_source: String,
    /// Routed, schema-qualified table.
    pub table: String,
}

/// A record carrying only the given attribute values, used to route
/// children by the parent's key.
pub(crate) fn probe_record(attributes: &[String], values: &[CellValue]) -> Record {
    let mut probe = Record::new();
    for (attribute, value) in attributes.iter().zip(values) {
        probe.set(attribute, value.clone());
    }
    probe
}

/// A statement resolved, bound and routed for one call.
pub(crate) struct Prepared {
    pub desc: Arc<StatementDescriptor>,
    pub data_source: String,
    pub bound: BoundSql,
    pub count: Option<BoundSql>,
    pub table_sets: Vec<Vec<(String, String)>>,
}

impl Prepared {
    /// The SQL once per physical table set.
    pub fn routed(&self, sql: &str) -> Vec<String> {
        self.table_sets
            .iter()
            .map(|set| apply_tables(sql, set))
            .collect()
    }

    /// The SQL for the only physical table set; `what` names the operation
    /// that cannot span shards.
    pub fn single(&self, sql: &str, what: &str) -> Result<String> {
        match self.table_sets.as_slice() {
            [one] => Ok(apply_tables(sql, one)),
            sets => Err(EngineError::sharding(format!(
                "{} cannot span {} shard tables",
                what,
                sets.len()
            ))),
        }
    }
}

pub struct Engine {
    settings: EngineSettings,
    resolver: ConfigResolver,
    dialects: DialectRegistry,
    router: ShardingRouter,
    provider: Arc<dyn DataSourceProvider>,
    caches: Option<Arc<dyn TranslationCache>>,
    id_generator: Arc<dyn IdGenerator>,
    decryptor: Option<Arc<dyn FieldDecryptor>>,
    desensitizer: Arc<dyn Desensitizer>,
    data_source_dialects: RwLock<HashMap<String, Arc<dyn Dialect>>>,
}

pub struct EngineBuilder {
    settings: EngineSettings,
    source: Arc<dyn ConfigSource>,
    provider: Arc<dyn DataSourceProvider>,
    dialects: DialectRegistry,
    router: ShardingRouter,
    caches: Option<Arc<dyn TranslationCache>>,
    id_generator: Arc<dyn IdGenerator>,
    decryptor: Option<Arc<dyn FieldDecryptor>>,
    desensitizer: Arc<dyn Desensitizer>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialects.register(dialect);
        self
    }

    pub fn strategy(mut self, name: impl Into<String>, strategy: Arc<dyn ShardingStrategy>) -> Self {
        self.router.register(name, strategy);
        self
    }

    pub fn caches(mut self, caches: Arc<dyn TranslationCache>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn decryptor(mut self, decryptor: Arc<dyn FieldDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn desensitizer(mut self, desensitizer: Arc<dyn Desensitizer>) -> Self {
        self.desensitizer = desensitizer;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            settings: self.settings,
            resolver: ConfigResolver::new(self.source),
            dialects: self.dialects,
            router: self.router,
            provider: self.provider,
            caches: self.caches,
            id_generator: self.id_generator,
            decryptor: self.decryptor,
            desensitizer: self.desensitizer,
            data_source_dialects: RwLock::new(HashMap::new()),
        }
    }
}

impl Engine {
    pub fn builder(source: Arc<dyn ConfigSource>, provider: Arc<dyn DataSourceProvider>) -> EngineBuilder {
        EngineBuilder {
            settings: EngineSettings::default(),
            source,
            provider,
            dialects: DialectRegistry::default(),
            router: ShardingRouter::new(),
            caches: None,
            id_generator: Arc::new(TimeSequenceGenerator::default()),
            decryptor: None,
            desensitizer: Arc::new(DefaultDesensitizer),
        }
    }

    /// Engine over the catalog's PostgreSQL data sources, using its
    /// `[engine]` settings.
    pub fn from_catalog(catalog: Catalog) -> Result<EngineBuilder> {
        let provider = PgProvider::new(&catalog.data_sources)?;
        let settings = catalog.settings.clone();
        Ok(Self::builder(Arc::new(catalog), Arc::new(provider)).settings(settings))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn source(&self) -> &dyn ConfigSource {
        &**self.resolver.source()
    }

    pub(crate) fn context(&self, kind: &'static str, statement: &str) -> ExecutionContext {
        ExecutionContext::start(kind, statement, &self.settings)
    }

    pub(crate) fn shape_env(&self) -> ShapeEnv<'_> {
        ShapeEnv {
            caches: self.caches.as_deref(),
            decryptor: self.decryptor.as_deref(),
            desensitizer: &*self.desensitizer,
        }
    }

    pub(crate) fn entity_desc(&self, type_name: &str) -> Result<Arc<EntityDescriptor>> {
        self.source()
            .entity(type_name)
            .ok_or_else(|| EngineError::config_not_found(format!("entity `{}`", type_name)))
    }

    pub(crate) fn descriptor_of<E: Entity>(&self) -> Result<Arc<EntityDescriptor>> {
        self.entity_desc(E::TYPE_NAME)
    }

    /// Request override, then the sharding result, then the statement's
    /// own data source, then the configured default.
    pub(crate) fn pick_data_source(
        &self,
        requested: Option<&str>,
        routed: Option<String>,
        declared: Option<String>,
    ) -> String {
        requested
            .map(str::to_string)
            .or(routed)
            .or(declared)
            .unwrap_or_else(|| self.settings.default_data_source.clone())
    }

    async fn dialect_for(&self, data_source: &str, conn: &mut dyn Connection) -> Result<Arc<dyn Dialect>> {
        if let Some(hit) = self.data_source_dialects.read().get(data_source) {
            return Ok(Arc::clone(hit));
        }
        let product = conn.product_name().await?;
        let dialect = self.dialects.detect(&product)?;
        tracing::debug!(data_source, product = %product, dialect = dialect.name(), "dialect detected");
        self.data_source_dialects
            .write()
            .insert(data_source.to_string(), Arc::clone(&dialect));
        Ok(dialect)
    }

    /// The call's session for a data source, opened on first use.
    pub(crate) async fn session<'u>(
        &self,
        unit: &'u mut Unit,
        data_source: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<&'u mut Session> {
        let found = unit.sessions.iter().position(|s| s.data_source == data_source);
        let idx = match found {
            Some(idx) => idx,
            None => {
                let mut conn = self.provider.acquire(data_source).await?;
                let dialect = self.dialect_for(data_source, &mut *conn).await?;
                unit.sessions.push(Session {
                    data_source: data_source.to_string(),
                    conn,
                    dialect,
                    wrote: false,
                });
                unit.sessions.len() - 1
            }
        };
        let session = &mut unit.sessions[idx];
        ctx.set_dialect(session.dialect.name());
        Ok(session)
    }

    /// Placement, routing, resolution and binding of a statement request.
    pub(crate) async fn prepare(
        &self,
        unit: &mut Unit,
        req: &QueryRequest,
        kind: SqlKind,
        ctx: &mut ExecutionContext,
    ) -> Result<Prepared> {
        let (declared, sharding) = self.resolver.placement(req.statement())?;
        let route = self.router.route(sharding.as_ref(), &|name| req.named(name))?;
        let data_source = self.pick_data_source(req.data_source_override(), route.data_source.clone(), declared);
        let dialect = Arc::clone(self.session(unit, &data_source, ctx).await?.dialect());
        let desc = self.resolver.resolve(req.statement(), kind, dialect.name())?;
        if desc.nosql.is_some() {
            return Err(EngineError::dialect_unsupported(
                dialect.name(),
                format!("`{}` is a document-store statement", desc.id),
            ));
        }
        let entity_keys: Vec<String> = match req.entity_type() {
            Some(type_name) => self
                .entity_desc(type_name)?
                .key_fields()
                .iter()
                .map(|f| f.attribute.clone())
                .collect(),
            None => Vec::new(),
        };
        req.validate(&desc, &entity_keys)?;
        let bound = desc.template.bind(req)?;
        let count = desc
            .count_template
            .as_ref()
            .map(|t| t.bind(req))
            .transpose()?;
        Ok(Prepared {
            desc,
            data_source,
            bound,
            count,
            table_sets: route.table_sets(),
        })
    }

    /// Submit `rows` in chunks of the configured batch size. A failing chunk
    /// stops the rest and reports what already completed.
    pub(crate) async fn run_chunks(
        &self,
        session: &mut Session,
        sql: &str,
        rows: &[Vec<CellValue>],
        tally: &mut Tally,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        for chunk in rows.chunks(self.settings.batch_size()) {
            match session.batch(sql, chunk, ctx).await {
                Ok(n) => {
                    tally.chunks += 1;
                    tally.affected += n;
                }
                Err(err) => {
                    tracing::warn!(
                        completed = tally.chunks,
                        affected = tally.affected,
                        "batch aborted: {}",
                        err
                    );
                    return Err(EngineError::new(ErrorKind::Batch {
                        completed_chunks: tally.chunks,
                        affected: tally.affected,
                        source: Box::new(err),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Every placement an entity row can route to. A row whose sharding
    /// values are missing may span several tables.
    pub(crate) fn targets_of(&self, desc: &EntityDescriptor, record: &Record) -> Result<Vec<Target>> {
        self.targets_by(desc, &|f| record.value(f))
    }

    pub(crate) fn targets_by(
        &self,
        desc: &EntityDescriptor,
        value_of: &dyn Fn(&str) -> CellValue,
    ) -> Result<Vec<Target>> {
        let route = self.router.route(desc.sharding.as_ref(), value_of)?;
        let data_source = self.pick_data_source(None, route.data_source.clone(), None);
        let tables = match route
            .tables
            .iter()
            .find(|t| t.logical.eq_ignore_ascii_case(&desc.table))
        {
            Some(t) => t.physical.clone(),
            None => vec![desc.table.clone()],
        };
        Ok(tables
            .iter()
            .map(|table| Target {
                data_source: data_source.clone(),
                table: desc.qualify(table),
            })
            .collect())
    }

    /// Data source and physical table of one entity row.
    pub(crate) fn target_of(&self, desc: &EntityDescriptor, record: &Record) -> Result<Target> {
        let mut targets = self.targets_of(desc, record)?;
        match targets.len() {
            1 => Ok(targets.remove(0)),
            n => Err(EngineError::sharding(format!(
                "a `{}` row routes to {} tables, expected one",
                desc.type_name, n
            ))),
        }
    }

    /// Positions of the selected records grouped by target, in
    /// first-appearance order.
    pub(crate) fn group_by_target(
        &self,
        desc: &EntityDescriptor,
        records: &[Record],
        selected: impl IntoIterator<Item = usize>,
    ) -> Result<Vec<(Target, Vec<usize>)>> {
        let mut groups: Vec<(Target, Vec<usize>)> = Vec::new();
        for i in selected {
            let target = self.target_of(desc, &records[i])?;
            match groups.iter_mut().find(|(t, _)| *t == target) {
                Some((_, members)) => members.push(i),
                None => groups.push((target, vec![i])),
            }
        }
        Ok(groups)
    }

    /// Rows of an entity select, mapped by column name.
    pub(crate) async fn fetch_records(
        &self,
        session: &mut Session,
        sql: &str,
        params: &[CellValue],
        desc: &EntityDescriptor,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<Record>> {
        let limits = ExtractLimits::from_settings(&self.settings, false);
        let RawResult { columns, rows } = session.query(sql, params, limits, ctx).await?.result;
        Ok(rows
            .into_iter()
            .map(|row| Record::from_row(&columns, row, desc))
            .collect())
    }

    /// Commit policy for statement requests.
    pub(crate) fn commit_flag(&self, req: &QueryRequest) -> bool {
        req.auto_commit_flag().unwrap_or(self.settings.auto_commit)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::exec::testing::{cols, Call, MockDatabase};

    #[tokio::test]
    async fn test_dialect_is_detected_once_per_data_source() {
        let db = MockDatabase::new();
        db.product("default", "MySQL 8.0.36");
        db.respond("from sys_staff", cols(&["staff_id"]), vec![vec!["S1".into()]]);
        let engine = engine(&db);
        for _ in 0..2 {
            let rows = engine
                .find_maps(QueryRequest::new("select staff_id from sys_staff where status = ?").positional([1]))
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
        }
        assert_eq!(engine.data_source_dialects.read().len(), 1);
        // MySQL keeps `?` placeholders
        assert!(db.sqls()[0].ends_with("status = ?"));
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let db = MockDatabase::new();
        db.fail_on("update sys_staff");
        let engine = engine(&db);
        let err = engine
            .execute(QueryRequest::new("update sys_staff set status = :status").param("status", 1))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Execution(_)));
        assert!(db.calls().contains(&Call::Rollback("default".into())));
        assert_eq!(err.context.dialect.as_deref(), Some("postgresql"));
        assert!(err.context.statement.is_some());
    }

    #[test]
    fn test_page_total_pages() {
        let page: Page<()> = Page {
            page_no: 1,
            page_size: 10,
            total: Some(21),
            has_next: true,
            rows: vec![],
        };
        assert_eq!(page.total_pages(), Some(3));
    }
}
