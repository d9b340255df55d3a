//! Read operations: statement searches (all rows, page, top, random,
//! count) and entity loads.

use std::sync::Arc;

use super::{probe_record, Engine, Page, Prepared, Session, Unit};
use crate::config::SqlKind;
use crate::dialect::LockMode;
use crate::entity::{sql, CascadeKind, CascadeModel, Entity, EntityDescriptor, Record};
use crate::error::{EngineError, Result};
use crate::exec::{ExecutionContext, ExtractLimits, RawResult};
use crate::request::QueryRequest;
use crate::shaping::materialize::{records_to_models, to_maps, to_models};
use crate::shaping::{run_pipeline, DataSet, RowMap, RowModel};
use crate::value::CellValue;

/// Page request. `skip_count` fetches one extra row to learn whether a
/// next page exists instead of counting the whole result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page_no: u64,
    pub page_size: u64,
    pub skip_count: bool,
}

impl Paging {
    pub fn new(page_no: u64, page_size: u64) -> Self {
        Self {
            page_no,
            page_size,
            skip_count: false,
        }
    }

    pub fn skip_count(mut self) -> Self {
        self.skip_count = true;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchMode {
    All,
    Page(Paging),
    /// Row count above 1, share of the matched rows below.
    Top(f64),
    Random(f64),
}

/// Shaped rows of one search plus the page they form, if paginated.
pub(crate) struct Searched {
    pub data: DataSet,
    pub page: Option<Page<()>>,
}

impl Searched {
    fn rows(data: DataSet) -> Self {
        Self { data, page: None }
    }
}

fn count_value(result: &RawResult) -> Result<u64> {
    let Some(cell) = result.rows.first().and_then(|r| r.first()) else {
        return Ok(0);
    };
    cell.as_i64()
        .map(|n| n.max(0) as u64)
        .ok_or_else(|| EngineError::mapping(format!("count returned `{}`", cell.display())))
}

/// Cascades named in `properties`; all of them when none are named.
fn cascades_of<'d>(desc: &'d EntityDescriptor, properties: &[&str]) -> Result<Vec<&'d CascadeModel>> {
    if properties.is_empty() {
        return Ok(desc.cascades.iter().collect());
    }
    properties
        .iter()
        .map(|p| {
            desc.cascade(p).ok_or_else(|| {
                EngineError::binding(format!("`{}` is not a cascade of `{}`", p, desc.type_name))
            })
        })
        .collect()
}

impl Engine {
    /// Matched row count, summed across shard tables.
    async fn count_in(
        &self,
        session: &mut Session,
        prepared: &Prepared,
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let (sql, params) = match &prepared.count {
            Some(count) => (count.sql.clone(), &count.params),
            None => (session.dialect().count(&prepared.bound.sql), &prepared.bound.params),
        };
        let mut total = 0;
        for routed in prepared.routed(&sql) {
            let extraction = session
                .query(&routed, params, ExtractLimits::unbounded(), ctx)
                .await?;
            total += count_value(&extraction.result)?;
        }
        Ok(total)
    }

    /// Absolute row count for a top/random request.
    async fn sample_size(
        &self,
        session: &mut Session,
        prepared: &Prepared,
        n: f64,
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        if n.is_nan() || n <= 0.0 {
            return Err(EngineError::binding(format!("sample size must be positive, got {}", n)));
        }
        if n >= 1.0 {
            return Ok(n.floor() as u64);
        }
        let total = self.count_in(session, prepared, ctx).await?;
        Ok((total as f64 * n).ceil() as u64)
    }

    #[allow(clippy::too_many_arguments)]
    async fn page_in(
        &self,
        session: &mut Session,
        prepared: &Prepared,
        paging: Paging,
        over_to_first: bool,
        lock: LockMode,
        limits: ExtractLimits,
        ctx: &mut ExecutionContext,
    ) -> Result<Searched> {
        if paging.page_size == 0 {
            return Err(EngineError::binding("page size must be at least 1"));
        }
        let base = prepared.single(&prepared.bound.sql, "pagination")?;
        let params = &prepared.bound.params;
        let dialect = Arc::clone(session.dialect());
        let size = paging.page_size;
        let page_sql = |page: u64, limit: u64| -> Result<String> {
            let offset = (page - 1).checked_mul(size).ok_or_else(|| {
                EngineError::binding(format!("page {} of size {} is out of range", page, size))
            })?;
            dialect.lock_limited(&dialect.paginate(&base, offset, limit), lock)
        };
        let page_of = |page_no: u64, total: Option<u64>, has_next: bool| -> Page<()> {
            Page {
                page_no,
                page_size: size,
                total,
                has_next,
                rows: Vec::new(),
            }
        };
        let mut page_no = paging.page_no.max(1);

        if paging.skip_count {
            // one extra row tells whether a next page exists
            let peek = size
                .checked_add(1)
                .ok_or_else(|| EngineError::binding(format!("page size {} is out of range", size)))?;
            let mut raw = session.query(&page_sql(page_no, peek)?, params, limits, ctx).await?.result;
            if raw.rows.is_empty() && page_no > 1 && over_to_first {
                ctx.log(format!("page {} is past the end, returning page 1", page_no));
                page_no = 1;
                raw = session.query(&page_sql(1, peek)?, params, limits, ctx).await?.result;
            }
            let has_next = raw.rows.len() as u64 > size;
            raw.rows.truncate(size as usize);
            return Ok(Searched {
                data: DataSet::from_raw(raw),
                page: Some(page_of(page_no, None, has_next)),
            });
        }

        let total = self.count_in(session, prepared, ctx).await?;
        let pages = total.div_ceil(size);
        if page_no > pages {
            if !over_to_first || total == 0 {
                let page_no = if total == 0 && over_to_first { 1 } else { page_no };
                return Ok(Searched {
                    data: DataSet::default(),
                    page: Some(page_of(page_no, Some(total), false)),
                });
            }
            ctx.log(format!("page {} is past the last page {}, returning page 1", page_no, pages));
            page_no = 1;
        }
        let raw = session.query(&page_sql(page_no, size)?, params, limits, ctx).await?.result;
        Ok(Searched {
            data: DataSet::from_raw(raw),
            page: Some(page_of(page_no, Some(total), page_no < pages)),
        })
    }

    /// Run a statement request inside `unit` and shape its result.
    pub(crate) async fn search(
        &self,
        unit: &mut Unit,
        req: &QueryRequest,
        mode: SearchMode,
        ctx: &mut ExecutionContext,
    ) -> Result<Searched> {
        let prepared = self.prepare(unit, req, SqlKind::Search, ctx).await?;
        let session = self.session(unit, &prepared.data_source, ctx).await?;
        let dialect = Arc::clone(session.dialect());
        let limits = ExtractLimits::from_settings(&self.settings, prepared.desc.ignore_empty_rows);
        let params = &prepared.bound.params;
        let lock = req.lock_mode();

        let mut searched = match mode {
            SearchMode::All => {
                let mut raw = RawResult::default();
                for sql in prepared.routed(&prepared.bound.sql) {
                    let sql = dialect.apply_lock(&sql, lock);
                    raw.concat(session.query(&sql, params, limits, ctx).await?.result);
                }
                Searched::rows(DataSet::from_raw(raw))
            }
            SearchMode::Page(paging) => {
                let over_to_first = req
                    .page_over_policy()
                    .unwrap_or(self.settings.page_over_to_first);
                self.page_in(session, &prepared, paging, over_to_first, lock, limits, ctx)
                    .await?
            }
            SearchMode::Top(n) | SearchMode::Random(n) => {
                let what = if matches!(mode, SearchMode::Top(_)) { "top" } else { "random" };
                let base = prepared.single(&prepared.bound.sql, what)?;
                let size = self.sample_size(session, &prepared, n, ctx).await?;
                if size == 0 {
                    Searched::rows(DataSet::default())
                } else {
                    let sql = match mode {
                        SearchMode::Top(_) => dialect.top(&base, size),
                        _ => dialect.random(&base, size),
                    };
                    let sql = dialect.lock_limited(&sql, lock)?;
                    Searched::rows(DataSet::from_raw(session.query(&sql, params, limits, ctx).await?.result))
                }
            }
        };

        let directives = prepared.desc.shaping.merged(req.shaping());
        run_pipeline(&mut searched.data, &directives, &self.shape_env(), ctx)?;
        Ok(searched)
    }

    /// A search in its own unit. Reads commit only when the request asks.
    async fn read(&self, req: &QueryRequest, mode: SearchMode, ctx: &mut ExecutionContext) -> Result<Searched> {
        let mut unit = Unit::default();
        let result = self.search(&mut unit, req, mode, ctx).await;
        unit.close(result, req.auto_commit_flag().unwrap_or(false)).await
    }

    pub(crate) fn models<T: RowModel>(&self, data: DataSet, ctx: &mut ExecutionContext) -> Result<Vec<T>> {
        to_models(data, self.source(), &self.shape_env(), ctx)
    }

    fn paged<U>(searched: &mut Searched, rows: Vec<U>) -> Page<U> {
        match searched.page.take() {
            Some(page) => page.map(rows),
            None => Page {
                page_no: 1,
                page_size: rows.len() as u64,
                total: None,
                has_next: false,
                rows,
            },
        }
    }

    /// Every row of a statement as `T`.
    pub async fn find<T: RowModel>(&self, req: QueryRequest) -> Result<Vec<T>> {
        let mut ctx = self.context("find", req.statement());
        let result = match self.read(&req, SearchMode::All, &mut ctx).await {
            Ok(s) => self.models(s.data, &mut ctx),
            Err(e) => Err(e),
        };
        ctx.complete(result)
    }

    /// Every row as a label -> value map; labels are camel-cased unless the
    /// request turned that off.
    pub async fn find_maps(&self, req: QueryRequest) -> Result<Vec<RowMap>> {
        let mut ctx = self.context("find", req.statement());
        let result = self
            .read(&req, SearchMode::All, &mut ctx)
            .await
            .map(|s| to_maps(&s.data, req.uses_hump_labels()));
        ctx.complete(result)
    }

    /// Labels and rows as shaped, the only output allowed after a
    /// column-changing stage besides maps.
    pub async fn find_table(&self, req: QueryRequest) -> Result<DataSet> {
        let mut ctx = self.context("find", req.statement());
        let result = self.read(&req, SearchMode::All, &mut ctx).await.map(|s| s.data);
        ctx.complete(result)
    }

    pub async fn find_page<T: RowModel>(&self, req: QueryRequest, paging: Paging) -> Result<Page<T>> {
        let mut ctx = self.context("find_page", req.statement());
        let result = match self.read(&req, SearchMode::Page(paging), &mut ctx).await {
            Ok(mut s) => {
                let data = std::mem::take(&mut s.data);
                self.models(data, &mut ctx).map(|rows| Self::paged(&mut s, rows))
            }
            Err(e) => Err(e),
        };
        ctx.complete(result)
    }

    pub async fn find_page_maps(&self, req: QueryRequest, paging: Paging) -> Result<Page<RowMap>> {
        let mut ctx = self.context("find_page", req.statement());
        let result = self
            .read(&req, SearchMode::Page(paging), &mut ctx)
            .await
            .map(|mut s| {
                let rows = to_maps(&s.data, req.uses_hump_labels());
                Self::paged(&mut s, rows)
            });
        ctx.complete(result)
    }

    /// The first `n` rows, or the first `n` share of them when `n < 1`.
    pub async fn top<T: RowModel>(&self, req: QueryRequest, n: f64) -> Result<Vec<T>> {
        let mut ctx = self.context("top", req.statement());
        let result = match self.read(&req, SearchMode::Top(n), &mut ctx).await {
            Ok(s) => self.models(s.data, &mut ctx),
            Err(e) => Err(e),
        };
        ctx.complete(result)
    }

    pub async fn top_maps(&self, req: QueryRequest, n: f64) -> Result<Vec<RowMap>> {
        let mut ctx = self.context("top", req.statement());
        let result = self
            .read(&req, SearchMode::Top(n), &mut ctx)
            .await
            .map(|s| to_maps(&s.data, req.uses_hump_labels()));
        ctx.complete(result)
    }

    /// `n` rows in database random order; a share of the matched rows when
    /// `n < 1`.
    pub async fn random<T: RowModel>(&self, req: QueryRequest, n: f64) -> Result<Vec<T>> {
        let mut ctx = self.context("random", req.statement());
        let result = match self.read(&req, SearchMode::Random(n), &mut ctx).await {
            Ok(s) => self.models(s.data, &mut ctx),
            Err(e) => Err(e),
        };
        ctx.complete(result)
    }

    pub async fn random_maps(&self, req: QueryRequest, n: f64) -> Result<Vec<RowMap>> {
        let mut ctx = self.context("random", req.statement());
        let result = self
            .read(&req, SearchMode::Random(n), &mut ctx)
            .await
            .map(|s| to_maps(&s.data, req.uses_hump_labels()));
        ctx.complete(result)
    }

    pub async fn count(&self, req: QueryRequest) -> Result<u64> {
        let mut ctx = self.context("count", req.statement());
        let mut unit = Unit::default();
        let result = async {
            let prepared = self.prepare(&mut unit, &req, SqlKind::Search, &mut ctx).await?;
            let session = self.session(&mut unit, &prepared.data_source, &mut ctx).await?;
            self.count_in(session, &prepared, &mut ctx).await
        }
        .await;
        let result = unit.close(result, req.auto_commit_flag().unwrap_or(false)).await;
        ctx.complete(result)
    }

    /// Stored children of each record for the given cascades.
    pub(crate) async fn attach_children(
        &self,
        unit: &mut Unit,
        desc: &EntityDescriptor,
        records: &mut [Record],
        properties: &[&str],
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        for cascade in cascades_of(desc, properties)? {
            let child_desc = self.entity_desc(&cascade.child_type)?;
            for record in records.iter_mut() {
                let keys = record.key_values(desc);
                if keys.iter().any(CellValue::is_null) {
                    continue;
                }
                let probe = probe_record(&cascade.mapped_fields, &keys);
                let mut children = Vec::new();
                for target in self.targets_of(&child_desc, &probe)? {
                    let plan = sql::select_where(&child_desc, &target.table, &cascade.mapped_fields);
                    let session = self.session(unit, &target.data_source, ctx).await?;
                    children.extend(
                        self.fetch_records(session, &plan.sql, &keys, &child_desc, ctx)
                            .await?,
                    );
                }
                if cascade.kind == CascadeKind::OneToOne {
                    children.truncate(1);
                }
                record.set_children(&cascade.property, children);
            }
        }
        Ok(())
    }

    async fn load_records(
        &self,
        unit: &mut Unit,
        desc: &EntityDescriptor,
        records: &[Record],
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<Record>> {
        let mut loaded = Vec::with_capacity(records.len());
        for (target, members) in self.group_by_target(desc, records, 0..records.len())? {
            for chunk in members.chunks(self.settings.batch_size()) {
                let params: Vec<CellValue> = chunk
                    .iter()
                    .flat_map(|&i| records[i].key_values(desc))
                    .collect();
                if params.iter().any(CellValue::is_null) {
                    return Err(EngineError::binding(format!(
                        "cannot load `{}` without a key value",
                        desc.type_name
                    )));
                }
                let sql = sql::select_by_keys(desc, &target.table, chunk.len());
                let session = self.session(unit, &target.data_source, ctx).await?;
                loaded.extend(self.fetch_records(session, &sql, &params, desc, ctx).await?);
            }
        }
        Ok(loaded)
    }

    async fn load_entities<E: Entity>(
        &self,
        entities: &[E],
        properties: Option<&[&str]>,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<E>> {
        let desc = self.descriptor_of::<E>()?;
        let records = entities
            .iter()
            .map(|e| Record::from_entity(e, &desc, self.source()))
            .collect::<Result<Vec<_>>>()?;
        let mut unit = Unit::default();
        let result = async {
            let mut loaded = self.load_records(&mut unit, &desc, &records, ctx).await?;
            if let Some(properties) = properties {
                self.attach_children(&mut unit, &desc, &mut loaded, properties, ctx)
                    .await?;
            }
            Ok::<_, EngineError>(loaded)
        }
        .await;
        let loaded = unit.close(result, false).await?;
        records_to_models(&loaded, &desc, self.source(), &self.shape_env(), ctx)
    }

    /// Stored row for the entity's key.
    pub async fn load<E: Entity>(&self, entity: &E) -> Result<Option<E>> {
        let mut ctx = self.context("load", E::TYPE_NAME);
        let result = self
            .load_entities(std::slice::from_ref(entity), None, &mut ctx)
            .await
            .map(|mut v| v.pop());
        ctx.complete(result)
    }

    /// Stored row plus the children of the named cascades (every cascade
    /// when `properties` is empty).
    pub async fn load_cascade<E: Entity>(&self, entity: &E, properties: &[&str]) -> Result<Option<E>> {
        let mut ctx = self.context("load", E::TYPE_NAME);
        let result = self
            .load_entities(std::slice::from_ref(entity), Some(properties), &mut ctx)
            .await
            .map(|mut v| v.pop());
        ctx.complete(result)
    }

    /// Stored rows for many keys, queried in batches per shard.
    pub async fn load_all<E: Entity>(&self, entities: &[E]) -> Result<Vec<E>> {
        let mut ctx = self.context("load_all", E::TYPE_NAME);
        let result = self.load_entities(entities, None, &mut ctx).await;
        ctx.complete(result)
    }

    pub async fn load_all_cascade<E: Entity>(&self, entities: &[E], properties: &[&str]) -> Result<Vec<E>> {
        let mut ctx = self.context("load_all", E::TYPE_NAME);
        let result = self.load_entities(entities, Some(properties), &mut ctx).await;
        ctx.complete(result)
    }

    /// Whether no other stored row shares the entity's values for
    /// `attributes`. A single match is the entity itself when its key is
    /// equal.
    pub async fn is_unique<E: Entity>(&self, entity: &E, attributes: &[&str]) -> Result<bool> {
        let mut ctx = self.context("unique", E::TYPE_NAME);
        let result = self.check_unique(entity, attributes, &mut ctx).await;
        ctx.complete(result)
    }

    async fn check_unique<E: Entity>(
        &self,
        entity: &E,
        attributes: &[&str],
        ctx: &mut ExecutionContext,
    ) -> Result<bool> {
        if attributes.is_empty() {
            return Err(EngineError::binding("unique check needs at least one attribute"));
        }
        let desc = self.descriptor_of::<E>()?;
        let record = Record::from_entity(entity, &desc, self.source())?;
        let attributes: Vec<String> = attributes.iter().map(|a| a.to_string()).collect();
        let target = self.target_of(&desc, &record)?;
        let mut unit = Unit::default();
        let result = async {
            let session = self.session(&mut unit, &target.data_source, ctx).await?;
            let plan = sql::select_where(&desc, &target.table, &attributes);
            let sql = session.dialect().top(&plan.sql, 2);
            self.fetch_records(session, &sql, &plan.params(&record), &desc, ctx)
                .await
        }
        .await;
        let matches = unit.close(result, false).await?;
        Ok(match matches.as_slice() {
            [] => true,
            [only] => record.has_key(&desc) && only.key_values(&desc) == record.key_values(&desc),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::config::Translate;
    use crate::exec::testing::{cols, Call, MockDatabase};

    fn staff_rows(n: usize) -> Vec<Vec<CellValue>> {
        (1..=n)
            .map(|i| vec![format!("S{}", i).into(), format!("Staff {}", i).into(), CellValue::Int64(1)])
            .collect()
    }

    fn staff_cols() -> Vec<crate::value::ColumnInfo> {
        cols(&["staff_id", "staff_name", "status"])
    }

    #[tokio::test]
    async fn test_find_drops_empty_optional_block() {
        let db = MockDatabase::new();
        db.respond("from sys_staff", staff_cols(), staff_rows(2));
        let engine = engine(&db);
        let rows: Vec<Staff> = engine.find(QueryRequest::new("staff_list")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].staff_name.as_deref(), Some("Staff 1"));
        let sql = &db.sqls()[0];
        assert!(!sql.contains("status ="));
        assert!(sql.ends_with("order by staff_id"));
    }

    #[tokio::test]
    async fn test_find_maps_with_translation() {
        let db = MockDatabase::new();
        db.respond("from sys_staff", staff_cols(), staff_rows(1));
        let engine = engine(&db);
        let rows = engine
            .find_maps(
                QueryRequest::new("staff_list")
                    .param("status", 1)
                    .translate(Translate::new("status", "status")),
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["status"], serde_json::Value::from("Active"));
        assert_eq!(rows[0]["staffName"], serde_json::Value::from("Staff 1"));
        match &db.calls()[0] {
            Call::Query { sql, params, .. } => {
                assert!(sql.contains("status = $1"));
                assert_eq!(params, &vec![CellValue::Int32(1)]);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_page_is_idempotent() {
        let db = MockDatabase::new();
        db.respond("count(1)", cols(&["count"]), vec![vec![CellValue::Int64(25)]]);
        db.respond("from sys_staff", staff_cols(), staff_rows(10));
        let engine = engine(&db);
        let first = engine
            .find_page_maps(QueryRequest::new("staff_list"), Paging::new(1, 10))
            .await
            .unwrap();
        let second = engine
            .find_page_maps(QueryRequest::new("staff_list"), Paging::new(1, 10))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total, Some(25));
        assert_eq!(first.total_pages(), Some(3));
        assert!(first.has_next);
        let sqls = db.sqls();
        assert!(sqls[0].starts_with("SELECT COUNT(1) FROM ("));
        assert!(!sqls[0].contains("order by"));
        assert!(sqls[1].ends_with("LIMIT 10 OFFSET 0"));
    }

    #[tokio::test]
    async fn test_page_past_the_end() {
        let db = MockDatabase::new();
        db.respond("count(1)", cols(&["count"]), vec![vec![CellValue::Int64(5)]]);
        db.respond("from sys_staff", staff_cols(), staff_rows(5));
        let engine = engine(&db);
        let page = engine
            .find_page_maps(QueryRequest::new("staff_list"), Paging::new(4, 10))
            .await
            .unwrap();
        assert_eq!(page.page_no, 1);
        assert_eq!(page.rows.len(), 5);
        assert!(db.sqls()[1].ends_with("LIMIT 10 OFFSET 0"));

        let empty = engine
            .find_page_maps(
                QueryRequest::new("staff_list").page_over_to_first(false),
                Paging::new(4, 10),
            )
            .await
            .unwrap();
        assert_eq!(empty.page_no, 4);
        assert!(empty.rows.is_empty());
        assert_eq!(empty.total, Some(5));
    }

    #[tokio::test]
    async fn test_skip_count_page() {
        let db = MockDatabase::new();
        db.respond("from sys_staff", staff_cols(), staff_rows(11));
        let engine = engine(&db);
        let page = engine
            .find_page_maps(QueryRequest::new("staff_list"), Paging::new(2, 10).skip_count())
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 10);
        assert!(page.has_next);
        assert_eq!(page.total, None);
        let sqls = db.sqls();
        assert_eq!(sqls.len(), 1);
        assert!(sqls[0].ends_with("LIMIT 11 OFFSET 10"));
    }

    #[tokio::test]
    async fn test_skip_count_page_out_of_range() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        for paging in [
            Paging::new(u64::MAX, 10).skip_count(),
            Paging::new(1, u64::MAX).skip_count(),
        ] {
            let err = engine
                .find_page_maps(QueryRequest::new("staff_list"), paging)
                .await
                .unwrap_err();
            assert!(matches!(err.kind, crate::error::ErrorKind::ParameterBinding(_)));
        }
        assert!(db.sqls().iter().all(|sql| !sql.contains("LIMIT")));
    }

    #[tokio::test]
    async fn test_sharded_search_concatenates_tables() {
        let db = MockDatabase::new();
        db.respond(
            "from ledger_0",
            cols(&["ledger_id", "amount"]),
            vec![vec![CellValue::Int64(2), CellValue::Float64(1.5)]],
        );
        db.respond(
            "from ledger_1",
            cols(&["ledger_id", "amount"]),
            vec![
                vec![CellValue::Int64(1), CellValue::Float64(2.5)],
                vec![CellValue::Int64(3), CellValue::Float64(4.0)],
            ],
        );
        let engine = engine(&db);
        let rows: Vec<Ledger> = engine.find(QueryRequest::new("ledger_list")).await.unwrap();
        let ids: Vec<Option<i64>> = rows.iter().map(|r| r.ledger_id).collect();
        assert_eq!(ids, vec![Some(2), Some(1), Some(3)]);
        let sqls = db.sqls();
        assert_eq!(sqls.len(), 2);
        assert!(sqls[0].contains("from ledger_0 where"));
        assert!(sqls[1].contains("from ledger_1 where"));
        assert!(sqls.iter().all(|sql| sql.ends_with("order by ledger_id")));
    }

    #[tokio::test]
    async fn test_sharded_page_top_random_need_one_table() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let errors = [
            engine
                .find_page_maps(QueryRequest::new("ledger_list"), Paging::new(1, 10))
                .await
                .unwrap_err(),
            engine.top_maps(QueryRequest::new("ledger_list"), 5.0).await.unwrap_err(),
            engine.random_maps(QueryRequest::new("ledger_list"), 5.0).await.unwrap_err(),
        ];
        for err in errors {
            assert!(matches!(err.kind, crate::error::ErrorKind::ShardingRoute(_)));
        }
        assert!(db.sqls().is_empty());

        // a routed key narrows the query to one table
        engine
            .top_maps(QueryRequest::new("ledger_list").param("ledgerId", 3i64), 5.0)
            .await
            .unwrap();
        let sqls = db.sqls();
        assert!(sqls[0].contains("from ledger_1 where"));
        assert!(sqls[0].ends_with("LIMIT 5 OFFSET 0"));
    }

    #[tokio::test]
    async fn test_lock_is_not_doubled() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        engine
            .find_maps(QueryRequest::new("select * from sys_staff for update").lock(LockMode::Upgrade))
            .await
            .unwrap();
        engine
            .find_maps(QueryRequest::new("select * from sys_staff where 1=1").lock(LockMode::Upgrade))
            .await
            .unwrap();
        let sqls = db.sqls();
        assert_eq!(sqls[0].to_lowercase().matches("for update").count(), 1);
        assert!(sqls[1].ends_with("FOR UPDATE"));
    }

    #[tokio::test]
    async fn test_proportional_random_counts_first() {
        let db = MockDatabase::new();
        db.respond("count(1)", cols(&["count"]), vec![vec![CellValue::Int64(40)]]);
        let engine = engine(&db);
        engine
            .random_maps(QueryRequest::new("staff_list"), 0.25)
            .await
            .unwrap();
        let sqls = db.sqls();
        assert!(sqls[0].contains("COUNT(1)"));
        assert!(sqls[1].ends_with("ORDER BY RANDOM() LIMIT 10"));

        let err = engine
            .top_maps(QueryRequest::new("staff_list"), 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::ParameterBinding(_)));
    }

    #[tokio::test]
    async fn test_load_cascade_and_unique() {
        let db = MockDatabase::new();
        db.respond_once(
            "from sys_dept",
            cols(&["dept_id", "dept_name"]),
            vec![vec!["D1".into(), "Sales".into()]],
        );
        db.respond(
            "from sys_staff",
            cols(&["staff_id", "staff_name", "dept_id", "status"]),
            vec![vec!["S1".into(), "Ann".into(), "D1".into(), CellValue::Int64(1)]],
        );
        let engine = engine(&db);
        let dept = engine
            .load_cascade(&Dept::with_id("D1"), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dept.dept_name.as_deref(), Some("Sales"));
        let staffs = dept.staffs.unwrap();
        assert_eq!(staffs[0].staff_id.as_deref(), Some("S1"));
        assert!(db.sqls()[1].ends_with("WHERE dept_id = $1"));

        // the only match is the entity itself
        let mut me = Staff::with_id("S1");
        me.staff_name = Some("Ann".into());
        assert!(engine.is_unique(&me, &["staffName"]).await.unwrap());
        let mut other = Staff::with_id("S2");
        other.staff_name = Some("Ann".into());
        assert!(!engine.is_unique(&other, &["staffName"]).await.unwrap());
        assert!(db.sqls().last().unwrap().ends_with("LIMIT 2 OFFSET 0"));
    }

    #[tokio::test]
    async fn test_load_all_batches_keys() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let keys: Vec<Staff> = (0..3).map(|i| Staff::with_id(&format!("S{}", i))).collect();
        engine.load_all(&keys).await.unwrap();
        match &db.calls()[0] {
            Call::Query { sql, params, .. } => {
                assert!(sql.ends_with("WHERE staff_id IN ($1, $2, $3)"));
                assert_eq!(params.len(), 3);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }
}
