//! Write statements: plain execution, batched updates, delete by condition
//! and lock-then-update of fetched entities.

use serde::Serialize;

use super::query::SearchMode;
use super::{Engine, Tally, Unit};
use crate::config::{ParamLookup, SqlKind, SqlTemplate};
use crate::dialect::LockMode;
use crate::entity::Entity;
use crate::error::{EngineError, Result};
use crate::exec::ExecutionContext;
use crate::request::QueryRequest;
use crate::value::CellValue;

impl Engine {
    async fn execute_in(&self, unit: &mut Unit, req: &QueryRequest, ctx: &mut ExecutionContext) -> Result<u64> {
        let prepared = self.prepare(unit, req, SqlKind::Update, ctx).await?;
        let session = self.session(unit, &prepared.data_source, ctx).await?;
        let mut affected = 0;
        for sql in prepared.routed(&prepared.bound.sql) {
            affected += session.execute(&sql, &prepared.bound.params, ctx).await?;
        }
        Ok(affected)
    }

    /// Run an insert/update/delete statement once per routed table.
    /// Returns the summed affected-row count.
    pub async fn execute(&self, req: QueryRequest) -> Result<u64> {
        let mut ctx = self.context("execute", req.statement());
        let mut unit = Unit::default();
        let result = self.execute_in(&mut unit, &req, &mut ctx).await;
        let result = unit.close(result, self.commit_flag(&req)).await;
        ctx.complete(result)
    }

    async fn batch_in<T: Serialize>(
        &self,
        unit: &mut Unit,
        req: &QueryRequest,
        rows: &[T],
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        // (data source, routed sql) -> parameter rows, in first-seen order
        let mut groups: Vec<((String, String), Vec<Vec<CellValue>>)> = Vec::new();
        for row in rows {
            let row_req = req.clone().bind_object(row);
            let prepared = self.prepare(unit, &row_req, SqlKind::Update, ctx).await?;
            for sql in prepared.routed(&prepared.bound.sql) {
                let key = (prepared.data_source.clone(), sql);
                let params = prepared.bound.params.clone();
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, members)) => members.push(params),
                    None => groups.push((key, vec![params])),
                }
            }
        }
        let mut tally = Tally::default();
        for ((data_source, sql), params) in &groups {
            let session = self.session(unit, data_source, ctx).await?;
            self.run_chunks(session, sql, params, &mut tally, ctx).await?;
        }
        Ok(tally.affected)
    }

    /// One write statement bound to each row's attributes and submitted in
    /// chunks. Rows whose optional blocks differ end up in separate groups.
    pub async fn batch_update<T: Serialize>(&self, req: QueryRequest, rows: &[T]) -> Result<u64> {
        let mut ctx = self.context("batch_update", req.statement());
        let mut unit = Unit::default();
        let result = self.batch_in(&mut unit, &req, rows, &mut ctx).await;
        let result = unit.close(result, self.commit_flag(&req)).await;
        ctx.complete(result)
    }

    async fn delete_where_in<E: Entity>(
        &self,
        unit: &mut Unit,
        req: &QueryRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let desc = self.descriptor_of::<E>()?;
        let bound = SqlTemplate::parse(req.statement())?.bind(req)?;
        if bound.sql.trim().is_empty() {
            return Err(EngineError::binding(format!(
                "refusing to delete every `{}` row: the condition is empty",
                desc.type_name
            )));
        }
        let mut affected = 0;
        for target in self.targets_by(&desc, &|f| req.named(f))? {
            let sql = format!("DELETE FROM {} WHERE {}", target.table, bound.sql);
            let session = self.session(unit, &target.data_source, ctx).await?;
            affected += session.execute(&sql, &bound.params, ctx).await?;
        }
        Ok(affected)
    }

    /// Delete `E` rows matching the request's condition (a `WHERE` body with
    /// named parameters). Sharding values are taken from the parameters;
    /// without them every shard table is hit. Cascades are not followed.
    pub async fn delete_by_query<E: Entity>(&self, req: QueryRequest) -> Result<u64> {
        let mut ctx = self.context("delete_by_query", E::TYPE_NAME);
        let mut unit = Unit::default();
        let result = self.delete_where_in::<E>(&mut unit, &req, &mut ctx).await;
        let result = unit.close(result, self.commit_flag(&req)).await;
        ctx.complete(result)
    }

    async fn update_fetch_in<E: Entity, F: FnMut(&mut E)>(
        &self,
        unit: &mut Unit,
        req: &QueryRequest,
        mut mutate: F,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<E>> {
        let searched = self.search(unit, req, SearchMode::All, ctx).await?;
        let mut items: Vec<E> = self.models(searched.data, ctx)?;
        if items.is_empty() {
            return Ok(items);
        }
        items.iter_mut().for_each(&mut mutate);
        let desc = self.descriptor_of::<E>()?;
        let mut records = self.records_of(&desc, &items)?;
        let mut tally = Tally::default();
        self.update_tree(unit, desc, &mut records, false, &[], false, &mut tally, ctx)
            .await?;
        ctx.log(format!("{} fetched row(s) updated", tally.affected));
        Ok(items)
    }

    /// Select rows under a row lock (an upgrade lock unless the request
    /// names one), let `mutate` change them and update them by key in the
    /// same transaction. Returns the changed entities.
    pub async fn update_fetch<E, F>(&self, req: QueryRequest, mutate: F) -> Result<Vec<E>>
    where
        E: Entity,
        F: FnMut(&mut E) + Send,
    {
        let req = match req.lock_mode() {
            LockMode::None => req.lock(LockMode::Upgrade),
            _ => req,
        };
        let mut ctx = self.context("update_fetch", req.statement());
        let mut unit = Unit::default();
        let result = self.update_fetch_in(&mut unit, &req, mutate, &mut ctx).await;
        let result = unit.close(result, self.commit_flag(&req)).await;
        ctx.complete(result)
    }
}
