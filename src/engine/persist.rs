//! Entity writes: save, update, save-or-update and delete, each with its
//! cascade children, all inside one unit of work per call.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use super::{probe_record, Engine, Tally, Unit};
use crate::entity::{sql, CascadeModel, Entity, EntityDescriptor, KeyStrategy, Record};
use crate::error::{EngineError, Result};
use crate::exec::{ExecutionContext, ExtractLimits};
use crate::idgen::IdRequest;
use crate::value::CellValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    /// Insert rows whose key is not stored yet, skip the rest.
    IgnoreExisting,
    Upsert,
}

/// Column of an attribute, the attribute itself when it is not mapped.
fn column_of(desc: &EntityDescriptor, attribute: &str) -> String {
    desc.field(attribute)
        .map(|f| f.column.clone())
        .unwrap_or_else(|| attribute.to_string())
}

/// Move the supplied children of every record out into one list, with the
/// parent's key copied into their mapped fields. The counts put them back
/// with [`restore_children`]; `None` marks a parent that supplied none.
fn take_children(
    parent: &EntityDescriptor,
    cascade: &CascadeModel,
    records: &mut [Record],
) -> (Vec<Record>, Vec<Option<usize>>) {
    let mut all = Vec::new();
    let mut counts = Vec::with_capacity(records.len());
    for record in records.iter_mut() {
        let keys = record.key_values(parent);
        match record.children_mut(&cascade.property) {
            Some(children) => {
                for child in children.iter_mut() {
                    for (field, value) in cascade.mapped_fields.iter().zip(&keys) {
                        child.set(field, value.clone());
                    }
                }
                counts.push(Some(children.len()));
                all.append(children);
            }
            None => counts.push(None),
        }
    }
    (all, counts)
}

fn restore_children(
    cascade: &CascadeModel,
    records: &mut [Record],
    children: Vec<Record>,
    counts: Vec<Option<usize>>,
) {
    let mut rest = children.into_iter();
    for (record, count) in records.iter_mut().zip(counts) {
        if let Some(n) = count {
            record.set_children(&cascade.property, rest.by_ref().take(n).collect());
        }
    }
}

fn require_keys(desc: &EntityDescriptor, records: &[Record], what: &str) -> Result<()> {
    match records.iter().any(|r| !r.has_key(desc)) {
        true => Err(EngineError::binding(format!(
            "cannot {} `{}` without a key value",
            what, desc.type_name
        ))),
        false => Ok(()),
    }
}

impl Engine {
    /// Business id for a record, from the entity's business-id settings.
    pub(crate) fn business_id_of(&self, desc: &EntityDescriptor, record: &Record) -> Result<CellValue> {
        let biz = desc.business_id.as_ref().ok_or_else(|| {
            EngineError::config_parse(format!("`{}` declares no business id", desc.type_name))
        })?;
        let column_type = desc
            .field(&biz.field)
            .map(|f| f.column_type)
            .unwrap_or_default();
        let mut request = IdRequest::new(desc.table.clone(), column_type);
        request.signature = biz.signature.clone();
        request.related_columns = biz.related_fields.iter().map(|f| column_of(desc, f)).collect();
        request.related_values = record.values_of(&biz.related_fields);
        request.length = biz.length;
        request.sequence_size = biz.sequence_size;
        self.id_generator.next_id(&request)
    }

    /// Generated keys and business ids for the selected records that lack
    /// them.
    fn assign_keys(&self, desc: &EntityDescriptor, records: &mut [Record], selected: &[usize]) -> Result<()> {
        for &i in selected {
            if let KeyStrategy::Generator {
                length,
                sequence_size,
            } = &desc.key_strategy
            {
                for key in desc.key_fields() {
                    if records[i].value(&key.attribute).is_null() {
                        let mut request = IdRequest::new(desc.table.clone(), key.column_type);
                        request.length = *length;
                        request.sequence_size = *sequence_size;
                        let id = self.id_generator.next_id(&request)?;
                        records[i].set(&key.attribute, id);
                    }
                }
            }
            if let Some(biz) = &desc.business_id {
                if records[i].value(&biz.field).is_null() {
                    let id = self.business_id_of(desc, &records[i])?;
                    records[i].set(&biz.field, id);
                }
            }
        }
        Ok(())
    }

    /// Insert or upsert the selected records, grouped per routed table and
    /// submitted in chunks.
    #[allow(clippy::too_many_arguments)]
    async fn write_rows(
        &self,
        unit: &mut Unit,
        desc: &EntityDescriptor,
        records: &mut [Record],
        selected: Vec<usize>,
        mode: WriteMode,
        force: &[String],
        tally: &mut Tally,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        for (target, members) in self.group_by_target(desc, records, selected)? {
            let session = self.session(unit, &target.data_source, ctx).await?;
            if let KeyStrategy::Sequence { name } = &desc.key_strategy {
                let next = session.dialect().sequence_query(name)?;
                for &i in &members {
                    for key in desc.key_fields() {
                        if !records[i].value(&key.attribute).is_null() {
                            continue;
                        }
                        let extraction = session
                            .query(&next, &[], ExtractLimits::unbounded(), ctx)
                            .await?;
                        let value = extraction
                            .result
                            .rows
                            .into_iter()
                            .next()
                            .and_then(|row| row.into_iter().next())
                            .ok_or_else(|| {
                                EngineError::mapping(format!("sequence `{}` returned no value", name))
                            })?;
                        records[i].set(&key.attribute, value.coerce(key.column_type));
                    }
                }
            }
            let (statement, attributes) = match mode {
                WriteMode::Insert => {
                    let plan = sql::insert(desc, &target.table);
                    (plan.sql, plan.attributes)
                }
                WriteMode::IgnoreExisting => {
                    let (upsert, attributes) = sql::upsert_target(desc, &target.table, &[]);
                    (session.dialect().insert_ignore(&upsert)?, attributes)
                }
                WriteMode::Upsert => {
                    let (upsert, attributes) = sql::upsert_target(desc, &target.table, force);
                    (session.dialect().upsert(&upsert)?, attributes)
                }
            };
            let rows: Vec<Vec<CellValue>> = members
                .iter()
                .map(|&i| records[i].values_of(&attributes))
                .collect();
            self.run_chunks(session, &statement, &rows, tally, ctx).await?;
        }
        Ok(())
    }

    async fn update_rows(
        &self,
        unit: &mut Unit,
        desc: &EntityDescriptor,
        records: &[Record],
        force: &[String],
        tally: &mut Tally,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        for (target, members) in self.group_by_target(desc, records, 0..records.len())? {
            let Some(plan) = sql::update(desc, &target.table, force) else {
                ctx.log(format!("`{}` has only key columns, nothing to update", desc.type_name));
                return Ok(());
            };
            let rows: Vec<Vec<CellValue>> = members.iter().map(|&i| plan.params(&records[i])).collect();
            let session = self.session(unit, &target.data_source, ctx).await?;
            self.run_chunks(session, &plan.sql, &rows, tally, ctx).await?;
        }
        Ok(())
    }

    /// Delete (or invalidate) stored children of one parent that are not
    /// among the supplied ones.
    async fn remove_stale(
        &self,
        unit: &mut Unit,
        child: &EntityDescriptor,
        cascade: &CascadeModel,
        parent_keys: &[CellValue],
        supplied: &[Record],
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let invalidate = match &cascade.invalidate {
            Some(inv) => Some((column_of(child, &inv.field), CellValue::from_json(&inv.value))),
            None if cascade.delete => None,
            None => {
                ctx.log(format!("stale `{}` rows kept: cascade deletes nothing", child.type_name));
                return Ok(());
            }
        };
        let keep: Vec<&Record> = supplied.iter().filter(|c| c.has_key(child)).collect();
        let probe = probe_record(&cascade.mapped_fields, parent_keys);
        for target in self.targets_of(child, &probe)? {
            let statement = sql::stale_children(
                child,
                &target.table,
                &cascade.mapped_fields,
                keep.len(),
                invalidate.as_ref().map(|(column, _)| column.as_str()),
            );
            let mut params = Vec::new();
            if let Some((_, value)) = &invalidate {
                params.push(value.clone());
            }
            params.extend(parent_keys.iter().cloned());
            for kept in &keep {
                params.extend(kept.key_values(child));
            }
            let session = self.session(unit, &target.data_source, ctx).await?;
            let n = session.execute(&statement, &params, ctx).await?;
            ctx.log(format!("{} stale `{}` row(s) replaced", n, child.type_name));
        }
        Ok(())
    }

    /// Insert records, then their supplied children. Returns the rows
    /// written at this level.
    fn save_tree<'a>(
        &'a self,
        unit: &'a mut Unit,
        desc: Arc<EntityDescriptor>,
        records: &'a mut [Record],
        mode: WriteMode,
        tally: &'a mut Tally,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<u64>> {
        async move {
            let all: Vec<usize> = (0..records.len()).collect();
            self.assign_keys(&desc, records, &all)?;
            let before = tally.affected;
            self.write_rows(unit, &desc, records, all, mode, &[], tally, ctx)
                .await?;
            let written = tally.affected - before;
            for cascade in &desc.cascades {
                let child = self.entity_desc(&cascade.child_type)?;
                let (mut children, counts) = take_children(&desc, cascade, records);
                if !children.is_empty() {
                    self.save_tree(unit, child, &mut children, mode, tally, ctx)
                        .await?;
                }
                restore_children(cascade, records, children, counts);
            }
            Ok(written)
        }
        .boxed()
    }

    /// Update (or upsert) records. With `cascade`, supplied child sets
    /// replace the stored ones and are upserted in turn.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn update_tree<'a>(
        &'a self,
        unit: &'a mut Unit,
        desc: Arc<EntityDescriptor>,
        records: &'a mut [Record],
        upsert: bool,
        force: &'a [String],
        cascade: bool,
        tally: &'a mut Tally,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<u64>> {
        async move {
            let before = tally.affected;
            if upsert {
                let (keyed, fresh): (Vec<usize>, Vec<usize>) =
                    (0..records.len()).partition(|&i| records[i].has_key(&desc));
                if !keyed.is_empty() {
                    self.write_rows(unit, &desc, records, keyed, WriteMode::Upsert, force, tally, ctx)
                        .await?;
                }
                if !fresh.is_empty() {
                    self.assign_keys(&desc, records, &fresh)?;
                    self.write_rows(unit, &desc, records, fresh, WriteMode::Insert, &[], tally, ctx)
                        .await?;
                }
            } else {
                require_keys(&desc, records, "update")?;
                self.update_rows(unit, &desc, records, force, tally, ctx).await?;
            }
            let written = tally.affected - before;
            if !cascade {
                return Ok(written);
            }
            for model in desc.cascades.iter().filter(|c| c.update) {
                let child = self.entity_desc(&model.child_type)?;
                let (mut children, counts) = take_children(&desc, model, records);
                if model.replace_children {
                    let mut offset = 0;
                    for (record, count) in records.iter().zip(&counts) {
                        let Some(n) = *count else {
                            continue;
                        };
                        let keys = record.key_values(&desc);
                        self.remove_stale(unit, &child, model, &keys, &children[offset..offset + n], ctx)
                            .await?;
                        offset += n;
                    }
                }
                if !children.is_empty() {
                    self.update_tree(unit, Arc::clone(&child), &mut children, true, &[], true, tally, ctx)
                        .await?;
                }
                restore_children(model, records, children, counts);
            }
            Ok(written)
        }
        .boxed()
    }

    /// Children first, then the records themselves. Children that have
    /// cascades of their own are loaded and deleted the same way.
    fn delete_tree<'a>(
        &'a self,
        unit: &'a mut Unit,
        desc: Arc<EntityDescriptor>,
        records: &'a [Record],
        tally: &'a mut Tally,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<u64>> {
        async move {
            require_keys(&desc, records, "delete")?;
            for cascade in &desc.cascades {
                if cascade.invalidate.is_none() && !cascade.delete {
                    continue;
                }
                let child = self.entity_desc(&cascade.child_type)?;
                for record in records {
                    let keys = record.key_values(&desc);
                    let probe = probe_record(&cascade.mapped_fields, &keys);
                    for target in self.targets_of(&child, &probe)? {
                        let session = self.session(unit, &target.data_source, ctx).await?;
                        match &cascade.invalidate {
                            Some(inv) => {
                                let column = column_of(&child, &inv.field);
                                let statement = sql::stale_children(
                                    &child,
                                    &target.table,
                                    &cascade.mapped_fields,
                                    0,
                                    Some(&column),
                                );
                                let mut params = vec![CellValue::from_json(&inv.value)];
                                params.extend(keys.iter().cloned());
                                session.execute(&statement, &params, ctx).await?;
                            }
                            None if child.cascades.is_empty() => {
                                let plan = sql::delete_where(&child, &target.table, &cascade.mapped_fields);
                                session.execute(&plan.sql, &keys, ctx).await?;
                            }
                            None => {
                                let plan = sql::select_where(&child, &target.table, &cascade.mapped_fields);
                                let stored = self
                                    .fetch_records(session, &plan.sql, &keys, &child, ctx)
                                    .await?;
                                if !stored.is_empty() {
                                    self.delete_tree(unit, Arc::clone(&child), &stored, tally, ctx)
                                        .await?;
                                }
                            }
                        }
                    }
                }
            }
            let before = tally.affected;
            for (target, members) in self.group_by_target(&desc, records, 0..records.len())? {
                let plan = sql::delete_by_key(&desc, &target.table);
                let rows: Vec<Vec<CellValue>> = members.iter().map(|&i| plan.params(&records[i])).collect();
                let session = self.session(unit, &target.data_source, ctx).await?;
                self.run_chunks(session, &plan.sql, &rows, tally, ctx).await?;
            }
            Ok(tally.affected - before)
        }
        .boxed()
    }

    pub(super) fn records_of<E: Entity>(&self, desc: &EntityDescriptor, entities: &[E]) -> Result<Vec<Record>> {
        entities
            .iter()
            .map(|e| Record::from_entity(e, desc, self.source()))
            .collect()
    }

    /// Copy stored attribute values, and the children that were written,
    /// back into the caller's entity.
    fn write_back<E: Entity>(&self, entity: &mut E, record: &Record, desc: &EntityDescriptor) -> Result<()> {
        let mut json = serde_json::to_value(&*entity)
            .map_err(|e| EngineError::mapping(format!("cannot serialize `{}`: {}", desc.type_name, e)))?;
        let stored = record.to_json(desc, self.source())?;
        if let (Some(target), Some(source)) = (json.as_object_mut(), stored.as_object()) {
            for field in &desc.fields {
                if let Some(value) = source.get(&field.attribute) {
                    target.insert(field.attribute.clone(), value.clone());
                }
            }
            for cascade in &desc.cascades {
                if record.children(&cascade.property).is_none() {
                    continue;
                }
                if let Some(value) = source.get(&cascade.property) {
                    target.insert(cascade.property.clone(), value.clone());
                }
            }
        }
        *entity = serde_json::from_value(json)
            .map_err(|e| EngineError::mapping(format!("cannot rebuild `{}`: {}", desc.type_name, e)))?;
        Ok(())
    }

    async fn save_entities<E: Entity>(
        &self,
        entities: &mut [E],
        mode: WriteMode,
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let desc = self.descriptor_of::<E>()?;
        let mut records = self.records_of(&desc, entities)?;
        let mut unit = Unit::default();
        let mut tally = Tally::default();
        let result = self
            .save_tree(&mut unit, Arc::clone(&desc), &mut records, mode, &mut tally, ctx)
            .await;
        let written = unit.close(result, self.settings.auto_commit).await?;
        for (entity, record) in entities.iter_mut().zip(&records) {
            self.write_back(entity, record, &desc)?;
        }
        Ok(written)
    }

    async fn update_entities(
        &self,
        desc: &Arc<EntityDescriptor>,
        records: &mut [Record],
        upsert: bool,
        force: &[String],
        cascade: bool,
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let mut unit = Unit::default();
        let mut tally = Tally::default();
        let result = self
            .update_tree(&mut unit, Arc::clone(desc), records, upsert, force, cascade, &mut tally, ctx)
            .await;
        unit.close(result, self.settings.auto_commit).await
    }

    async fn update_with<E: Entity>(
        &self,
        entities: &[E],
        force: Option<&[&str]>,
        cascade: bool,
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let desc = self.descriptor_of::<E>()?;
        let mut records = self.records_of(&desc, entities)?;
        // no list means every non-key attribute, nulls included
        let force: Vec<String> = match force {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => desc.non_key_fields().iter().map(|f| f.attribute.clone()).collect(),
        };
        self.update_entities(&desc, &mut records, false, &force, cascade, ctx)
            .await
    }

    async fn upsert_with<E: Entity>(
        &self,
        entities: &mut [E],
        force: &[&str],
        ctx: &mut ExecutionContext,
    ) -> Result<u64> {
        let desc = self.descriptor_of::<E>()?;
        let mut records = self.records_of(&desc, entities)?;
        let force: Vec<String> = force.iter().map(|n| n.to_string()).collect();
        let written = self
            .update_entities(&desc, &mut records, true, &force, true, ctx)
            .await?;
        for (entity, record) in entities.iter_mut().zip(&records) {
            self.write_back(entity, record, &desc)?;
        }
        Ok(written)
    }

    async fn delete_with<E: Entity>(&self, entities: &[E], ctx: &mut ExecutionContext) -> Result<u64> {
        let desc = self.descriptor_of::<E>()?;
        let records = self.records_of(&desc, entities)?;
        let mut unit = Unit::default();
        let mut tally = Tally::default();
        let result = self
            .delete_tree(&mut unit, desc, &records, &mut tally, ctx)
            .await;
        unit.close(result, self.settings.auto_commit).await
    }

    /// Insert an entity and its supplied children. Generated keys are
    /// written back.
    pub async fn save<E: Entity>(&self, entity: &mut E) -> Result<u64> {
        let mut ctx = self.context("save", E::TYPE_NAME);
        let result = self
            .save_entities(std::slice::from_mut(entity), WriteMode::Insert, &mut ctx)
            .await;
        ctx.complete(result)
    }

    pub async fn save_all<E: Entity>(&self, entities: &mut [E]) -> Result<u64> {
        let mut ctx = self.context("save_all", E::TYPE_NAME);
        let result = self.save_entities(entities, WriteMode::Insert, &mut ctx).await;
        ctx.complete(result)
    }

    /// Like [`save_all`](Self::save_all), skipping rows whose key is
    /// already stored.
    pub async fn save_all_ignore_existing<E: Entity>(&self, entities: &mut [E]) -> Result<u64> {
        let mut ctx = self.context("save_all", E::TYPE_NAME);
        let result = self
            .save_entities(entities, WriteMode::IgnoreExisting, &mut ctx)
            .await;
        ctx.complete(result)
    }

    /// Update by key. Null attributes keep the stored value unless named
    /// in `force`.
    pub async fn update<E: Entity>(&self, entity: &E, force: &[&str]) -> Result<u64> {
        let mut ctx = self.context("update", E::TYPE_NAME);
        let result = self
            .update_with(std::slice::from_ref(entity), Some(force), false, &mut ctx)
            .await;
        ctx.complete(result)
    }

    /// Update every non-key attribute, writing nulls as nulls.
    pub async fn update_deeply<E: Entity>(&self, entity: &E) -> Result<u64> {
        let mut ctx = self.context("update", E::TYPE_NAME);
        let result = self
            .update_with(std::slice::from_ref(entity), None, false, &mut ctx)
            .await;
        ctx.complete(result)
    }

    /// Update the entity, then make each supplied child collection the
    /// stored one: missing children are deleted (or invalidated) unless
    /// the cascade keeps unlisted rows, the rest are upserted.
    pub async fn update_cascade<E: Entity>(&self, entity: &E, force: &[&str]) -> Result<u64> {
        let mut ctx = self.context("update", E::TYPE_NAME);
        let result = self
            .update_with(std::slice::from_ref(entity), Some(force), true, &mut ctx)
            .await;
        ctx.complete(result)
    }

    pub async fn update_all<E: Entity>(&self, entities: &[E], force: &[&str]) -> Result<u64> {
        let mut ctx = self.context("update_all", E::TYPE_NAME);
        let result = self.update_with(entities, Some(force), false, &mut ctx).await;
        ctx.complete(result)
    }

    pub async fn update_all_deeply<E: Entity>(&self, entities: &[E]) -> Result<u64> {
        let mut ctx = self.context("update_all", E::TYPE_NAME);
        let result = self.update_with(entities, None, false, &mut ctx).await;
        ctx.complete(result)
    }

    /// Upsert by key; entities without a key are inserted with a generated
    /// one. Supplied children are handled as in
    /// [`update_cascade`](Self::update_cascade).
    pub async fn save_or_update<E: Entity>(&self, entity: &mut E, force: &[&str]) -> Result<u64> {
        let mut ctx = self.context("save_or_update", E::TYPE_NAME);
        let result = self
            .upsert_with(std::slice::from_mut(entity), force, &mut ctx)
            .await;
        ctx.complete(result)
    }

    pub async fn save_or_update_all<E: Entity>(&self, entities: &mut [E], force: &[&str]) -> Result<u64> {
        let mut ctx = self.context("save_or_update", E::TYPE_NAME);
        let result = self.upsert_with(entities, force, &mut ctx).await;
        ctx.complete(result)
    }

    /// Delete by key, children first.
    pub async fn delete<E: Entity>(&self, entity: &E) -> Result<u64> {
        let mut ctx = self.context("delete", E::TYPE_NAME);
        let result = self.delete_with(std::slice::from_ref(entity), &mut ctx).await;
        ctx.complete(result)
    }

    pub async fn delete_all<E: Entity>(&self, entities: &[E]) -> Result<u64> {
        let mut ctx = self.context("delete_all", E::TYPE_NAME);
        let result = self.delete_with(entities, &mut ctx).await;
        ctx.complete(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::config::EngineSettings;
    use crate::error::ErrorKind;
    use crate::exec::testing::{Call, MockDatabase};

    fn batches(db: &MockDatabase) -> Vec<(String, String, usize)> {
        db.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Batch {
                    data_source,
                    sql,
                    rows,
                } => Some((data_source, sql, rows)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_save_all_in_chunks() {
        let db = MockDatabase::new();
        let engine = builder(&db)
            .settings(EngineSettings {
                auto_commit: true,
                ..Default::default()
            })
            .build();
        let mut staffs: Vec<Staff> = (0..125).map(|i| Staff::with_id(&format!("S{}", i))).collect();
        let affected = engine.save_all(&mut staffs).await.unwrap();
        assert_eq!(affected, 125);
        let sizes: Vec<usize> = batches(&db).iter().map(|b| b.2).collect();
        assert_eq!(sizes, vec![50, 50, 25]);
        assert!(db.calls().contains(&Call::Commit("default".into())));
    }

    #[tokio::test]
    async fn test_failed_chunk_reports_progress() {
        let db = MockDatabase::new();
        db.fail_batch_at(1);
        let engine = engine(&db);
        let mut staffs: Vec<Staff> = (0..125).map(|i| Staff::with_id(&format!("S{}", i))).collect();
        let err = engine.save_all(&mut staffs).await.unwrap_err();
        match err.kind {
            ErrorKind::Batch {
                completed_chunks,
                affected,
                ..
            } => {
                assert_eq!(completed_chunks, 1);
                assert_eq!(affected, 50);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // the third chunk never ran
        assert_eq!(batches(&db).len(), 2);
        assert!(db.calls().contains(&Call::Rollback("default".into())));
    }

    #[tokio::test]
    async fn test_save_generates_keys_and_cascades() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let mut dept = Dept::with_id("D1");
        dept.staffs = Some(vec![Staff::default(), Staff::default()]);
        engine.save(&mut dept).await.unwrap();

        let staffs = dept.staffs.unwrap();
        assert!(staffs.iter().all(|s| s.staff_id.is_some()));
        assert_ne!(staffs[0].staff_id, staffs[1].staff_id);
        assert!(staffs.iter().all(|s| s.dept_id.as_deref() == Some("D1")));

        let written = batches(&db);
        assert!(written[0].1.starts_with("INSERT INTO sys_dept"));
        assert!(written[1].1.starts_with("INSERT INTO sys_staff"));
        assert_eq!(written[1].2, 2);
    }

    #[tokio::test]
    async fn test_cascading_save_on_spawned_task() {
        let db = MockDatabase::new();
        let engine = std::sync::Arc::new(engine(&db));
        let task = tokio::spawn({
            let engine = std::sync::Arc::clone(&engine);
            async move {
                let mut dept = Dept::with_id("D1");
                dept.staffs = Some(vec![Staff::default()]);
                engine.save(&mut dept).await.map(|n| (n, dept))
            }
        });
        let (_, dept) = task.await.unwrap().unwrap();
        assert!(dept.staffs.unwrap()[0].staff_id.is_some());
        assert_eq!(batches(&db).len(), 2);
    }

    #[tokio::test]
    async fn test_update_cascade_replaces_children() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let mut dept = Dept::with_id("D1");
        dept.dept_name = Some("Sales".into());
        dept.staffs = Some(vec![Staff::with_id("S1"), Staff::default()]);
        engine.update_cascade(&dept, &[]).await.unwrap();

        let sqls = db.sqls();
        assert_eq!(
            sqls[0],
            "UPDATE sys_dept SET dept_name = COALESCE($1, dept_name) WHERE dept_id = $2"
        );
        assert_eq!(
            sqls[1],
            "DELETE FROM sys_staff WHERE dept_id = $1 AND NOT (staff_id IN ($2))"
        );
        assert!(sqls[2].contains("ON CONFLICT (staff_id) DO UPDATE"));
        assert!(sqls[3].starts_with("INSERT INTO sys_staff (staff_id"));
    }

    #[tokio::test]
    async fn test_update_without_key_is_rejected() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let err = engine.update(&Staff::default(), &[]).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ParameterBinding(_)));
        assert!(db.sqls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_children_first() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        engine.delete(&Dept::with_id("D1")).await.unwrap();
        let sqls = db.sqls();
        assert_eq!(sqls[0], "DELETE FROM sys_staff WHERE dept_id = $1");
        assert_eq!(sqls[1], "DELETE FROM sys_dept WHERE dept_id = $1");
    }

    #[tokio::test]
    async fn test_sharded_save_is_deterministic() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let mut ledgers: Vec<Ledger> = (1..=4)
            .map(|i| Ledger {
                ledger_id: Some(i),
                amount: Some(10.0),
            })
            .collect();
        engine.save_all(&mut ledgers).await.unwrap();
        engine.save_all(&mut ledgers).await.unwrap();
        let written = batches(&db);
        assert_eq!(written.len(), 4);
        assert_eq!(written[0].0, "ds1");
        assert!(written[0].1.starts_with("INSERT INTO ledger_1 "));
        assert_eq!(written[1].0, "ds0");
        assert!(written[1].1.starts_with("INSERT INTO ledger_0 "));
        assert_eq!(written[0], written[2]);
        assert_eq!(written[1], written[3]);
    }
}
