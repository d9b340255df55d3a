//! Translation-cache helpers usable outside a statement, and business ids
//! for entities built in memory.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::Engine;
use crate::config::Translate;
use crate::entity::{Entity, Record};
use crate::error::{EngineError, Result};
use crate::shaping::materialize::translate_objects;
use crate::shaping::RowMap;
use crate::value::CellValue;

impl Engine {
    /// Translate rows already in memory. Target attributes are overwritten.
    pub fn translate_maps(&self, rows: &mut [RowMap], translates: &[Translate]) {
        let mut ctx = self.context("translate", "<memory>");
        translate_objects(rows, translates, self.caches.as_deref(), false, &mut ctx);
        ctx.finish();
    }

    /// Translate a collection of serializable items, e.g. rows fetched
    /// elsewhere, through a JSON round trip.
    pub fn translate_items<T: Serialize + DeserializeOwned>(
        &self,
        items: Vec<T>,
        translates: &[Translate],
    ) -> Result<Vec<T>> {
        let mut rows = items
            .iter()
            .map(|item| match serde_json::to_value(item) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(EngineError::mapping("only structs and maps can be translated")),
                Err(e) => Err(EngineError::mapping(format!("cannot serialize item: {}", e))),
            })
            .collect::<Result<Vec<RowMap>>>()?;
        self.translate_maps(&mut rows, translates);
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(Value::Object(row))
                    .map_err(|e| EngineError::mapping(format!("cannot rebuild item: {}", e)))
            })
            .collect()
    }

    /// Name of a single key, `None` when the cache or key is unknown.
    pub fn translate_cache(&self, cache: &str, key: &str, index: usize) -> Option<CellValue> {
        let snapshot = self.caches.as_ref()?.snapshot(cache, None)?;
        snapshot.get(key).and_then(|row| row.get(index)).cloned()
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches
            .as_ref()
            .map(|c| c.cache_names())
            .unwrap_or_default()
    }

    pub fn exists_cache(&self, cache: &str) -> bool {
        self.caches.as_ref().is_some_and(|c| c.exists(cache))
    }

    /// Keys whose cached columns match `pattern`; see
    /// [`TranslationCache::match_keys`](crate::cache::TranslationCache::match_keys).
    pub fn cache_match_keys(&self, cache: &str, pattern: &str, columns: &[usize]) -> Result<Vec<String>> {
        match &self.caches {
            Some(c) => c.match_keys(cache, pattern, columns),
            None => Ok(Vec::new()),
        }
    }

    /// Business id the entity would receive on save.
    pub fn generate_business_id<E: Entity>(&self, entity: &E) -> Result<CellValue> {
        let desc = self.descriptor_of::<E>()?;
        let record = Record::from_entity(entity, &desc, self.source())?;
        self.business_id_of(&desc, &record)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::error::ErrorKind;
    use crate::exec::testing::MockDatabase;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Row {
        status: String,
        status_name: Option<String>,
    }

    #[test]
    fn test_translate_items() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let rows = vec![
            Row {
                status: "1".into(),
                status_name: None,
            },
            Row {
                status: "1".into(),
                status_name: Some("stale".into()),
            },
        ];
        let translates = [Translate::new("statusName", "status").key_column("status")];
        let rows = engine.translate_items(rows, &translates).unwrap();
        assert!(rows.iter().all(|r| r.status_name.as_deref() == Some("Active")));
    }

    #[test]
    fn test_cache_helpers() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        assert_eq!(engine.cache_names(), vec!["status"]);
        assert!(engine.exists_cache("status"));
        assert!(!engine.exists_cache("dept"));
        assert_eq!(
            engine.translate_cache("status", "1", 1),
            Some(CellValue::from("Active"))
        );
        assert_eq!(engine.translate_cache("status", "7", 1), None);
        assert_eq!(engine.cache_match_keys("status", "act", &[]).unwrap(), vec!["1"]);
    }

    #[test]
    fn test_business_id_needs_config() {
        let db = MockDatabase::new();
        let engine = engine(&db);
        let err = engine.generate_business_id(&Staff::default()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ConfigParse(_)));
    }
}
