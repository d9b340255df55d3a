//! Catalog, entities and engine wiring shared by the engine tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Engine, EngineBuilder};
use crate::cache::MemoryTranslationCache;
use crate::config::{Catalog, RawStatement};
use crate::entity::{CascadeModel, Entity, EntityDescriptor, KeyStrategy};
use crate::exec::testing::MockDatabase;
use crate::sharding::{HashModStrategy, ShardingConfig, StrategyRef, TableSharding};
use crate::value::ColumnType;

pub use crate::request::QueryRequest;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Staff {
    pub staff_id: Option<String>,
    pub staff_name: Option<String>,
    pub dept_id: Option<String>,
    pub status: Option<i64>,
}

impl Staff {
    pub fn with_id(id: &str) -> Self {
        Self {
            staff_id: Some(id.to_string()),
            ..Default::default()
        }
    }
}

impl Entity for Staff {
    const TYPE_NAME: &'static str = "Staff";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dept {
    pub dept_id: Option<String>,
    pub dept_name: Option<String>,
    pub staffs: Option<Vec<Staff>>,
}

impl Dept {
    pub fn with_id(id: &str) -> Self {
        Self {
            dept_id: Some(id.to_string()),
            ..Default::default()
        }
    }
}

impl Entity for Dept {
    const TYPE_NAME: &'static str = "Dept";
}

/// Spread over `ds0`/`ds1` and `ledger_0`/`ledger_1` by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub ledger_id: Option<i64>,
    pub amount: Option<f64>,
}

impl Entity for Ledger {
    const TYPE_NAME: &'static str = "Ledger";
}

pub fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.add_statement(RawStatement::new(
        "staff_list",
        "select staff_id, staff_name, status from sys_staff where 1=1 #[and status = :status] order by staff_id",
    ));
    let mut ledgers = RawStatement::new(
        "ledger_list",
        "select ledger_id, amount from ledger where 1=1 #[and ledger_id = :ledgerId] order by ledger_id",
    );
    ledgers.sharding = Some(ShardingConfig {
        data_source: None,
        tables: vec![TableSharding {
            table: "ledger".to_string(),
            strategy: "hash".to_string(),
            fields: vec!["ledgerId".to_string()],
        }],
    });
    catalog.add_statement(ledgers);
    catalog.register_entity(
        EntityDescriptor::builder("Staff", "sys_staff")
            .key("staffId", "staff_id", ColumnType::Text)
            .field("staffName", "staff_name", ColumnType::Text)
            .field("deptId", "dept_id", ColumnType::Text)
            .field("status", "status", ColumnType::Int64)
            .key_strategy(KeyStrategy::Generator {
                length: 0,
                sequence_size: 0,
            })
            .build()
            .unwrap(),
    );
    catalog.register_entity(
        EntityDescriptor::builder("Dept", "sys_dept")
            .key("deptId", "dept_id", ColumnType::Text)
            .field("deptName", "dept_name", ColumnType::Text)
            .cascade(CascadeModel::one_to_many("staffs", "Staff", ["deptId"]))
            .build()
            .unwrap(),
    );
    let by_id = |strategy: &str| StrategyRef {
        strategy: strategy.to_string(),
        fields: vec!["ledgerId".to_string()],
    };
    catalog.register_entity(
        EntityDescriptor::builder("Ledger", "ledger")
            .key("ledgerId", "ledger_id", ColumnType::Int64)
            .field("amount", "amount", ColumnType::Float64)
            .sharding(ShardingConfig {
                data_source: Some(by_id("hash")),
                tables: vec![TableSharding {
                    table: "ledger".to_string(),
                    strategy: "hash".to_string(),
                    fields: vec!["ledgerId".to_string()],
                }],
            })
            .build()
            .unwrap(),
    );
    catalog
}

pub fn builder(db: &MockDatabase) -> EngineBuilder {
    let caches = MemoryTranslationCache::new();
    caches.put("status", vec![vec!["1".into(), "Active".into()]]);
    Engine::builder(Arc::new(catalog()), db.provider())
        .caches(Arc::new(caches))
        .strategy(
            "hash",
            Arc::new(HashModStrategy::new(vec!["ds0".to_string(), "ds1".to_string()], 2)),
        )
}

pub fn engine(db: &MockDatabase) -> Engine {
    builder(db).build()
}
