//! Dialect-aware query and update engine.
//!
//! Statements live in a [`Catalog`] (TOML) or are passed as literal SQL.
//! The [`Engine`] resolves them for the dialect of the target data source,
//! routes them through the sharding rules, runs them and shapes the rows
//! (translation, decryption, masking, formatting, pivoting) before handing
//! them back as maps, tables or typed records. Entities registered in the
//! catalog get key-based loads and cascading saves, updates and deletes.

pub mod cache;
pub mod config;
pub mod dialect;
pub mod engine;
pub mod entity;
pub mod error;
pub mod exec;
pub mod export;
pub mod idgen;
pub mod request;
pub mod secure;
pub mod shaping;
pub mod sharding;
pub mod value;

pub use cache::{MemoryTranslationCache, TranslationCache};
pub use config::{Catalog, EngineSettings, SqlKind, Translate};
pub use dialect::{Dialect, LockMode};
pub use engine::{Engine, EngineBuilder, Page, Paging};
pub use entity::{CascadeModel, Entity, EntityDescriptor, KeyStrategy, Record};
pub use error::{EngineError, ErrorKind, Result};
pub use request::QueryRequest;
pub use shaping::{DataSet, RowMap, RowModel};
pub use value::{CellValue, ColumnType};
