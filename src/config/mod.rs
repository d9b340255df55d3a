pub mod catalog;
pub mod descriptor;
pub mod resolver;
pub mod settings;
pub mod template;

pub use catalog::{Catalog, ConfigSource};
pub use descriptor::{
    Align, ChainRelative, ColsChain, Decorate, Format, FormatKind, Link, MaskKind,
    NoSqlDescriptor, Pivot, RawStatement, Rounding, RowsChain, SecureMask, ShapingDirectives,
    SqlKind, StatementDescriptor, Translate, Unpivot,
};
pub use resolver::{is_literal_sql, ConfigResolver};
pub use settings::EngineSettings;
pub use template::{BoundSql, ParamLookup, SqlTemplate};
