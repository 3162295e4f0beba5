//! Declarative typed schema: column/table metadata with chainable builders,
//! serializable snapshots, and the forward-only migration diff engine.

pub mod column;
pub mod migrate;
pub mod snapshot;
pub mod table;

pub use column::{
    blob,
    boolean,
    date,
    enumeration,
    id,
    integer,
    json,
    real,
    snake_case,
    text,
    AppType,
    ColumnBuilder,
    ColumnMeta,
    InsertType,
    StorageType,
};
pub use migrate::{
    diff,
    MigrationPlan,
    MigrationStep,
};
pub use snapshot::{
    canonical_string,
    ColumnSnapshot,
    SchemaSnapshot,
    TableSnapshot,
};
pub use table::{
    constraint,
    index,
    no_constraints,
    no_indexes,
    table,
    ConstraintKind,
    ConstraintMeta,
    IndexMeta,
    Schema,
    TableMeta,
};

/// Fatal at DB-open: a declared schema cannot be reached from the stored one
/// (or is invalid on its own). No writes are allowed once raised.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("column {table}.{column} changed its {what}; migrations never mutate columns in place")]
    ColumnMutationNotSupported {
        table: String,
        column: String,
        what: String,
    },
    #[error("table {table} changed PRIMARY KEY/UNIQUE constraints after creation")]
    ConstraintChange { table: String },
    #[error("ambiguous rename: {0}")]
    AmbiguousRename(String),
    #[error("cannot rename generated column {table}.{column}")]
    RenameOfGeneratedColumn { table: String, column: String },
    #[error("table name {0} uses the reserved '_' prefix")]
    ReservedTableName(String),
}
