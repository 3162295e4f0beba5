use std::sync::Arc;

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    column::{
        snake_case,
        ColumnBuilder,
        ColumnMeta,
    },
    SchemaError,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexMeta {
    /// Deterministic index name, so snapshots and DDL agree without storing
    /// one.
    pub fn name(&self, table_db_name: &str) -> String {
        format!("{}_{}_idx", table_db_name, self.columns.join("_"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintMeta {
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
}

/// Metadata of one declared table. Columns are ordered as declared; lookups
/// go by application name or storage name.
#[derive(Clone, Debug)]
pub struct TableMeta {
    pub name: String,
    pub db_name: String,
    pub columns: Vec<ColumnMeta>,
    pub indexes: Vec<IndexMeta>,
    pub constraints: Vec<ConstraintMeta>,
    pub renamed_from: Option<String>,
    /// Set on derived aliases used in joins; aliased tables share the
    /// original's storage.
    pub aliased_from: Option<String>,
}

impl TableMeta {
    pub fn column(&self, app_name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == app_name)
    }

    pub fn column_by_db_name(&self, db_name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.db_name == db_name)
    }

    /// `table.column` in storage naming, for qualified references.
    pub fn qualified(&self, app_name: &str) -> Option<String> {
        self.column(app_name)
            .map(|c| format!("{}.{}", self.db_name, c.db_name))
    }

    pub fn primary_key_column(&self) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.primary_key).or_else(|| {
            self.constraints
                .iter()
                .find(|c| c.kind == ConstraintKind::PrimaryKey)
                .and_then(|c| c.columns.first())
                .and_then(|name| self.column(name))
        })
    }

    /// Marks this table as renamed from a previous storage name.
    pub fn renamed_from(mut self, previous_db_name: impl Into<String>) -> Self {
        self.renamed_from = Some(previous_db_name.into());
        self
    }

    /// Derives an alias of this table for self-joins; the alias resolves to
    /// the same storage.
    pub fn aliased(&self, alias: impl Into<String>) -> TableMeta {
        let alias = alias.into();
        let mut out = self.clone();
        out.aliased_from = Some(self.name.clone());
        out.db_name = self.db_name.clone();
        out.name = alias;
        out
    }
}

/// Declares a table. Index and constraint factories receive the built table
/// so they can reference columns by application name.
pub fn table(
    name: impl Into<String>,
    columns: Vec<(&str, ColumnBuilder)>,
    indexes: impl FnOnce(&TableMeta) -> Vec<IndexMeta>,
    constraints: impl FnOnce(&TableMeta) -> Vec<ConstraintMeta>,
) -> Result<TableMeta, SchemaError> {
    let name = name.into();
    if name.starts_with('_') {
        return Err(SchemaError::ReservedTableName(name));
    }
    let db_name = snake_case(&name);
    let columns = columns
        .into_iter()
        .map(|(column_name, builder)| builder.build(column_name))
        .collect();
    let mut meta = TableMeta {
        name,
        db_name,
        columns,
        indexes: Vec::new(),
        constraints: Vec::new(),
        renamed_from: None,
        aliased_from: None,
    };
    meta.indexes = indexes(&meta);
    meta.constraints = constraints(&meta);
    Ok(meta)
}

pub fn no_indexes(_: &TableMeta) -> Vec<IndexMeta> {
    Vec::new()
}

pub fn no_constraints(_: &TableMeta) -> Vec<ConstraintMeta> {
    Vec::new()
}

/// Builds an index over application column names, translating to storage
/// names.
pub fn index(table: &TableMeta, columns: &[&str], unique: bool) -> IndexMeta {
    IndexMeta {
        columns: columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|c| c.db_name.clone())
                    .unwrap_or_else(|| snake_case(name))
            })
            .collect(),
        unique,
    }
}

pub fn constraint(table: &TableMeta, kind: ConstraintKind, columns: &[&str]) -> ConstraintMeta {
    ConstraintMeta {
        kind,
        columns: columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|c| c.db_name.clone())
                    .unwrap_or_else(|| snake_case(name))
            })
            .collect(),
    }
}

/// The registry all column-to-table references resolve through; tables are
/// stored behind `Arc` and looked up by name, never linked cyclically.
#[derive(Clone, Default)]
pub struct Schema {
    tables: Vec<Arc<TableMeta>>,
}

impl Schema {
    pub fn new(tables: impl IntoIterator<Item = TableMeta>) -> Self {
        Self {
            tables: tables.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn tables(&self) -> &[Arc<TableMeta>] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&Arc<TableMeta>> {
        self.tables
            .iter()
            .find(|t| t.name == name || t.db_name == name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::column::{
        id,
        integer,
        text,
    };

    fn users() -> TableMeta {
        table(
            "users",
            vec![
                ("id", id()),
                ("fullName", text().not_null()),
                ("age", integer().optional()),
            ],
            |t| vec![index(t, &["fullName"], false)],
            no_constraints,
        )
        .unwrap()
    }

    #[test]
    fn storage_names_are_snake_case() {
        let t = users();
        assert_eq!(t.column("fullName").unwrap().db_name, "full_name");
        assert_eq!(t.qualified("fullName").unwrap(), "users.full_name");
    }

    #[test]
    fn index_factory_sees_columns() {
        let t = users();
        assert_eq!(t.indexes[0].columns, vec!["full_name"]);
        assert_eq!(t.indexes[0].name("users"), "users_full_name_idx");
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        let result = table("_secret", vec![("id", id())], no_indexes, no_constraints);
        assert!(matches!(result, Err(SchemaError::ReservedTableName(_))));
    }

    #[test]
    fn aliased_tables_share_storage() {
        let t = users();
        let m = t.aliased("managers");
        assert_eq!(m.name, "managers");
        assert_eq!(m.db_name, "users");
        assert_eq!(m.aliased_from.as_deref(), Some("users"));
    }

    #[test]
    fn registry_resolves_by_either_name() {
        let schema = Schema::new([users()]);
        assert!(schema.table("users").is_some());
        let t = table("blogPosts", vec![("id", id())], no_indexes, no_constraints).unwrap();
        let schema = Schema::new([t]);
        assert!(schema.table("blog_posts").is_some());
        assert!(schema.table("blogPosts").is_some());
    }
}
