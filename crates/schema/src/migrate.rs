//! Snapshot diffing: emits forward-only DDL for the allowed shape changes
//! and refuses anything lossy or ambiguous.

use std::collections::HashMap;

use sql::SqlValue;

use crate::{
    snapshot::{
        ColumnSnapshot,
        SchemaSnapshot,
        TableSnapshot,
    },
    table::IndexMeta,
    SchemaError,
};

#[derive(Clone, Debug, PartialEq)]
pub enum MigrationStep {
    DropIndex { name: String },
    DropColumn { table: String, column: String },
    DropTable { table: String },
    RenameTable { from: String, to: String },
    RenameColumn { table: String, from: String, to: String },
    CreateTable(TableSnapshot),
    AddColumn { table: String, column: ColumnSnapshot },
    CreateIndex { table: String, index: IndexMeta },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MigrationPlan {
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Renders the plan as `;`-separated DDL in plan order.
    pub fn to_ddl(&self) -> String {
        self.statements().join(";\n")
    }

    /// One DDL string per step, in plan order.
    pub fn statements(&self) -> Vec<String> {
        let mut statements = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            statements.push(match step {
                MigrationStep::DropIndex { name } => format!("DROP INDEX {name}"),
                MigrationStep::DropColumn { table, column } => {
                    format!("ALTER TABLE {table} DROP COLUMN {column}")
                },
                MigrationStep::DropTable { table } => format!("DROP TABLE {table}"),
                MigrationStep::RenameTable { from, to } => {
                    format!("ALTER TABLE {from} RENAME TO {to}")
                },
                MigrationStep::RenameColumn { table, from, to } => {
                    format!("ALTER TABLE {table} RENAME COLUMN {from} TO {to}")
                },
                MigrationStep::CreateTable(table) => render_create_table(table),
                MigrationStep::AddColumn { table, column } => {
                    format!("ALTER TABLE {table} ADD COLUMN {}", render_column(column))
                },
                MigrationStep::CreateIndex { table, index } => {
                    let unique = if index.unique { "UNIQUE " } else { "" };
                    format!(
                        "CREATE {unique}INDEX {} ON {table} ({})",
                        index.name(table),
                        index.columns.join(", ")
                    )
                },
            });
        }
        statements
    }
}

/// Diffs two snapshots into a forward migration plan. Step order is fixed:
/// drop-indexes, drop-columns, drop-tables, rename-tables, rename-columns,
/// create-tables, add-columns, create-indexes, so renames land before adds
/// and index creation sees final names.
pub fn diff(prev: &SchemaSnapshot, next: &SchemaSnapshot) -> Result<MigrationPlan, SchemaError> {
    let mut drop_indexes = Vec::new();
    let mut drop_columns = Vec::new();
    let mut drop_tables = Vec::new();
    let mut rename_tables = Vec::new();
    let mut rename_columns = Vec::new();
    let mut create_tables = Vec::new();
    let mut add_columns = Vec::new();
    let mut create_indexes = Vec::new();

    // Pair up tables: by storage name first, then by declared renames.
    let mut matches: Vec<(&TableSnapshot, &TableSnapshot)> = Vec::new();
    let mut claimed_prev: Vec<&str> = Vec::new();
    let mut rename_sources: HashMap<&str, &str> = HashMap::new();
    for table in &next.tables {
        if let Some(previous) = prev.table_by_db_name(&table.db_name) {
            matches.push((previous, table));
            claimed_prev.push(previous.db_name.as_str());
            continue;
        }
        if let Some(renamed_from) = &table.renamed_from {
            if let Some(previous) = prev.table_by_db_name(renamed_from) {
                if let Some(other) =
                    rename_sources.insert(renamed_from.as_str(), table.db_name.as_str())
                {
                    return Err(SchemaError::AmbiguousRename(format!(
                        "tables {other} and {} both rename {renamed_from}",
                        table.db_name
                    )));
                }
                rename_tables.push(MigrationStep::RenameTable {
                    from: previous.db_name.clone(),
                    to: table.db_name.clone(),
                });
                matches.push((previous, table));
                claimed_prev.push(previous.db_name.as_str());
                continue;
            }
        }
        create_tables.push(MigrationStep::CreateTable(table.clone()));
        for index in &table.indexes {
            create_indexes.push(MigrationStep::CreateIndex {
                table: table.db_name.clone(),
                index: index.clone(),
            });
        }
    }
    for previous in &prev.tables {
        if !claimed_prev.contains(&previous.db_name.as_str()) {
            // Dropping the table drops its indexes with it.
            drop_tables.push(MigrationStep::DropTable {
                table: previous.db_name.clone(),
            });
        }
    }

    for (previous, table) in matches {
        diff_table(
            previous,
            table,
            &mut drop_indexes,
            &mut drop_columns,
            &mut rename_columns,
            &mut add_columns,
            &mut create_indexes,
        )?;
    }

    let mut steps = Vec::new();
    steps.extend(drop_indexes);
    steps.extend(drop_columns);
    steps.extend(drop_tables);
    steps.extend(rename_tables);
    steps.extend(rename_columns);
    steps.extend(create_tables);
    steps.extend(add_columns);
    steps.extend(create_indexes);
    Ok(MigrationPlan { steps })
}

fn diff_table(
    prev: &TableSnapshot,
    next: &TableSnapshot,
    drop_indexes: &mut Vec<MigrationStep>,
    drop_columns: &mut Vec<MigrationStep>,
    rename_columns: &mut Vec<MigrationStep>,
    add_columns: &mut Vec<MigrationStep>,
    create_indexes: &mut Vec<MigrationStep>,
) -> Result<(), SchemaError> {
    if !same_constraints(prev, next) {
        return Err(SchemaError::ConstraintChange {
            table: next.db_name.clone(),
        });
    }

    let renamed = prev.db_name != next.db_name;
    let mut claimed_prev: Vec<&str> = Vec::new();
    let mut rename_sources: HashMap<&str, &str> = HashMap::new();

    for column in &next.columns {
        if let Some(previous) = prev.column_by_db_name(&column.db_name) {
            check_column_pair(&next.db_name, previous, column)?;
            claimed_prev.push(previous.db_name.as_str());
            continue;
        }
        if let Some(renamed_from) = &column.renamed_from {
            if let Some(previous) = prev.column_by_db_name(renamed_from) {
                if let Some(other) =
                    rename_sources.insert(renamed_from.as_str(), column.db_name.as_str())
                {
                    return Err(SchemaError::AmbiguousRename(format!(
                        "columns {other} and {} of {} both rename {renamed_from}",
                        column.db_name, next.db_name
                    )));
                }
                // RENAME of a generated column is back-end specific; refuse
                // rather than emit possibly-broken DDL.
                if previous.generated_always_as.is_some()
                    || column.generated_always_as.is_some()
                {
                    return Err(SchemaError::RenameOfGeneratedColumn {
                        table: next.db_name.clone(),
                        column: column.db_name.clone(),
                    });
                }
                check_column_pair(&next.db_name, previous, column)?;
                rename_columns.push(MigrationStep::RenameColumn {
                    table: next.db_name.clone(),
                    from: previous.db_name.clone(),
                    to: column.db_name.clone(),
                });
                claimed_prev.push(previous.db_name.as_str());
                continue;
            }
        }
        add_columns.push(MigrationStep::AddColumn {
            table: next.db_name.clone(),
            column: column.clone(),
        });
    }
    for previous in &prev.columns {
        if !claimed_prev.contains(&previous.db_name.as_str()) {
            // Drops run before renames, so the old table name applies.
            drop_columns.push(MigrationStep::DropColumn {
                table: prev.db_name.clone(),
                column: previous.db_name.clone(),
            });
        }
    }

    // Index diffing. A renamed table recreates its indexes so derived names
    // track the new table name.
    let index_key = |i: &IndexMeta| (i.columns.clone(), i.unique);
    for index in &prev.indexes {
        let kept =
            !renamed && next.indexes.iter().any(|i| index_key(i) == index_key(index));
        if !kept {
            drop_indexes.push(MigrationStep::DropIndex {
                name: index.name(&prev.db_name),
            });
        }
    }
    for index in &next.indexes {
        let kept =
            !renamed && prev.indexes.iter().any(|i| index_key(i) == index_key(index));
        if !kept {
            create_indexes.push(MigrationStep::CreateIndex {
                table: next.db_name.clone(),
                index: index.clone(),
            });
        }
    }
    Ok(())
}

/// Columns may be renamed but never mutated: storage/app type, nullability,
/// defaults, generation and foreign keys are all frozen; per-column
/// PRIMARY KEY / UNIQUE markers are constraint changes.
fn check_column_pair(
    table: &str,
    prev: &ColumnSnapshot,
    next: &ColumnSnapshot,
) -> Result<(), SchemaError> {
    let mutation = |what: &str| SchemaError::ColumnMutationNotSupported {
        table: table.to_owned(),
        column: next.db_name.clone(),
        what: what.to_owned(),
    };
    if prev.storage_type != next.storage_type {
        return Err(mutation("storage type"));
    }
    if prev.app_type != next.app_type {
        return Err(mutation("application type"));
    }
    if prev.not_null != next.not_null {
        return Err(mutation("nullability"));
    }
    if prev.default != next.default {
        return Err(mutation("default"));
    }
    if prev.generated_always_as != next.generated_always_as {
        return Err(mutation("generation expression"));
    }
    if prev.foreign_key != next.foreign_key {
        return Err(mutation("foreign key"));
    }
    if prev.primary_key != next.primary_key || prev.unique != next.unique {
        return Err(SchemaError::ConstraintChange {
            table: table.to_owned(),
        });
    }
    Ok(())
}

fn same_constraints(prev: &TableSnapshot, next: &TableSnapshot) -> bool {
    let mut a = prev.constraints.clone();
    let mut b = next.constraints.clone();
    let key = |c: &crate::table::ConstraintMeta| (c.kind, c.columns.clone());
    a.sort_by_key(key);
    b.sort_by_key(key);
    a == b
}

fn render_create_table(table: &TableSnapshot) -> String {
    let mut parts: Vec<String> = table.columns.iter().map(render_column).collect();
    for constraint in &table.constraints {
        let kind = match constraint.kind {
            crate::table::ConstraintKind::PrimaryKey => "PRIMARY KEY",
            crate::table::ConstraintKind::Unique => "UNIQUE",
        };
        parts.push(format!("{kind} ({})", constraint.columns.join(", ")));
    }
    format!(
        "CREATE TABLE {} (\n    {}\n)",
        table.db_name,
        parts.join(",\n    ")
    )
}

fn render_column(column: &ColumnSnapshot) -> String {
    let mut out = format!("{} {}", column.db_name, column.storage_type.as_sql());
    if column.primary_key {
        out.push_str(" PRIMARY KEY");
    }
    if column.not_null {
        out.push_str(" NOT NULL");
    }
    if column.unique {
        out.push_str(" UNIQUE");
    }
    if let Some(default) = &column.default {
        out.push_str(" DEFAULT ");
        out.push_str(&render_literal(default));
    }
    if let Some(target) = &column.foreign_key {
        if let Some((table, target_column)) = target.split_once('.') {
            out.push_str(&format!(" REFERENCES {table}({target_column})"));
        }
    }
    if let Some(expr) = &column.generated_always_as {
        out.push_str(&format!(" GENERATED ALWAYS AS ({expr}) VIRTUAL"));
    }
    out
}

fn render_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_owned(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        SqlValue::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{hex}'")
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        column::{
            id,
            integer,
            text,
        },
        snapshot::SchemaSnapshot,
        table::{
            index,
            no_constraints,
            no_indexes,
            table,
            Schema,
        },
    };

    fn snap(tables: Vec<crate::table::TableMeta>) -> SchemaSnapshot {
        SchemaSnapshot::of(&Schema::new(tables))
    }

    fn users_v1() -> crate::table::TableMeta {
        table(
            "users",
            vec![("id", id()), ("name", text())],
            no_indexes,
            no_constraints,
        )
        .unwrap()
    }

    #[test]
    fn fresh_schema_creates_tables_and_indexes() {
        let next = snap(vec![table(
            "users",
            vec![("id", id()), ("name", text())],
            |t| vec![index(t, &["name"], false)],
            no_constraints,
        )
        .unwrap()]);
        let plan = diff(&SchemaSnapshot::default(), &next).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(plan.steps[0], MigrationStep::CreateTable(_)));
        assert!(matches!(plan.steps[1], MigrationStep::CreateIndex { .. }));
        let ddl = plan.to_ddl();
        assert!(ddl.contains("CREATE TABLE users"));
        assert!(ddl.contains("id TEXT PRIMARY KEY NOT NULL"));
        assert!(ddl.contains("CREATE INDEX users_name_idx ON users (name)"));
    }

    #[test]
    fn rename_column_and_add_column() {
        let prev = snap(vec![users_v1()]);
        let next = snap(vec![table(
            "users",
            vec![
                ("id", id()),
                ("fullName", text().renamed_from("name")),
                ("age", integer().optional()),
            ],
            no_indexes,
            no_constraints,
        )
        .unwrap()]);
        let plan = diff(&prev, &next).unwrap();
        assert_eq!(
            plan.steps,
            vec![
                MigrationStep::RenameColumn {
                    table: "users".into(),
                    from: "name".into(),
                    to: "full_name".into(),
                },
                MigrationStep::AddColumn {
                    table: "users".into(),
                    column: next.tables[0].columns[2].clone(),
                },
            ]
        );
        let ddl = plan.to_ddl();
        assert_eq!(
            ddl,
            "ALTER TABLE users RENAME COLUMN name TO full_name;\n\
             ALTER TABLE users ADD COLUMN age INTEGER"
        );
    }

    #[test]
    fn rename_table_recreates_indexes() {
        let prev = snap(vec![table(
            "users",
            vec![("id", id()), ("name", text())],
            |t| vec![index(t, &["name"], false)],
            no_constraints,
        )
        .unwrap()]);
        let next = snap(vec![table(
            "people",
            vec![("id", id()), ("name", text())],
            |t| vec![index(t, &["name"], false)],
            no_constraints,
        )
        .unwrap()
        .renamed_from("users")]);
        let plan = diff(&prev, &next).unwrap();
        assert_eq!(
            plan.steps,
            vec![
                MigrationStep::DropIndex {
                    name: "users_name_idx".into()
                },
                MigrationStep::RenameTable {
                    from: "users".into(),
                    to: "people".into()
                },
                MigrationStep::CreateIndex {
                    table: "people".into(),
                    index: IndexMeta {
                        columns: vec!["name".into()],
                        unique: false
                    },
                },
            ]
        );
    }

    #[test]
    fn drop_table_and_drop_column() {
        let prev = snap(vec![
            users_v1(),
            table("extra", vec![("id", id())], no_indexes, no_constraints).unwrap(),
        ]);
        let next = snap(vec![table(
            "users",
            vec![("id", id())],
            no_indexes,
            no_constraints,
        )
        .unwrap()]);
        let plan = diff(&prev, &next).unwrap();
        assert_eq!(
            plan.steps,
            vec![
                MigrationStep::DropColumn {
                    table: "users".into(),
                    column: "name".into()
                },
                MigrationStep::DropTable {
                    table: "extra".into()
                },
            ]
        );
    }

    #[test]
    fn storage_type_change_is_rejected() {
        let prev = snap(vec![users_v1()]);
        let next = snap(vec![table(
            "users",
            vec![("id", id()), ("name", integer())],
            no_indexes,
            no_constraints,
        )
        .unwrap()]);
        let err = diff(&prev, &next).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::ColumnMutationNotSupported { ref what, .. } if what == "storage type"
        ));
    }

    #[test]
    fn constraint_change_is_rejected() {
        let prev = snap(vec![users_v1()]);
        let next = snap(vec![table(
            "users",
            vec![("id", id()), ("name", text().unique())],
            no_indexes,
            no_constraints,
        )
        .unwrap()]);
        assert!(matches!(
            diff(&prev, &next).unwrap_err(),
            SchemaError::ConstraintChange { .. }
        ));
    }

    #[test]
    fn duplicate_rename_targets_are_ambiguous() {
        let prev = snap(vec![users_v1()]);
        let next = snap(vec![table(
            "users",
            vec![
                ("id", id()),
                ("first", text().renamed_from("name")),
                ("second", text().renamed_from("name")),
            ],
            no_indexes,
            no_constraints,
        )
        .unwrap()]);
        assert!(matches!(
            diff(&prev, &next).unwrap_err(),
            SchemaError::AmbiguousRename(_)
        ));
    }

    #[test]
    fn rename_of_generated_column_is_rejected() {
        let prev = snap(vec![table(
            "users",
            vec![
                ("id", id()),
                ("name", text()),
                ("nameLower", text().generated_always_as("lower(name)")),
            ],
            no_indexes,
            no_constraints,
        )
        .unwrap()]);
        let next = snap(vec![table(
            "users",
            vec![
                ("id", id()),
                ("name", text()),
                (
                    "lowered",
                    text()
                        .generated_always_as("lower(name)")
                        .renamed_from("name_lower"),
                ),
            ],
            no_indexes,
            no_constraints,
        )
        .unwrap()]);
        assert!(matches!(
            diff(&prev, &next).unwrap_err(),
            SchemaError::RenameOfGeneratedColumn { .. }
        ));
    }

    #[test]
    fn identical_snapshots_produce_no_steps() {
        let a = snap(vec![users_v1()]);
        let b = snap(vec![users_v1()]);
        assert!(diff(&a, &b).unwrap().is_empty());
    }
}
