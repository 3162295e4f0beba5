//! Applying and undoing mutations, and the per-column last-write-wins
//! resolver used when remote-ordered batches land on a local replica.

use driver::Driver;
use sql::{
    RawSql,
    SqlValue,
};

use crate::{
    internal,
    types::{
        BatchStatus,
        Mutation,
        MutationBatch,
        MutationOp,
        RowValues,
        Timestamp,
        UndoOp,
    },
};

fn insert_row_statement(table: &str, row: &RowValues) -> RawSql {
    let mut statement = RawSql::new(format!(
        "INSERT OR REPLACE INTO {table} ({}) VALUES (",
        row.keys().cloned().collect::<Vec<_>>().join(", ")
    ));
    for (i, value) in row.values().enumerate() {
        if i > 0 {
            statement.push_str(", ");
        }
        statement.bind(value.clone());
    }
    statement.push_str(")");
    statement
}

fn update_row_statement(table: &str, id: &str, changes: &RowValues) -> RawSql {
    let mut statement = RawSql::new(format!("UPDATE {table} SET "));
    for (i, (column, value)) in changes.iter().enumerate() {
        if i > 0 {
            statement.push_str(", ");
        }
        statement.push_str(&format!("{column} = "));
        statement.bind(value.clone());
    }
    statement.push_str(" WHERE id = ");
    statement.bind(id);
    statement
}

fn delete_rows_statement(table: &str, ids: &[String]) -> RawSql {
    let mut statement = RawSql::new(format!("DELETE FROM {table} WHERE id IN ("));
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            statement.push_str(", ");
        }
        statement.bind(id.as_str());
    }
    statement.push_str(")");
    statement
}

/// Statements that apply one mutation as-is, without conflict checks.
pub fn mutation_statements(mutation: &Mutation) -> Vec<RawSql> {
    match &mutation.op {
        MutationOp::Insert { rows } => rows
            .iter()
            .map(|row| insert_row_statement(&mutation.table, row))
            .collect(),
        MutationOp::Update { id, changes } => {
            if changes.is_empty() {
                Vec::new()
            } else {
                vec![update_row_statement(&mutation.table, id, changes)]
            }
        },
        MutationOp::Delete { ids } => {
            if ids.is_empty() {
                Vec::new()
            } else {
                vec![delete_rows_statement(&mutation.table, ids)]
            }
        },
    }
}

/// Statements that roll one mutation back using its precomputed undo.
pub fn undo_statements(mutation: &Mutation) -> Vec<RawSql> {
    match &mutation.undo {
        UndoOp::Insert { rows } => rows
            .iter()
            .map(|row| insert_row_statement(&mutation.table, row))
            .collect(),
        UndoOp::Update {
            id,
            previous_changes,
        } => {
            if previous_changes.is_empty() {
                Vec::new()
            } else {
                vec![update_row_statement(&mutation.table, id, previous_changes)]
            }
        },
        UndoOp::Delete { ids } => {
            if ids.is_empty() {
                Vec::new()
            } else {
                vec![delete_rows_statement(&mutation.table, ids)]
            }
        },
    }
}

/// Statements that roll back a whole batch: every mutation's undo, in
/// reverse order.
pub fn batch_undo_statements(batch: &MutationBatch) -> Vec<RawSql> {
    batch
        .mutations
        .iter()
        .rev()
        .flat_map(undo_statements)
        .collect()
}

/// What a resolved remote batch turned into.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Storage tables whose rows changed; drives invalidation.
    pub touched_tables: Vec<String>,
}

/// Applies a server-ordered batch to the local replica with per-column
/// last-write-wins:
///
/// - a column is overwritten only if its stored timestamp is below the
///   batch's, and never while an unacked local mutation still touches it
///   (the push will outrank this batch once the server orders it);
/// - inserts restore full rows and stamp every supplied column;
/// - deletes win over earlier-stamped cells and leave a tombstone on the
///   row's `id` stamp.
///
/// The user-table writes, the queue insert and the timestamp upserts all
/// land in one driver batch, so a crash cannot separate them.
pub async fn apply_remote_batch(
    driver: &dyn Driver,
    batch: &MutationBatch,
    ts: Timestamp,
) -> anyhow::Result<ApplyOutcome> {
    let mut statements: Vec<RawSql> = Vec::new();
    let mut outcome = ApplyOutcome::default();

    for mutation in &batch.mutations {
        let table = mutation.table.as_str();
        match &mutation.op {
            MutationOp::Insert { rows } => {
                for row in rows {
                    statements.push(insert_row_statement(table, row));
                    if let Some(SqlValue::Text(pk)) = row.get("id") {
                        for column in row.keys() {
                            statements.push(internal::column_timestamp_upsert(
                                table, pk, column, ts,
                            ));
                        }
                    }
                }
                note_table(&mut outcome, table);
            },
            MutationOp::Update { id, changes } => {
                let pending = internal::pending_columns(driver, table, id).await?;
                let mut winning = RowValues::new();
                for (column, value) in changes {
                    if pending.contains(column) {
                        continue;
                    }
                    let stored = internal::column_timestamp(driver, table, id, column).await?;
                    if stored.map(|stored| stored < ts).unwrap_or(true) {
                        winning.insert(column.clone(), value.clone());
                    }
                }
                if !winning.is_empty() {
                    statements.push(update_row_statement(table, id, &winning));
                    for column in winning.keys() {
                        statements.push(internal::column_timestamp_upsert(table, id, column, ts));
                    }
                    note_table(&mut outcome, table);
                }
            },
            MutationOp::Delete { ids } => {
                if !ids.is_empty() {
                    statements.push(delete_rows_statement(table, ids));
                    for id in ids {
                        statements.push(internal::column_timestamps_clear(table, id));
                        statements.push(internal::column_timestamp_upsert(table, id, "id", ts));
                    }
                    note_table(&mut outcome, table);
                }
            },
        }
    }

    let mut acked = batch.clone();
    acked.server_timestamp_ms = Some(ts);
    statements.push(internal::queue_insert_statement(&acked, BatchStatus::Acked)?);

    driver.batch(&statements).await?;
    Ok(outcome)
}

fn note_table(outcome: &mut ApplyOutcome, table: &str) {
    if !outcome.touched_tables.iter().any(|t| t == table) {
        outcome.touched_tables.push(table.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn update_mutation() -> Mutation {
        Mutation {
            table: "users".into(),
            op: MutationOp::Update {
                id: "u1".into(),
                changes: btreemap! {
                    "name".to_owned() => SqlValue::Text("New".into()),
                },
            },
            undo: UndoOp::Update {
                id: "u1".into(),
                previous_changes: btreemap! {
                    "name".to_owned() => SqlValue::Text("Old".into()),
                },
            },
        }
    }

    #[test]
    fn update_statement_binds_set_then_id() {
        let statements = mutation_statements(&update_mutation());
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].query, "UPDATE users SET name = ? WHERE id = ?");
        assert_eq!(
            statements[0].params,
            vec![SqlValue::Text("New".into()), SqlValue::Text("u1".into())]
        );
    }

    #[test]
    fn undo_restores_previous_values() {
        let statements = undo_statements(&update_mutation());
        assert_eq!(
            statements[0].params,
            vec![SqlValue::Text("Old".into()), SqlValue::Text("u1".into())]
        );
    }

    #[test]
    fn batch_undo_reverses_mutation_order() {
        let batch = MutationBatch {
            id: "b1".into(),
            db_name: "app".into(),
            node: crate::types::NodeInfo {
                id: "n".into(),
                name: "n".into(),
            },
            mutations: vec![
                Mutation {
                    table: "users".into(),
                    op: MutationOp::Insert {
                        rows: vec![btreemap! {
                            "id".to_owned() => SqlValue::Text("u1".into()),
                        }],
                    },
                    undo: UndoOp::Delete {
                        ids: vec!["u1".into()],
                    },
                },
                update_mutation(),
            ],
        server_timestamp_ms: None,
        };
        let statements = batch_undo_statements(&batch);
        assert!(statements[0].query.starts_with("UPDATE users"));
        assert!(statements[1].query.starts_with("DELETE FROM users"));
    }
}
