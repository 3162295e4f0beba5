//! The reserved `_`-prefixed bookkeeping tables and their access helpers.

use std::collections::HashSet;

use anyhow::Context;
use driver::Driver;
use sql::{
    row_get,
    sql,
    RawSql,
    SqlValue,
};

use crate::types::{
    BatchStatus,
    MutationBatch,
    NodeInfo,
    PullProgress,
    PullState,
    ResumeState,
    Timestamp,
};

pub const SYNC_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS _sync_node (
    id TEXT NOT NULL,
    name TEXT NOT NULL,

    PRIMARY KEY (id)
);
CREATE TABLE IF NOT EXISTS _sync_pull_progress (
    table_name TEXT NOT NULL,
    state TEXT NOT NULL,
    next_offset INTEGER NOT NULL,

    PRIMARY KEY (table_name)
);
CREATE TABLE IF NOT EXISTS _db_mutations_queue (
    id TEXT NOT NULL,
    value_json TEXT NOT NULL,
    server_timestamp_ms INTEGER NULL,
    status TEXT NOT NULL,

    PRIMARY KEY (id)
);
CREATE TABLE IF NOT EXISTS _column_timestamps (
    table_name TEXT NOT NULL,
    pk TEXT NOT NULL,
    column_name TEXT NOT NULL,
    server_timestamp_ms INTEGER NOT NULL,

    PRIMARY KEY (table_name, pk, column_name)
);
CREATE TABLE IF NOT EXISTS _failed_mutations (
    id TEXT NOT NULL,
    value_json TEXT NOT NULL,
    reason TEXT NOT NULL,

    PRIMARY KEY (id)
);
"#;

/// Loads this client's identity, creating it on first use.
pub async fn ensure_node(driver: &dyn Driver, name: &str) -> anyhow::Result<NodeInfo> {
    let rows = driver
        .run(&RawSql::new("SELECT id, name FROM _sync_node"))
        .await?;
    if let Some(row) = rows.first() {
        if let (Some(SqlValue::Text(id)), Some(SqlValue::Text(name))) =
            (row_get(row, "id"), row_get(row, "name"))
        {
            return Ok(NodeInfo {
                id: id.clone(),
                name: name.clone(),
            });
        }
    }
    let node = NodeInfo {
        id: ulid::Ulid::new().to_string(),
        name: name.to_owned(),
    };
    driver
        .run(&sql!(
            "INSERT INTO _sync_node (id, name) VALUES (" {node.id.clone()} ", " {node.name.clone()} ")"
        ))
        .await?;
    Ok(node)
}

pub fn queue_insert_statement(batch: &MutationBatch, status: BatchStatus) -> anyhow::Result<RawSql> {
    let value_json = serde_json::to_string(batch)?;
    let ts: SqlValue = match batch.server_timestamp_ms {
        Some(ts) => SqlValue::Integer(ts as i64),
        None => SqlValue::Null,
    };
    Ok(sql!(
        "INSERT OR REPLACE INTO _db_mutations_queue (id, value_json, server_timestamp_ms, status) \
         VALUES (" {batch.id.clone()} ", " {value_json} ", " {ts} ", " {status.as_str()} ")"
    ))
}

pub fn queue_status_statement(batch_id: &str, status: BatchStatus, ts: Option<Timestamp>) -> RawSql {
    match ts {
        Some(ts) => sql!(
            "UPDATE _db_mutations_queue SET status = " {status.as_str()}
            ", server_timestamp_ms = " {ts as i64} " WHERE id = " {batch_id}
        ),
        None => sql!(
            "UPDATE _db_mutations_queue SET status = " {status.as_str()} " WHERE id = " {batch_id}
        ),
    }
}

pub fn failed_insert_statement(batch: &MutationBatch, reason: &str) -> anyhow::Result<RawSql> {
    let value_json = serde_json::to_string(batch)?;
    Ok(sql!(
        "INSERT OR REPLACE INTO _failed_mutations (id, value_json, reason) \
         VALUES (" {batch.id.clone()} ", " {value_json} ", " {reason} ")"
    ))
}

fn parse_queue_row(row: &sql::SqlRow) -> anyhow::Result<(MutationBatch, BatchStatus)> {
    let json = match row_get(row, "value_json") {
        Some(SqlValue::Text(json)) => json,
        _ => anyhow::bail!("queue row without value_json"),
    };
    let mut batch: MutationBatch = serde_json::from_str(json).context("corrupt queued batch")?;
    // The assigned timestamp lives on the row once acked; the stored JSON
    // may predate the ack.
    if let Some(SqlValue::Integer(ts)) = row_get(row, "server_timestamp_ms") {
        batch.server_timestamp_ms = Some(*ts as Timestamp);
    }
    let status = match row_get(row, "status") {
        Some(SqlValue::Text(status)) => {
            BatchStatus::parse(status).context("unknown queue status")?
        },
        _ => anyhow::bail!("queue row without status"),
    };
    Ok((batch, status))
}

/// Oldest batches awaiting push: `local` first, plus `sent` ones left over
/// from an interrupted push window (they are never dropped).
pub async fn unpushed_batches(
    driver: &dyn Driver,
    limit: usize,
) -> anyhow::Result<Vec<MutationBatch>> {
    let rows = driver
        .run(&sql!(
            "SELECT value_json, status, server_timestamp_ms FROM _db_mutations_queue \
             WHERE status IN ('local', 'sent') ORDER BY id LIMIT " {limit as i64}
        ))
        .await?;
    rows.iter()
        .map(|row| parse_queue_row(row).map(|(batch, _)| batch))
        .collect()
}

pub async fn queue_lookup(
    driver: &dyn Driver,
    batch_id: &str,
) -> anyhow::Result<Option<(MutationBatch, BatchStatus, Option<Timestamp>)>> {
    let rows = driver
        .run(&sql!(
            "SELECT value_json, status, server_timestamp_ms FROM _db_mutations_queue \
             WHERE id = " {batch_id}
        ))
        .await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    let (batch, status) = parse_queue_row(row)?;
    let ts = match row_get(row, "server_timestamp_ms") {
        Some(SqlValue::Integer(ts)) => Some(*ts as Timestamp),
        _ => None,
    };
    Ok(Some((batch, status, ts)))
}

/// Acked batches ordered after `after`, ascending by server timestamp then
/// batch id.
pub async fn acked_batches_after(
    driver: &dyn Driver,
    after: Timestamp,
) -> anyhow::Result<Vec<MutationBatch>> {
    let rows = driver
        .run(&sql!(
            "SELECT value_json, status, server_timestamp_ms FROM _db_mutations_queue \
             WHERE status = 'acked' AND server_timestamp_ms > " {after as i64}
            " ORDER BY server_timestamp_ms, id"
        ))
        .await?;
    rows.iter()
        .map(|row| parse_queue_row(row).map(|(batch, _)| batch))
        .collect()
}

/// Acked batches from `node` with ids lexicographically after `batch_id`;
/// non-empty means `batch_id` arrived out of order.
pub async fn later_batches_from_node(
    driver: &dyn Driver,
    node_id: &str,
    batch_id: &str,
) -> anyhow::Result<Vec<MutationBatch>> {
    let rows = driver
        .run(&sql!(
            "SELECT value_json, status, server_timestamp_ms FROM _db_mutations_queue \
             WHERE status = 'acked' AND id > " {batch_id} " ORDER BY id"
        ))
        .await?;
    let mut out = Vec::new();
    for row in &rows {
        let (batch, _) = parse_queue_row(row)?;
        if batch.node.id == node_id {
            out.push(batch);
        }
    }
    Ok(out)
}

/// Largest server timestamp the local queue has seen.
pub async fn max_server_timestamp(driver: &dyn Driver) -> anyhow::Result<Timestamp> {
    let rows = driver
        .run(&RawSql::new(
            "SELECT COALESCE(MAX(server_timestamp_ms), 0) AS max_ts FROM _db_mutations_queue",
        ))
        .await?;
    Ok(match rows.first().and_then(|row| row_get(row, "max_ts")) {
        Some(SqlValue::Integer(ts)) => *ts as Timestamp,
        _ => 0,
    })
}

/// High-water mark for the get loop: the largest timestamp among batches
/// that originated on *other* nodes. A client's own ack can outrun a
/// concurrent writer's timestamp, so counting own batches here would skip
/// feed entries forever; counting only remote ones merely re-fetches some
/// already-acked own batches, which the id dedupe drops.
pub async fn remote_watermark(driver: &dyn Driver, own_node_id: &str) -> anyhow::Result<Timestamp> {
    let rows = driver
        .run(&RawSql::new(
            "SELECT value_json, status, server_timestamp_ms FROM _db_mutations_queue \
             WHERE server_timestamp_ms IS NOT NULL ORDER BY server_timestamp_ms DESC",
        ))
        .await?;
    for row in &rows {
        let (batch, _) = parse_queue_row(row)?;
        if batch.node.id != own_node_id {
            return Ok(batch.server_timestamp_ms.unwrap_or(0));
        }
    }
    Ok(0)
}

pub async fn column_timestamp(
    driver: &dyn Driver,
    table: &str,
    pk: &str,
    column: &str,
) -> anyhow::Result<Option<Timestamp>> {
    let rows = driver
        .run(&sql!(
            "SELECT server_timestamp_ms FROM _column_timestamps \
             WHERE table_name = " {table} " AND pk = " {pk} " AND column_name = " {column}
        ))
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row_get(row, "server_timestamp_ms"))
        .and_then(|v| match v {
            SqlValue::Integer(ts) => Some(*ts as Timestamp),
            _ => None,
        }))
}

pub fn column_timestamp_upsert(table: &str, pk: &str, column: &str, ts: Timestamp) -> RawSql {
    sql!(
        "INSERT OR REPLACE INTO _column_timestamps \
         (table_name, pk, column_name, server_timestamp_ms) VALUES ("
        {table} ", " {pk} ", " {column} ", " {ts as i64} ")"
    )
}

pub fn column_timestamps_clear(table: &str, pk: &str) -> RawSql {
    sql!("DELETE FROM _column_timestamps WHERE table_name = " {table} " AND pk = " {pk})
}

/// Storage columns of a row touched by still-unacked local mutations; a
/// remote write must not clobber these.
pub async fn pending_columns(
    driver: &dyn Driver,
    table: &str,
    pk: &str,
) -> anyhow::Result<HashSet<String>> {
    let rows = driver
        .run(&RawSql::new(
            "SELECT value_json FROM _db_mutations_queue WHERE status IN ('local', 'sent')",
        ))
        .await?;
    let mut out = HashSet::new();
    for row in &rows {
        let Some(SqlValue::Text(json)) = row_get(row, "value_json") else {
            continue;
        };
        let batch: MutationBatch = serde_json::from_str(json).context("corrupt queued batch")?;
        for mutation in &batch.mutations {
            if mutation.table != table {
                continue;
            }
            if mutation.op.row_ids().iter().any(|id| id == pk) {
                for column in mutation.op.touched_columns() {
                    out.insert(column.to_owned());
                }
            }
        }
    }
    Ok(out)
}

pub async fn pull_progress(driver: &dyn Driver) -> anyhow::Result<ResumeState> {
    let rows = driver
        .run(&RawSql::new(
            "SELECT table_name, state, next_offset FROM _sync_pull_progress",
        ))
        .await?;
    let mut out = ResumeState::new();
    for row in &rows {
        let (Some(SqlValue::Text(table)), Some(SqlValue::Text(state)), Some(SqlValue::Integer(offset))) = (
            row_get(row, "table_name"),
            row_get(row, "state"),
            row_get(row, "next_offset"),
        ) else {
            continue;
        };
        let Some(state) = PullState::parse(state) else {
            continue;
        };
        out.insert(
            table.clone(),
            PullProgress {
                state,
                next_offset: *offset as u64,
            },
        );
    }
    Ok(out)
}

pub fn pull_progress_upsert(table: &str, state: PullState, next_offset: u64) -> RawSql {
    sql!(
        "INSERT OR REPLACE INTO _sync_pull_progress (table_name, state, next_offset) \
         VALUES (" {table} ", " {state.as_str()} ", " {next_offset as i64} ")"
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use driver::SqliteDriver;

    use super::*;

    async fn fresh() -> Arc<SqliteDriver> {
        let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
        driver.exec(SYNC_INIT).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn node_identity_is_created_once() {
        let driver = fresh().await;
        let a = ensure_node(driver.as_ref(), "laptop").await.unwrap();
        let b = ensure_node(driver.as_ref(), "other-name").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name, "laptop");
    }

    #[tokio::test]
    async fn column_timestamps_upsert_and_clear() {
        let driver = fresh().await;
        driver
            .run(&column_timestamp_upsert("users", "u1", "name", 5))
            .await
            .unwrap();
        driver
            .run(&column_timestamp_upsert("users", "u1", "name", 9))
            .await
            .unwrap();
        assert_eq!(
            column_timestamp(driver.as_ref(), "users", "u1", "name")
                .await
                .unwrap(),
            Some(9)
        );
        driver
            .run(&column_timestamps_clear("users", "u1"))
            .await
            .unwrap();
        assert_eq!(
            column_timestamp(driver.as_ref(), "users", "u1", "name")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn pull_progress_round_trips() {
        let driver = fresh().await;
        driver
            .run(&pull_progress_upsert("users", PullState::Partial, 400))
            .await
            .unwrap();
        let progress = pull_progress(driver.as_ref()).await.unwrap();
        assert_eq!(
            progress.get("users"),
            Some(&PullProgress {
                state: PullState::Partial,
                next_offset: 400
            })
        );
    }
}
