//! The in-process sync authority: assigns the total order, resolves
//! conflicts, serves resumable columnar pulls. It trusts the schema it was
//! opened with (clients ship the same declarations) and keeps its own copy
//! of every user table plus the queue bookkeeping.

use std::{
    cmp,
    collections::HashSet,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use db::LocalDb;
use driver::Driver;
use futures::{
    SinkExt,
    StreamExt,
};
use parking_lot::Mutex;
use schema::{
    Schema,
    StorageType,
};
use sql::{
    row_get,
    sql,
    SqlValue,
};

use crate::{
    apply::{
        apply_remote_batch,
        batch_undo_statements,
    },
    batch::encode_rows,
    frames::{
        encode_frame,
        Frame,
    },
    internal,
    remote::{
        ByteStream,
        RemoteDb,
    },
    types::{
        AckedBatch,
        MutationBatch,
        MutationOp,
        PullState,
        ResumeState,
        SendResult,
        Timestamp,
    },
};

/// Tuning for the pull producer.
#[derive(Clone, Copy, Debug)]
pub struct RemoteDbConfig {
    pub max_memory_mb: usize,
    /// First-batch row count, before per-row size feedback kicks in.
    pub initial_batch_rows: usize,
}

impl Default for RemoteDbConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 50,
            initial_batch_rows: 1000,
        }
    }
}
const MIN_BATCH_ROWS: usize = 100;
const MAX_BATCH_ROWS: usize = 10000;

#[derive(Clone)]
struct PullTable {
    name: String,
    pk: String,
    columns: Vec<(String, StorageType)>,
    column_set: Vec<String>,
}

pub struct SyncServer {
    driver: Arc<dyn Driver>,
    tables: Vec<PullTable>,
    last_ts: Mutex<Timestamp>,
    config: RemoteDbConfig,
}

impl SyncServer {
    pub async fn new(
        driver: Arc<dyn Driver>,
        schema: Schema,
        config: RemoteDbConfig,
    ) -> anyhow::Result<Arc<Self>> {
        // The server's copy of the user tables comes from the same declared
        // schema the clients carry.
        LocalDb::open(driver.clone(), schema.clone()).await?;
        driver.exec(internal::SYNC_INIT).await?;
        let last_ts = internal::max_server_timestamp(driver.as_ref()).await?;

        let tables = schema
            .tables()
            .iter()
            .filter(|t| t.aliased_from.is_none())
            .map(|t| PullTable {
                name: t.db_name.clone(),
                pk: t
                    .primary_key_column()
                    .map(|c| c.db_name.clone())
                    .unwrap_or_else(|| "rowid".to_owned()),
                columns: t
                    .columns
                    .iter()
                    .filter(|c| !c.is_virtual())
                    .map(|c| (c.db_name.clone(), c.storage_type))
                    .collect(),
                column_set: t.columns.iter().map(|c| c.db_name.clone()).collect(),
            })
            .collect();

        Ok(Arc::new(Self {
            driver,
            tables,
            last_ts: Mutex::new(last_ts),
            config,
        }))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Monotonic, non-decreasing millisecond clock.
    fn next_timestamp(&self) -> Timestamp {
        let now = chrono::Utc::now().timestamp_millis().max(0) as Timestamp;
        let mut last = self.last_ts.lock();
        *last = cmp::max(*last + 1, now);
        *last
    }

    fn table(&self, name: &str) -> Option<&PullTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    async fn row_exists(&self, table: &str, id: &str) -> anyhow::Result<bool> {
        let rows = self
            .driver
            .run(&sql!("SELECT 1 AS present FROM " [table] " WHERE id = " {id}))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn tombstoned(&self, table: &str, id: &str) -> anyhow::Result<bool> {
        Ok(
            internal::column_timestamp(self.driver.as_ref(), table, id, "id")
                .await?
                .is_some()
                && !self.row_exists(table, id).await?,
        )
    }

    /// Structural and conflict checks before any state changes. Returns the
    /// rejection reason, if any.
    async fn acceptance_check(&self, batch: &MutationBatch) -> anyhow::Result<Option<String>> {
        for mutation in &batch.mutations {
            let Some(table) = self.table(&mutation.table) else {
                return Ok(Some(format!("unknown table {}", mutation.table)));
            };
            let known: HashSet<&str> = table.column_set.iter().map(String::as_str).collect();
            for column in mutation.op.touched_columns() {
                if !known.contains(column) {
                    return Ok(Some(format!(
                        "unknown column {column} on table {}",
                        mutation.table
                    )));
                }
            }
            match &mutation.op {
                MutationOp::Insert { rows } => {
                    for row in rows {
                        if let Some(SqlValue::Text(id)) = row.get("id") {
                            if self.row_exists(&mutation.table, id).await? {
                                return Ok(Some(format!(
                                    "duplicate insert of {}.{id}",
                                    mutation.table
                                )));
                            }
                        }
                    }
                },
                MutationOp::Update { id, .. } => {
                    if self.tombstoned(&mutation.table, id).await? {
                        return Ok(Some(format!(
                            "update of deleted row {}.{id}",
                            mutation.table
                        )));
                    }
                    // An update for a row that never existed is accepted as
                    // a no-op; its insert may still be in flight on another
                    // channel.
                },
                // Deleting an already-deleted row is a no-op, not a
                // conflict.
                MutationOp::Delete { .. } => {},
            }
        }
        Ok(None)
    }

    async fn accept_one(&self, batch: &MutationBatch) -> anyhow::Result<Result<AckedBatch, String>> {
        // Reordered arrival within one node: ids are ULIDs, so the stored
        // order must match id order. Roll later batches back, slot this one
        // in, then replay them.
        let later = internal::later_batches_from_node(
            self.driver.as_ref(),
            &batch.node.id,
            &batch.id,
        )
        .await?;
        if !later.is_empty() {
            tracing::info!(
                batch = %batch.id,
                displaced = later.len(),
                "out-of-order batch arrival, rolling forward"
            );
            let mut rollback = Vec::new();
            for displaced in later.iter().rev() {
                rollback.extend(batch_undo_statements(displaced));
            }
            if !rollback.is_empty() {
                self.driver.batch(&rollback).await?;
            }
        }

        let outcome = match self.acceptance_check(batch).await? {
            Some(reason) => Err(reason),
            None => {
                let ts = self.next_timestamp();
                match apply_remote_batch(self.driver.as_ref(), batch, ts).await {
                    Ok(_) => Ok(AckedBatch {
                        id: batch.id.clone(),
                        server_timestamp_ms: ts,
                    }),
                    // The driver batch rolled back: the whole mutation
                    // group is rejected (foreign keys included).
                    Err(error) => Err(format!("apply failed: {error:#}")),
                }
            },
        };

        // Replay the displaced batches after the late arrival, assigning
        // fresh timestamps so the total order agrees with the ULID order
        // every replica replays.
        if !later.is_empty() {
            for displaced in &later {
                let ts = self.next_timestamp();
                apply_remote_batch(self.driver.as_ref(), displaced, ts).await?;
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl RemoteDb for SyncServer {
    async fn pull(&self, resume: ResumeState) -> anyhow::Result<ByteStream> {
        let (mut tx, rx) = futures::channel::mpsc::channel::<anyhow::Result<Bytes>>(16);
        let driver = self.driver.clone();
        let tables = self.tables.clone();
        let budget_bytes = self.config.max_memory_mb * 1024 * 1024;
        let initial_batch_rows = self.config.initial_batch_rows;

        tokio::spawn(async move {
            let produced: anyhow::Result<()> = async {
                for table in &tables {
                    let progress = resume.get(&table.name);
                    if progress.map(|p| p.state == PullState::All).unwrap_or(false) {
                        continue;
                    }
                    let mut offset = progress.map(|p| p.next_offset).unwrap_or(0);
                    tx.send(Ok(encode_frame(&Frame::Str(table.name.clone()))))
                        .await
                        .map_err(|_| anyhow::anyhow!("pull consumer went away"))?;

                    let column_list = table
                        .columns
                        .iter()
                        .map(|(name, _)| name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    let mut batch_rows = initial_batch_rows;
                    loop {
                        let statement = sql::RawSql::new(format!(
                            "SELECT {column_list} FROM {} ORDER BY {} LIMIT {batch_rows} \
                             OFFSET {offset}",
                            table.name, table.pk
                        ));
                        let rows = driver.run(&statement).await?;
                        if rows.is_empty() {
                            break;
                        }
                        let requested = batch_rows;
                        let encoded = encode_rows(&table.columns, &rows)?;
                        // Adapt the next batch to the memory budget from the
                        // observed per-row size.
                        let per_row = cmp::max(1, encoded.len() / rows.len());
                        batch_rows = (budget_bytes / per_row).clamp(MIN_BATCH_ROWS, MAX_BATCH_ROWS);
                        offset += rows.len() as u64;
                        let finished = rows.len() < requested;
                        tx.send(Ok(encode_frame(&Frame::Bin(Bytes::from(encoded)))))
                            .await
                            .map_err(|_| anyhow::anyhow!("pull consumer went away"))?;
                        if finished {
                            break;
                        }
                    }
                }
                tx.send(Ok(encode_frame(&Frame::End)))
                    .await
                    .map_err(|_| anyhow::anyhow!("pull consumer went away"))?;
                Ok(())
            }
            .await;
            if let Err(error) = produced {
                tracing::error!(%error, "pull producer failed");
                let _ = tx.send(Err(error)).await;
            }
        });

        Ok(rx.boxed())
    }

    async fn send(&self, batches: Vec<MutationBatch>) -> anyhow::Result<SendResult> {
        let mut result = SendResult {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for batch in batches {
            // Idempotency: an already-accepted batch acks with its original
            // timestamp and is not re-applied.
            if let Some((_, status, ts)) =
                internal::queue_lookup(self.driver.as_ref(), &batch.id).await?
            {
                match (status, ts) {
                    (crate::types::BatchStatus::Acked, Some(ts)) => {
                        result.succeeded.push(AckedBatch {
                            id: batch.id.clone(),
                            server_timestamp_ms: ts,
                        });
                    },
                    _ => result.failed.push(batch.id.clone()),
                }
                continue;
            }
            match self.accept_one(&batch).await? {
                Ok(acked) => result.succeeded.push(acked),
                Err(reason) => {
                    tracing::warn!(batch = %batch.id, %reason, "rejecting batch");
                    let record = internal::failed_insert_statement(&batch, &reason)?;
                    let mut rejected = batch.clone();
                    rejected.server_timestamp_ms = None;
                    let queue = internal::queue_insert_statement(
                        &rejected,
                        crate::types::BatchStatus::Rejected,
                    )?;
                    self.driver.batch(&[record, queue]).await?;
                    result.failed.push(batch.id.clone());
                },
            }
        }
        Ok(result)
    }

    async fn get(&self, max_server_timestamp: Timestamp) -> anyhow::Result<Vec<MutationBatch>> {
        internal::acked_batches_after(self.driver.as_ref(), max_server_timestamp).await
    }
}

/// Reads a count of rows, for tests and admin surfaces.
pub async fn table_count(driver: &dyn Driver, table: &str) -> anyhow::Result<i64> {
    let rows = driver
        .run(&sql::RawSql::new(format!(
            "SELECT count(*) AS n FROM {table}"
        )))
        .await?;
    Ok(match rows.first().and_then(|row| row_get(row, "n")) {
        Some(SqlValue::Integer(n)) => *n,
        _ => 0,
    })
}
