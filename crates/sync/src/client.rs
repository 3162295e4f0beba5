//! The synced database: a [`LocalDb`] whose writes also append undo-carrying
//! mutation batches to the local queue, plus the push/get workers that
//! reconcile the queue against the remote authority.

use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use db::LocalDb;
use parking_lot::Mutex;
use serde_json::{
    Map as JsonMap,
    Value as JsonValue,
};
use sql::{
    analyze,
    sql,
    RawSql,
};
use tokio::sync::{
    watch,
    Notify,
};

use crate::{
    apply::{
        apply_remote_batch,
        batch_undo_statements,
    },
    backoff::{
        retry_with_backoff,
        Backoff,
        OnlineDetector,
    },
    internal,
    pull::run_pull,
    remote::RemoteDb,
    types::{
        BatchStatus,
        Mutation,
        MutationBatch,
        MutationOp,
        NodeInfo,
        RowValues,
        UndoOp,
    },
};

const REMOTE_ATTEMPTS: u32 = 5;
const WORKER_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const WORKER_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Target logical database name carried on every batch.
    pub db_name: String,
    /// Human-readable name for this client's node identity.
    pub node_name: String,
    /// How many queued batches one push window may carry.
    pub push_batch_limit: usize,
    /// Idle polling interval of the worker loop.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_name: "app".to_owned(),
            node_name: "node".to_owned(),
            push_batch_limit: 10,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Sync lifecycle as observed by the local database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Initial,
    GettingLatest,
    Synced,
    Syncing,
}

pub struct SyncedDb {
    db: LocalDb,
    remote: Arc<dyn RemoteDb>,
    online: OnlineDetector,
    node: NodeInfo,
    config: SyncConfig,
    state: watch::Sender<SyncState>,
    wakeup: Notify,
    ulids: Mutex<ulid::Generator>,
}

impl SyncedDb {
    pub async fn new(
        db: LocalDb,
        remote: Arc<dyn RemoteDb>,
        online: OnlineDetector,
        config: SyncConfig,
    ) -> anyhow::Result<Arc<Self>> {
        db.driver().exec(internal::SYNC_INIT).await?;
        let node = internal::ensure_node(db.driver().as_ref(), &config.node_name).await?;
        let (state, _) = watch::channel(SyncState::Initial);
        Ok(Arc::new(Self {
            db,
            remote,
            online,
            node,
            config,
            state,
            wakeup: Notify::new(),
            ulids: Mutex::new(ulid::Generator::new()),
        }))
    }

    pub fn db(&self) -> &LocalDb {
        &self.db
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn online_detector(&self) -> &OnlineDetector {
        &self.online
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Batch ids are ULIDs minted monotonically within this client, so their
    /// lexicographic order is the local mutation order.
    fn next_batch_id(&self) -> String {
        let mut generator = self.ulids.lock();
        generator
            .generate()
            .map(|id| id.to_string())
            .unwrap_or_else(|_| ulid::Ulid::new().to_string())
    }

    fn make_batch(&self, mutations: Vec<Mutation>) -> MutationBatch {
        MutationBatch {
            id: self.next_batch_id(),
            db_name: self.config.db_name.clone(),
            node: self.node.clone(),
            mutations,
            server_timestamp_ms: None,
        }
    }

    /// Routes the user-table statements through analysis and the security
    /// engine, then runs them and the queue append in one transaction,
    /// invalidates and wakes the push loop. Same pipeline as the plain
    /// executor; a denied rule rejects the write before anything lands.
    async fn commit_local(
        &self,
        mut statements: Vec<RawSql>,
        batch: MutationBatch,
        table_db_name: &str,
        changed_ids: &[String],
    ) -> anyhow::Result<()> {
        for statement in &statements {
            let analysis = analyze(statement)?;
            self.db.security().check(&analysis).await?;
        }
        statements.push(internal::queue_insert_statement(&batch, BatchStatus::Local)?);
        self.db.driver().batch(&statements).await?;
        self.db.invalidate_table(table_db_name, changed_ids);
        self.state.send_replace(SyncState::Syncing);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Insert that records its inverse: a delete of the minted ids.
    pub async fn insert_with_undo(
        &self,
        table: &str,
        row: JsonMap<String, JsonValue>,
    ) -> anyhow::Result<JsonMap<String, JsonValue>> {
        let handle = self.db.table(table)?;
        let (statement, completed, ids) = handle.build_insert(row)?;
        let meta = handle.meta().clone();

        let mut storage = RowValues::new();
        for (key, value) in &completed {
            let column = meta
                .column(key)
                .with_context(|| format!("unknown column {key}"))?;
            storage.insert(column.db_name.clone(), column.encode_value(value)?);
        }
        let batch = self.make_batch(vec![Mutation {
            table: meta.db_name.clone(),
            op: MutationOp::Insert {
                rows: vec![storage],
            },
            undo: UndoOp::Delete { ids: ids.clone() },
        }]);
        self.commit_local(vec![statement], batch, &meta.db_name, &ids)
            .await?;
        Ok(completed)
    }

    /// Update of one row by id, recording the previous values as undo.
    pub async fn update_with_undo(
        &self,
        table: &str,
        id: &str,
        mut changes: JsonMap<String, JsonValue>,
    ) -> anyhow::Result<()> {
        let handle = self.db.table(table)?;
        let meta = handle.meta().clone();
        for column in &meta.columns {
            if let Some(producer) = &column.app_on_update {
                changes.insert(column.name.clone(), producer());
            }
        }
        if changes.is_empty() {
            anyhow::bail!("update with no columns");
        }

        let mut storage = RowValues::new();
        for (key, value) in &changes {
            let column = meta
                .column(key)
                .with_context(|| format!("unknown column {key}"))?;
            storage.insert(column.db_name.clone(), column.encode_value(value)?);
        }

        let column_list = storage.keys().cloned().collect::<Vec<_>>().join(", ");
        let rows = self
            .db
            .driver()
            .run(&sql!(
                "SELECT " [column_list.as_str()] " FROM " [meta.db_name.as_str()]
                " WHERE id = " {id}
            ))
            .await?;
        let previous_row = rows
            .first()
            .with_context(|| format!("row {id} not found in {table}"))?;
        let mut previous = RowValues::new();
        for (name, value) in previous_row {
            previous.insert(name.clone(), value.clone());
        }

        let mut statement = RawSql::new(format!("UPDATE {} SET ", meta.db_name));
        for (i, (column, value)) in storage.iter().enumerate() {
            if i > 0 {
                statement.push_str(", ");
            }
            statement.push_str(&format!("{column} = "));
            statement.bind(value.clone());
        }
        statement.push_str(" WHERE id = ");
        statement.bind(id);

        let batch = self.make_batch(vec![Mutation {
            table: meta.db_name.clone(),
            op: MutationOp::Update {
                id: id.to_owned(),
                changes: storage,
            },
            undo: UndoOp::Update {
                id: id.to_owned(),
                previous_changes: previous,
            },
        }]);
        self.commit_local(
            vec![statement],
            batch,
            &meta.db_name,
            &[id.to_owned()],
        )
        .await
    }

    /// Delete by ids, recording the removed rows as undo.
    pub async fn delete_with_undo(&self, table: &str, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let handle = self.db.table(table)?;
        let meta = handle.meta().clone();
        let columns: Vec<String> = meta
            .columns
            .iter()
            .filter(|c| !c.is_virtual())
            .map(|c| c.db_name.clone())
            .collect();

        let mut select = RawSql::new(format!(
            "SELECT {} FROM {} WHERE id IN (",
            columns.join(", "),
            meta.db_name
        ));
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                select.push_str(", ");
            }
            select.bind(id.as_str());
        }
        select.push_str(")");
        let rows = self.db.driver().run(&select).await?;
        let removed: Vec<RowValues> = rows
            .iter()
            .map(|row| row.iter().cloned().collect())
            .collect();

        let mut statement = RawSql::new(format!("DELETE FROM {} WHERE id IN (", meta.db_name));
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                statement.push_str(", ");
            }
            statement.bind(id.as_str());
        }
        statement.push_str(")");

        let batch = self.make_batch(vec![Mutation {
            table: meta.db_name.clone(),
            op: MutationOp::Delete { ids: ids.to_vec() },
            undo: UndoOp::Insert { rows: removed },
        }]);
        self.commit_local(vec![statement], batch, &meta.db_name, ids)
            .await
    }

    pub async fn has_unsynced(&self) -> anyhow::Result<bool> {
        let batches = internal::unpushed_batches(self.db.driver().as_ref(), 1).await?;
        Ok(!batches.is_empty())
    }

    /// One push window: drains the oldest unpushed batches to the remote,
    /// acks the accepted ones (stamping their columns with the assigned
    /// timestamp) and undoes the rejected ones.
    pub async fn push_once(&self) -> anyhow::Result<bool> {
        if !self.online.online() {
            return Ok(false);
        }
        let driver = self.db.driver().clone();
        let batches =
            internal::unpushed_batches(driver.as_ref(), self.config.push_batch_limit).await?;
        if batches.is_empty() {
            return Ok(false);
        }

        let mark_sent: Vec<RawSql> = batches
            .iter()
            .map(|b| internal::queue_status_statement(&b.id, BatchStatus::Sent, None))
            .collect();
        driver.batch(&mark_sent).await?;

        let to_send = batches.clone();
        let result = retry_with_backoff(REMOTE_ATTEMPTS, &self.online, || {
            self.remote.send(to_send.clone())
        })
        .await?;

        for acked in &result.succeeded {
            let Some(batch) = batches.iter().find(|b| b.id == acked.id) else {
                continue;
            };
            let ts = acked.server_timestamp_ms;
            let mut statements =
                vec![internal::queue_status_statement(&batch.id, BatchStatus::Acked, Some(ts))];
            for mutation in &batch.mutations {
                if let MutationOp::Delete { ids } = &mutation.op {
                    for id in ids {
                        statements.push(internal::column_timestamps_clear(&mutation.table, id));
                    }
                }
                for pk in mutation.op.row_ids() {
                    for column in mutation.op.touched_columns() {
                        statements.push(internal::column_timestamp_upsert(
                            &mutation.table,
                            &pk,
                            column,
                            ts,
                        ));
                    }
                }
            }
            driver.batch(&statements).await?;
        }

        for failed_id in &result.failed {
            let Some(batch) = batches.iter().find(|b| &b.id == failed_id) else {
                continue;
            };
            tracing::warn!(batch = %failed_id, "server rejected batch, undoing local effect");
            let mut statements = vec![
                internal::queue_status_statement(&batch.id, BatchStatus::Rejected, None),
                internal::failed_insert_statement(batch, "rejected by server")?,
            ];
            statements.extend(batch_undo_statements(batch));
            driver.batch(&statements).await?;
            for mutation in &batch.mutations {
                self.db.invalidate_table(&mutation.table, &[]);
            }
        }
        Ok(true)
    }

    /// One get window: fetches batches ordered after the local high-water
    /// mark and replays them through the resolver.
    pub async fn get_once(&self) -> anyhow::Result<bool> {
        if !self.online.online() {
            return Ok(false);
        }
        let driver = self.db.driver().clone();
        let after = internal::remote_watermark(driver.as_ref(), &self.node.id).await?;
        let batches =
            retry_with_backoff(REMOTE_ATTEMPTS, &self.online, || self.remote.get(after)).await?;
        if batches.is_empty() {
            return Ok(false);
        }
        let mut applied = false;
        for batch in batches {
            if internal::queue_lookup(driver.as_ref(), &batch.id).await?.is_some() {
                // Our own push, or a duplicate delivery.
                continue;
            }
            let ts = batch
                .server_timestamp_ms
                .context("remote returned a batch without a timestamp")?;
            let outcome = apply_remote_batch(driver.as_ref(), &batch, ts).await?;
            for table in &outcome.touched_tables {
                self.db.invalidate_table(table, &[]);
            }
            applied = true;
        }
        Ok(applied)
    }

    /// Initial resumable pull, then catch up on the mutation feed.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.state.send_replace(SyncState::GettingLatest);
        run_pull(&self.db, self.remote.as_ref(), &self.online).await?;
        self.get_once().await?;
        self.state.send_replace(SyncState::Synced);
        Ok(())
    }

    /// Resolves when the state reaches `Synced` with both queues drained.
    pub async fn wait_for_sync(&self) -> anyhow::Result<()> {
        let mut receiver = self.state.subscribe();
        loop {
            if *receiver.borrow() == SyncState::Synced && !self.has_unsynced().await? {
                return Ok(());
            }
            if receiver.changed().await.is_err() {
                anyhow::bail!("sync state channel closed");
            }
        }
    }

    /// The long-lived worker: bootstraps, then alternates push and get,
    /// waking on local writes, connectivity changes and the poll interval.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(WORKER_INITIAL_BACKOFF, WORKER_MAX_BACKOFF);
            let mut online_rx = this.online.subscribe();

            loop {
                if !this.online.online() {
                    if online_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                match this.bootstrap().await {
                    Ok(()) => break,
                    Err(error) => {
                        let delay = backoff.fail(&mut rand::rng());
                        tracing::error!(%error, ?delay, "bootstrap failed, backing off");
                        tokio::time::sleep(delay).await;
                    },
                }
            }
            backoff.reset();

            loop {
                let cycle: anyhow::Result<bool> = async {
                    let pushed = this.push_once().await?;
                    let got = this.get_once().await?;
                    Ok(pushed || got)
                }
                .await;
                match cycle {
                    Ok(worked) => {
                        backoff.reset();
                        let drained = !this.has_unsynced().await.unwrap_or(true);
                        if drained {
                            this.state.send_replace(SyncState::Synced);
                        } else if worked {
                            this.state.send_replace(SyncState::Syncing);
                        }
                    },
                    Err(error) => {
                        let delay = backoff.fail(&mut rand::rng());
                        tracing::error!(%error, ?delay, "sync cycle failed, backing off");
                        tokio::time::sleep(delay).await;
                    },
                }

                tokio::select! {
                    _ = this.wakeup.notified() => {},
                    _ = tokio::time::sleep(this.config.poll_interval) => {},
                    result = online_rx.changed() => {
                        if result.is_err() {
                            return;
                        }
                    },
                }
            }
        })
    }
}
