//! The local database facade: opens a driver against a declared schema,
//! migrates it forward, and exposes typed per-table operations routed
//! through analysis, security and live-query invalidation.

use std::sync::Arc;

use anyhow::Context;
use driver::Driver;
use schema::{
    diff,
    Schema,
    SchemaSnapshot,
};
use sql::{
    analyze,
    row_get,
    RawSql,
    SqlRow,
    SqlValue,
};

pub mod error;
pub mod live;
pub mod query;
pub mod security;

pub use error::DbError;
pub use live::{
    InvalidationEvent,
    LiveQueryManager,
    LiveSubscription,
};
pub use query::{
    QueryDescriptor,
    SelectBuilder,
    TableHandle,
};
pub use security::{
    rule_fn,
    SecurityEngine,
    SecurityRule,
    User,
};

const MIGRATIONS_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    snapshot_hash TEXT NOT NULL,

    PRIMARY KEY (id)
);
"#;

pub(crate) struct DbInner {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) schema: Schema,
    pub(crate) security: SecurityEngine,
    pub(crate) live: LiveQueryManager,
}

/// A full local replica of the declared schema. Cheap to clone; all clones
/// share the driver, security rules and live-query registry.
#[derive(Clone)]
pub struct LocalDb {
    pub(crate) inner: Arc<DbInner>,
}

impl std::fmt::Debug for LocalDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDb").finish_non_exhaustive()
    }
}

impl LocalDb {
    /// Opens the database: creates the migration bookkeeping table, diffs
    /// the stored snapshot against the declared schema, applies the DDL and
    /// stores the new snapshot in the same transaction. Migration errors
    /// abort the open; nothing is written when no DDL is needed.
    pub async fn open(driver: Arc<dyn Driver>, schema: Schema) -> anyhow::Result<LocalDb> {
        driver.exec(MIGRATIONS_INIT).await?;

        let stored = load_snapshot(driver.as_ref()).await?;
        let current = SchemaSnapshot::of(&schema);
        let previous = stored.unwrap_or_default();
        if previous.hash() != current.hash() {
            let plan = diff(&previous, &current)?;
            if !plan.is_empty() {
                let mut statements: Vec<RawSql> =
                    plan.statements().into_iter().map(RawSql::new).collect();
                let mut record = RawSql::new(
                    "INSERT OR REPLACE INTO _migrations (id, snapshot_json, snapshot_hash) \
                     VALUES ('snapshot', ",
                );
                record.bind(current.canonical_json());
                record.push_str(", ");
                record.bind(current.hash());
                record.push_str(")");
                statements.push(record);
                tracing::info!(
                    steps = plan.steps.len(),
                    hash = current.hash(),
                    "applying schema migration"
                );
                driver.batch(&statements).await.context("schema migration failed")?;
            }
        }

        Ok(LocalDb {
            inner: Arc::new(DbInner {
                driver,
                schema,
                security: SecurityEngine::default(),
                live: LiveQueryManager::default(),
            }),
        })
    }

    pub fn table(&self, name: &str) -> anyhow::Result<TableHandle> {
        let table = self
            .inner
            .schema
            .table(name)
            .with_context(|| format!("table {name} is not declared"))?
            .clone();
        Ok(TableHandle {
            db: self.clone(),
            table,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub fn security(&self) -> &SecurityEngine {
        &self.inner.security
    }

    pub fn live(&self) -> &LiveQueryManager {
        &self.inner.live
    }

    /// Runs raw SQL through the full pipeline: analysis, security, driver,
    /// and table invalidation for writes.
    pub async fn run(&self, statement: &RawSql) -> anyhow::Result<Vec<SqlRow>> {
        let analysis = analyze(statement)?;
        self.inner.security.check(&analysis).await?;
        let rows = self.inner.driver.run(statement).await?;
        if analysis.is_write() {
            if let Some(target) = analysis.accessed_tables.first() {
                self.inner.live.invalidate(&target.name, &[]);
            }
        }
        Ok(rows)
    }

    /// Executes a write statement built by a table handle; invalidation
    /// fires only after the driver reports the commit.
    pub(crate) async fn execute_write(
        &self,
        statement: &RawSql,
        table_name: &str,
        changed_ids: &[String],
    ) -> anyhow::Result<()> {
        let analysis = analyze(statement)?;
        self.inner.security.check(&analysis).await?;
        self.inner.driver.run(statement).await?;
        self.inner.live.invalidate(table_name, changed_ids);
        Ok(())
    }

    /// Table invalidation, keyed by storage name — the name the analyzer
    /// sees in SQL and therefore the name subscriptions hold.
    pub fn invalidate_table(&self, db_name: &str, changed_ids: &[String]) {
        self.inner.live.invalidate(db_name, changed_ids);
    }

    /// The migration bookkeeping row, if any: `(snapshot, hash)`.
    pub async fn stored_snapshot(&self) -> anyhow::Result<Option<(SchemaSnapshot, String)>> {
        let stored = load_snapshot(self.inner.driver.as_ref()).await?;
        Ok(match stored {
            Some(snapshot) => {
                let hash = snapshot.hash();
                Some((snapshot, hash))
            },
            None => None,
        })
    }
}

async fn load_snapshot(driver: &dyn Driver) -> anyhow::Result<Option<SchemaSnapshot>> {
    let rows = driver
        .run(&RawSql::new(
            "SELECT snapshot_json FROM _migrations WHERE id = 'snapshot'",
        ))
        .await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    match row_get(row, "snapshot_json") {
        Some(SqlValue::Text(json)) => {
            let snapshot = serde_json::from_str(json).context("stored snapshot is corrupt")?;
            Ok(Some(snapshot))
        },
        _ => Ok(None),
    }
}
