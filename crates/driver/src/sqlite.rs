use std::{
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{
    params_from_iter,
    types::{
        Value as RusqliteValue,
        ValueRef,
    },
    Connection,
};
use sql::{
    RawSql,
    SqlRow,
    SqlValue,
};

use crate::{
    is_select_like,
    Driver,
    DriverError,
    DriverLimits,
    DriverTransaction,
};

/// Driver over an embedded SQLite connection. The connection does not allow
/// concurrent use, so every call serializes behind one mutex; the lock is
/// never held across an await.
pub struct SqliteDriver {
    inner: Arc<Mutex<Connection>>,
    newly_created: bool,
}

impl SqliteDriver {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let newly_created = !path.as_ref().exists();
        let connection = Connection::open(path)?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            inner: Arc::new(Mutex::new(connection)),
            newly_created,
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let connection = Connection::open_in_memory()?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            inner: Arc::new(Mutex::new(connection)),
            newly_created: true,
        })
    }

    pub fn is_fresh(&self) -> bool {
        self.newly_created
    }
}

fn to_rusqlite(value: &SqlValue) -> RusqliteValue {
    match value {
        SqlValue::Null => RusqliteValue::Null,
        SqlValue::Integer(i) => RusqliteValue::Integer(*i),
        SqlValue::Real(f) => RusqliteValue::Real(*f),
        SqlValue::Text(s) => RusqliteValue::Text(s.clone()),
        SqlValue::Blob(b) => RusqliteValue::Blob(b.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> anyhow::Result<SqlValue> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) => SqlValue::Text(
            std::str::from_utf8(bytes)
                .context("engine returned non-UTF-8 text")?
                .to_owned(),
        ),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    })
}

/// Runs one statement on a borrowed connection; shared by `run`, `batch`
/// and the transaction object.
fn run_on(connection: &Connection, statement: &RawSql) -> anyhow::Result<Vec<SqlRow>> {
    let mut stmt = connection
        .prepare(&statement.query)
        .map_err(|e| DriverError(e.to_string()))?;
    let params = params_from_iter(statement.params.iter().map(to_rusqlite));
    if stmt.column_count() == 0 {
        stmt.execute(params).map_err(|e| DriverError(e.to_string()))?;
        return Ok(Vec::new());
    }
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let mut rows = stmt.query(params).map_err(|e| DriverError(e.to_string()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| DriverError(e.to_string()))? {
        let mut decoded = SqlRow::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let value = row.get_ref(i).map_err(|e| DriverError(e.to_string()))?;
            decoded.push((name.clone(), from_value_ref(value)?));
        }
        out.push(decoded);
    }
    Ok(out)
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn exec(&self, sql_text: &str) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection
            .execute_batch(sql_text)
            .map_err(|e| DriverError(e.to_string()))?;
        Ok(())
    }

    async fn run(&self, statement: &RawSql) -> anyhow::Result<Vec<SqlRow>> {
        let connection = self.inner.lock();
        run_on(&connection, statement)
    }

    async fn batch(&self, statements: &[RawSql]) -> anyhow::Result<Vec<Vec<SqlRow>>> {
        let mut connection = self.inner.lock();
        let tx = connection.transaction().map_err(|e| DriverError(e.to_string()))?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            match run_on(&tx, statement) {
                Ok(rows) => results.push(rows),
                Err(error) => {
                    tx.rollback().ok();
                    return Err(error);
                },
            }
        }
        tx.commit().map_err(|e| DriverError(e.to_string()))?;
        Ok(results)
    }

    async fn begin_transaction(&self) -> anyhow::Result<Box<dyn DriverTransaction>> {
        {
            let connection = self.inner.lock();
            connection
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| DriverError(e.to_string()))?;
        }
        Ok(Box::new(SqliteTransaction {
            inner: self.inner.clone(),
            open: true,
        }))
    }
}

pub struct SqliteTransaction {
    inner: Arc<Mutex<Connection>>,
    open: bool,
}

#[async_trait]
impl DriverTransaction for SqliteTransaction {
    async fn run(&mut self, statement: &RawSql) -> anyhow::Result<()> {
        if is_select_like(&statement.query) {
            anyhow::bail!("SELECT is not allowed inside a transaction");
        }
        let connection = self.inner.lock();
        run_on(&connection, statement)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection
            .execute_batch("COMMIT")
            .map_err(|e| DriverError(e.to_string()))?;
        self.open = false;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection
            .execute_batch("ROLLBACK")
            .map_err(|e| DriverError(e.to_string()))?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.open {
            tracing::warn!("transaction dropped without commit; rolling back");
            let connection = self.inner.lock();
            connection.execute_batch("ROLLBACK").ok();
        }
    }
}
