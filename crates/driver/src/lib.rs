//! Uniform driver interface over any SQLite-like engine, plus the adapter
//! that respects per-statement parameter caps on constrained back-ends.

use async_trait::async_trait;
use sql::{
    RawSql,
    SqlRow,
};

mod limits;
mod sqlite;

pub use limits::{
    split_oversized_insert,
    LimitedDriver,
};
pub use sqlite::{
    SqliteDriver,
    SqliteTransaction,
};

/// Engine-level failure, passed through unchanged; transactions roll back.
#[derive(thiserror::Error, Debug)]
#[error("driver error: {0}")]
pub struct DriverError(pub String);

/// Per-statement / per-batch caps. Constrained HTTP back-ends sit around
/// 100 parameters and 50 statements; embedded engines are effectively
/// unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverLimits {
    pub max_parameters_per_statement: Option<usize>,
    pub max_statements_per_batch: Option<usize>,
}

impl DriverLimits {
    pub const UNLIMITED: DriverLimits = DriverLimits {
        max_parameters_per_statement: None,
        max_statements_per_batch: None,
    };

    /// The defaults for cloud-SQLite back-ends.
    pub const CONSTRAINED: DriverLimits = DriverLimits {
        max_parameters_per_statement: Some(100),
        max_statements_per_batch: Some(50),
    };
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Executes DDL. The text may contain multiple `;`-separated statements.
    async fn exec(&self, sql_text: &str) -> anyhow::Result<()>;

    /// Runs one statement. SELECT-like statements return decoded rows with
    /// engine-cased column names; everything else returns `[]`.
    async fn run(&self, statement: &RawSql) -> anyhow::Result<Vec<SqlRow>>;

    /// Runs statements atomically: all succeed or all roll back. Results are
    /// indexed like the input.
    async fn batch(&self, statements: &[RawSql]) -> anyhow::Result<Vec<Vec<SqlRow>>>;

    async fn begin_transaction(&self) -> anyhow::Result<Box<dyn DriverTransaction>>;

    fn limits(&self) -> DriverLimits {
        DriverLimits::UNLIMITED
    }
}

/// An open transaction. `run` is write-only: some back-ends defer statements
/// until commit, so reads mid-transaction cannot be answered uniformly and
/// are rejected everywhere.
#[async_trait]
pub trait DriverTransaction: Send {
    async fn run(&mut self, statement: &RawSql) -> anyhow::Result<()>;
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// True for statements that produce rows and are therefore rejected inside
/// transactions.
pub(crate) fn is_select_like(query: &str) -> bool {
    let trimmed = query.trim_start();
    ["SELECT", "WITH", "VALUES"]
        .iter()
        .any(|kw| starts_with_keyword(trimmed, kw))
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    text.len() >= keyword.len()
        && text[..keyword.len()].eq_ignore_ascii_case(keyword)
        && text[keyword.len()..]
            .chars()
            .next()
            .map(|c| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(true)
}
