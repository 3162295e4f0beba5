//! Wire and queue types: the mutation batch is the unit the client sends
//! and the server totally orders.

use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};
use sql::SqlValue;

/// Server-assigned milliseconds; defines the total order of all mutations.
pub type Timestamp = u64;

/// Storage-level values of one row, keyed by storage column name.
pub type RowValues = BTreeMap<String, SqlValue>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationOp {
    Insert { rows: Vec<RowValues> },
    Update { id: String, changes: RowValues },
    Delete { ids: Vec<String> },
}

impl MutationOp {
    /// The storage columns this operation touches, for per-column timestamp
    /// bookkeeping. Deletes stamp the row's `id` tombstone.
    pub fn touched_columns(&self) -> Vec<&str> {
        match self {
            MutationOp::Insert { rows } => {
                let mut out: Vec<&str> = Vec::new();
                for row in rows {
                    for column in row.keys() {
                        if !out.contains(&column.as_str()) {
                            out.push(column);
                        }
                    }
                }
                out
            },
            MutationOp::Update { changes, .. } => {
                changes.keys().map(String::as_str).collect()
            },
            MutationOp::Delete { .. } => vec!["id"],
        }
    }

    /// The row ids this operation touches.
    pub fn row_ids(&self) -> Vec<String> {
        match self {
            MutationOp::Insert { rows } => rows
                .iter()
                .filter_map(|row| match row.get("id") {
                    Some(SqlValue::Text(id)) => Some(id.clone()),
                    _ => None,
                })
                .collect(),
            MutationOp::Update { id, .. } => vec![id.clone()],
            MutationOp::Delete { ids } => ids.clone(),
        }
    }
}

/// Precomputed inverse of a mutation, applied to roll back the local effect
/// on rejection or reorder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UndoOp {
    /// Undoes a delete by restoring the removed rows.
    Insert { rows: Vec<RowValues> },
    /// Undoes an update by restoring the previous values.
    Update { id: String, previous_changes: RowValues },
    /// Undoes an insert by deleting the inserted ids.
    Delete { ids: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Storage table name.
    pub table: String,
    pub op: MutationOp,
    pub undo: UndoOp,
}

/// An atomic group of mutations: the server accepts all of them or none,
/// idempotently by `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Client-minted ULID, monotonic within the client.
    pub id: String,
    /// Target logical database.
    pub db_name: String,
    pub node: NodeInfo,
    pub mutations: Vec<Mutation>,
    /// Assigned by the server on acceptance.
    pub server_timestamp_ms: Option<Timestamp>,
}

/// Outcome of pushing a group of batches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub succeeded: Vec<AckedBatch>,
    pub failed: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckedBatch {
    pub id: String,
    pub server_timestamp_ms: Timestamp,
}

/// Queue status of a batch as persisted in `_db_mutations_queue`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Local,
    Sent,
    Acked,
    Rejected,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Local => "local",
            BatchStatus::Sent => "sent",
            BatchStatus::Acked => "acked",
            BatchStatus::Rejected => "rejected",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "local" => Some(BatchStatus::Local),
            "sent" => Some(BatchStatus::Sent),
            "acked" => Some(BatchStatus::Acked),
            "rejected" => Some(BatchStatus::Rejected),
            _ => None,
        }
    }
}

/// Per-table resumable pull cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullState {
    Pending,
    Partial,
    All,
}

impl PullState {
    pub fn as_str(self) -> &'static str {
        match self {
            PullState::Pending => "pending",
            PullState::Partial => "partial",
            PullState::All => "all",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "pending" => Some(PullState::Pending),
            "partial" => Some(PullState::Partial),
            "all" => Some(PullState::All),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    pub state: PullState,
    pub next_offset: u64,
}

/// What the client sends when resuming a pull: per-table progress; the
/// server skips tables marked `all` and resumes the rest from their offset.
pub type ResumeState = BTreeMap<String, PullProgress>;

/// The batch was rejected by the remote for conflict reasons and moved to
/// `_failed_mutations`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("batch {batch_id} rejected: {reason}")]
pub struct ConflictRejection {
    pub batch_id: String,
    pub reason: String,
}
