//! Bidirectional synchronization over a [`db::LocalDb`]: resumable columnar
//! bulk pull, an undo-carrying mutation log pushed to a totally-ordering
//! remote, per-column last-write-wins conflict resolution, and the
//! in-process server that assigns the order.

pub mod apply;
pub mod backoff;
pub mod batch;
pub mod client;
pub mod frames;
pub mod internal;
pub mod pull;
pub mod remote;
pub mod server;
pub mod types;

pub use backoff::{
    retry_with_backoff,
    Backoff,
    NetworkError,
    OnlineDetector,
};
pub use client::{
    SyncConfig,
    SyncState,
    SyncedDb,
};
pub use frames::{
    Frame,
    FrameDecoder,
};
pub use remote::{
    ByteStream,
    RemoteDb,
};
pub use server::{
    RemoteDbConfig,
    SyncServer,
};
pub use types::{
    AckedBatch,
    BatchStatus,
    ConflictRejection,
    Mutation,
    MutationBatch,
    MutationOp,
    NodeInfo,
    PullProgress,
    PullState,
    ResumeState,
    SendResult,
    Timestamp,
    UndoOp,
};
