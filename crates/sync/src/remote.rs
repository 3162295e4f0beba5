use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::types::{
    MutationBatch,
    ResumeState,
    SendResult,
    Timestamp,
};

/// The pull wire: chunks of frame-encoded bytes until the end marker.
pub type ByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// The remote authority. Implementations translate these calls onto a
/// transport; the in-process [`crate::server::SyncServer`] implements it
/// directly over a driver.
#[async_trait]
pub trait RemoteDb: Send + Sync {
    /// Initial bulk transfer, resumable per table: the server skips tables
    /// the client already holds fully and resumes the rest from their
    /// offsets.
    async fn pull(&self, resume: ResumeState) -> anyhow::Result<ByteStream>;

    /// Pushes mutation batches. The server is idempotent on batch id: a
    /// re-sent accepted batch returns the same timestamp and is not
    /// re-applied.
    async fn send(&self, batches: Vec<MutationBatch>) -> anyhow::Result<SendResult>;

    /// Batches with a server timestamp strictly greater than the caller's
    /// high-water mark, ascending.
    async fn get(&self, max_server_timestamp: Timestamp) -> anyhow::Result<Vec<MutationBatch>>;
}
