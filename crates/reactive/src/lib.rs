//! A reactive query/mutation cache: queries keyed by canonical key
//! fingerprints, deduped in-flight fetches with abortable cancellation,
//! retry with backoff, staleness and GC driven by observers, filtered
//! invalidation and window-focus refetch.

pub mod client;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod query;
pub mod retry;

pub use client::{
    FilterKind,
    QueryClient,
    QueryClientConfig,
    QueryFilters,
    QuerySpec,
};
pub use infinite::{
    CursorFn,
    InfiniteQuery,
    PageFn,
};
pub use key::{
    hash_key,
    prefix_matches,
    QueryKey,
};
pub use mutation::{
    Mutation,
    MutationObserver,
    MutationOptions,
    MutationState,
    MutationStatus,
};
pub use query::{
    FetchResult,
    FetchSignal,
    FetchStatus,
    Fetcher,
    Query,
    QueryObserver,
    QueryState,
    QueryStatus,
};
pub use retry::{
    Retry,
    RetryDelay,
};
