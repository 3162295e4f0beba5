//! One cached query: fingerprint-keyed state machine with in-flight dedupe,
//! abortable fetches, retry, staleness and observer-driven garbage
//! collection. The in-flight handle is both the shared result every
//! concurrent `fetch` awaits and the target `cancel` aborts.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use futures::{
    future::{
        AbortHandle,
        Abortable,
        BoxFuture,
        Shared,
    },
    FutureExt,
};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::watch;

use crate::{
    key::QueryKey,
    retry::{
        Retry,
        RetryDelay,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    Paused,
}

#[derive(Clone, Debug)]
pub struct QueryState {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<JsonValue>,
    pub error: Option<Arc<anyhow::Error>>,
    pub data_updated_at: Option<tokio::time::Instant>,
    pub fetch_failure_count: u32,
    pub is_invalidated: bool,
}

impl QueryState {
    fn initial() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            fetch_failure_count: 0,
            is_invalidated: false,
        }
    }
}

/// Handed to the fetch function; observes cancellation cooperatively. The
/// fetch is also hard-aborted at its next suspension point.
#[derive(Clone)]
pub struct FetchSignal {
    cancelled: watch::Receiver<bool>,
}

impl FetchSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub async fn cancelled(&mut self) {
        while !*self.cancelled.borrow() {
            if self.cancelled.changed().await.is_err() {
                return;
            }
        }
    }

    /// A signal that never fires, for direct fetcher invocations.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Self { cancelled: rx }
    }
}

pub type Fetcher =
    Arc<dyn Fn(FetchSignal) -> BoxFuture<'static, anyhow::Result<JsonValue>> + Send + Sync>;

pub type FetchResult = Result<JsonValue, Arc<anyhow::Error>>;

#[derive(Clone)]
pub struct QueryOptions {
    pub fetcher: Fetcher,
    pub enabled: bool,
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    pub refetch_on_window_focus: bool,
}

struct InFlight {
    shared: Shared<BoxFuture<'static, FetchResult>>,
    abort: AbortHandle,
    cancel: watch::Sender<bool>,
}

type ObserverCallback = Arc<dyn Fn(&QueryState) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    callbacks: HashMap<u64, ObserverCallback>,
}

pub(crate) struct QueryShared {
    pub(crate) key: QueryKey,
    pub(crate) key_hash: String,
    options: Mutex<QueryOptions>,
    state: Mutex<QueryState>,
    observers: Mutex<Observers>,
    in_flight: Mutex<Option<InFlight>>,
    gc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Removes this query from its owning cache once collected.
    remove_hook: Mutex<Option<Box<dyn Fn() + Send>>>,
}

#[derive(Clone)]
pub struct Query {
    pub(crate) inner: Arc<QueryShared>,
}

impl Query {
    pub(crate) fn new(key: QueryKey, key_hash: String, options: QueryOptions) -> Self {
        Self {
            inner: Arc::new(QueryShared {
                key,
                key_hash,
                options: Mutex::new(options),
                state: Mutex::new(QueryState::initial()),
                observers: Mutex::new(Observers::default()),
                in_flight: Mutex::new(None),
                gc_task: Mutex::new(None),
                remove_hook: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub fn key_hash(&self) -> &str {
        &self.inner.key_hash
    }

    pub fn state(&self) -> QueryState {
        self.inner.state.lock().clone()
    }

    pub fn options(&self) -> QueryOptions {
        self.inner.options.lock().clone()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().callbacks.len()
    }

    pub fn is_active(&self) -> bool {
        self.observer_count() > 0
    }

    pub(crate) fn set_remove_hook(&self, hook: Box<dyn Fn() + Send>) {
        *self.inner.remove_hook.lock() = Some(hook);
    }

    /// Stale means refetch-worthy: never fetched, invalidated, errored, or
    /// data older than `stale_time`.
    pub fn is_stale(&self) -> bool {
        let stale_time = self.inner.options.lock().stale_time;
        let state = self.inner.state.lock();
        match state.status {
            QueryStatus::Pending | QueryStatus::Error => true,
            QueryStatus::Success => {
                state.is_invalidated
                    || state
                        .data_updated_at
                        .map(|at| at.elapsed() >= stale_time)
                        .unwrap_or(true)
            },
        }
    }

    fn notify(&self) {
        let state = self.state();
        let callbacks: Vec<ObserverCallback> = {
            let observers = self.inner.observers.lock();
            observers.callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            callback(&state);
        }
    }

    /// Subscribes an observer. The guard unsubscribes on drop; the last
    /// unsubscribe arms the GC timer. Subscribing refetches stale enabled
    /// queries.
    pub fn subscribe(&self, callback: impl Fn(&QueryState) + Send + Sync + 'static) -> QueryObserver {
        if let Some(task) = self.inner.gc_task.lock().take() {
            task.abort();
        }
        let id = {
            let mut observers = self.inner.observers.lock();
            let id = observers.next_id;
            observers.next_id += 1;
            observers.callbacks.insert(id, Arc::new(callback));
            id
        };
        let enabled = self.inner.options.lock().enabled;
        if enabled && self.is_stale() {
            self.spawn_fetch();
        }
        QueryObserver {
            query: self.clone(),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        let now_empty = {
            let mut observers = self.inner.observers.lock();
            observers.callbacks.remove(&id);
            observers.callbacks.is_empty()
        };
        if now_empty {
            self.schedule_gc();
        }
    }

    fn schedule_gc(&self) {
        let gc_time = self.inner.options.lock().gc_time;
        let query = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(gc_time).await;
            if query.observer_count() == 0 {
                query.cancel();
                if let Some(hook) = query.inner.remove_hook.lock().as_ref() {
                    hook();
                }
                tracing::debug!(key = %query.inner.key_hash, "query garbage-collected");
            }
        });
        let previous = self.inner.gc_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Starts a fetch in the background (deduped like [`Query::fetch`]).
    pub fn spawn_fetch(&self) {
        let shared = self.ensure_in_flight();
        tokio::spawn(shared.map(|_| ()));
    }

    /// Fetches, deduping concurrent calls onto one in-flight task: if a
    /// fetch is running its shared result is awaited instead of starting
    /// another.
    pub async fn fetch(&self) -> FetchResult {
        let shared = self.ensure_in_flight();
        shared.await
    }

    fn ensure_in_flight(&self) -> Shared<BoxFuture<'static, FetchResult>> {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(existing) = in_flight.as_ref() {
            return existing.shared.clone();
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        {
            let mut state = self.inner.state.lock();
            state.fetch_status = FetchStatus::Fetching;
        }

        let query = self.clone();
        let attempts = async move {
            let result = query.run_attempts(FetchSignal {
                cancelled: cancel_rx,
            })
            .await;
            query.inner.in_flight.lock().take();
            result
        };
        let abortable = Abortable::new(attempts, abort_registration);
        let cancelled_error: BoxFuture<'static, FetchResult> = async move {
            match abortable.await {
                Ok(result) => result,
                Err(_aborted) => Err(Arc::new(anyhow::anyhow!("query fetch cancelled"))),
            }
        }
        .boxed();
        let shared = cancelled_error.shared();
        *in_flight = Some(InFlight {
            shared: shared.clone(),
            abort: abort_handle,
            cancel: cancel_tx,
        });
        drop(in_flight);

        // Drive the fetch even if nobody awaits the returned handle.
        tokio::spawn(shared.clone().map(|_| ()));
        self.notify();
        shared
    }

    async fn run_attempts(&self, signal: FetchSignal) -> FetchResult {
        loop {
            let fetcher = self.inner.options.lock().fetcher.clone();
            match fetcher(signal.clone()).await {
                Ok(data) => {
                    {
                        let mut state = self.inner.state.lock();
                        state.status = QueryStatus::Success;
                        state.fetch_status = FetchStatus::Idle;
                        state.data = Some(data.clone());
                        state.error = None;
                        state.fetch_failure_count = 0;
                        state.is_invalidated = false;
                        state.data_updated_at = Some(tokio::time::Instant::now());
                    }
                    self.notify();
                    return Ok(data);
                },
                Err(error) => {
                    let failure_count = {
                        let mut state = self.inner.state.lock();
                        state.fetch_failure_count += 1;
                        state.fetch_failure_count
                    };
                    self.notify();
                    let (retry, retry_delay) = {
                        let options = self.inner.options.lock();
                        (options.retry.clone(), options.retry_delay.clone())
                    };
                    if retry.should_retry(failure_count, &error) && !signal.is_cancelled() {
                        let delay = retry_delay.delay(failure_count, &error);
                        tracing::debug!(
                            key = %self.inner.key_hash,
                            failure_count,
                            ?delay,
                            "fetch failed, retrying"
                        );
                        // Between attempts the fetch is paused, not idle.
                        self.inner.state.lock().fetch_status = FetchStatus::Paused;
                        self.notify();
                        tokio::time::sleep(delay).await;
                        self.inner.state.lock().fetch_status = FetchStatus::Fetching;
                        self.notify();
                        continue;
                    }
                    let error = Arc::new(error);
                    {
                        // The last error never clears data.
                        let mut state = self.inner.state.lock();
                        state.status = QueryStatus::Error;
                        state.fetch_status = FetchStatus::Idle;
                        state.error = Some(error.clone());
                    }
                    self.notify();
                    return Err(error);
                },
            }
        }
    }

    /// Marks stale; starts a refetch unless one is already running (in
    /// which case its result will serve).
    pub fn invalidate(&self) {
        {
            let mut state = self.inner.state.lock();
            state.is_invalidated = true;
        }
        self.notify();
        let fetching = self.inner.in_flight.lock().is_some();
        let enabled = self.inner.options.lock().enabled;
        if !fetching && enabled {
            self.spawn_fetch();
        }
    }

    /// Aborts the in-flight fetch, if any, and returns to idle without
    /// touching data.
    pub fn cancel(&self) {
        if let Some(in_flight) = self.inner.in_flight.lock().take() {
            in_flight.cancel.send_replace(true);
            in_flight.abort.abort();
        }
        {
            let mut state = self.inner.state.lock();
            state.fetch_status = FetchStatus::Idle;
        }
        self.notify();
    }

    /// Gates auto-fetching; turning a stale query back on refetches it.
    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = {
            let mut options = self.inner.options.lock();
            std::mem::replace(&mut options.enabled, enabled)
        };
        if enabled && !was_enabled && self.is_active() && self.is_stale() {
            self.spawn_fetch();
        }
    }

    /// Overwrites cached data directly (used by paging and optimistic
    /// updates); marks the query fresh.
    pub fn set_data(&self, data: JsonValue) {
        {
            let mut state = self.inner.state.lock();
            state.status = QueryStatus::Success;
            state.data = Some(data);
            state.error = None;
            state.is_invalidated = false;
            state.data_updated_at = Some(tokio::time::Instant::now());
        }
        self.notify();
    }
}

/// Unsubscribes its observer on drop.
pub struct QueryObserver {
    query: Query,
    id: u64,
}

impl QueryObserver {
    pub fn query(&self) -> &Query {
        &self.query
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.query.unsubscribe(self.id);
    }
}
