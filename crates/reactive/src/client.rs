//! The cache owner: fingerprint-keyed query and mutation maps, default
//! option merging, filtered invalidation and the single window-focus
//! refetch hook.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    key::{
        hash_key,
        prefix_matches,
        QueryKey,
    },
    mutation::{
        Mutation,
        MutationOptions,
    },
    query::{
        FetchStatus,
        Fetcher,
        Query,
        QueryOptions,
    },
    retry::{
        Retry,
        RetryDelay,
    },
};

#[derive(Clone)]
pub struct QueryClientConfig {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub refetch_on_window_focus: bool,
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    /// Object keys dropped from key fingerprints at any depth.
    pub ignored_key_fields: Vec<String>,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_millis(1000),
            gc_time: Duration::from_secs(5 * 60),
            refetch_on_window_focus: true,
            retry: Retry::Count(3),
            retry_delay: RetryDelay::Default,
            ignored_key_fields: Vec::new(),
        }
    }
}

/// Per-query overrides; anything unset falls back to the client defaults.
#[derive(Clone)]
pub struct QuerySpec {
    pub fetcher: Fetcher,
    pub enabled: Option<bool>,
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub refetch_on_window_focus: Option<bool>,
}

impl QuerySpec {
    pub fn new(
        fetcher: impl Fn(crate::query::FetchSignal) -> futures::future::BoxFuture<'static, anyhow::Result<serde_json::Value>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            enabled: None,
            stale_time: None,
            gc_time: None,
            retry: None,
            retry_delay: None,
            refetch_on_window_focus: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn refetch_on_window_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_window_focus = Some(refetch);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterKind {
    Active,
    Inactive,
    #[default]
    All,
}

/// Filters for [`QueryClient::invalidate_queries`] and friends. A partial
/// key matches by hash-equal prefix segments; `exact` requires the whole
/// key.
#[derive(Clone, Default)]
pub struct QueryFilters {
    pub query_key: Option<QueryKey>,
    pub exact: bool,
    pub kind: FilterKind,
    pub stale: Option<bool>,
    pub fetch_status: Option<FetchStatus>,
    pub predicate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

struct ClientInner {
    config: QueryClientConfig,
    queries: Mutex<HashMap<String, Query>>,
    mutations: Mutex<HashMap<String, Mutation>>,
}

#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(config: QueryClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                queries: Mutex::new(HashMap::new()),
                mutations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &QueryClientConfig {
        &self.inner.config
    }

    fn ignore_set(&self) -> Vec<&str> {
        self.inner
            .config
            .ignored_key_fields
            .iter()
            .map(String::as_str)
            .collect()
    }

    /// Gets or creates the query for `key`, merging the spec over the
    /// client defaults. Two calls with canonically-equal keys share one
    /// entry.
    pub fn query(&self, key: QueryKey, spec: QuerySpec) -> Query {
        let ignore = self.ignore_set();
        let key_hash = hash_key(&key, &ignore);
        let mut queries = self.inner.queries.lock();
        if let Some(existing) = queries.get(&key_hash) {
            return existing.clone();
        }
        let config = &self.inner.config;
        let options = QueryOptions {
            fetcher: spec.fetcher,
            enabled: spec.enabled.unwrap_or(true),
            stale_time: spec.stale_time.unwrap_or(config.stale_time),
            gc_time: spec.gc_time.unwrap_or(config.gc_time),
            retry: spec.retry.unwrap_or_else(|| config.retry.clone()),
            retry_delay: spec
                .retry_delay
                .unwrap_or_else(|| config.retry_delay.clone()),
            refetch_on_window_focus: spec
                .refetch_on_window_focus
                .unwrap_or(config.refetch_on_window_focus),
        };
        let query = Query::new(key, key_hash.clone(), options);
        let client = Arc::downgrade(&self.inner);
        let hash_for_hook = key_hash.clone();
        query.set_remove_hook(Box::new(move || {
            if let Some(client) = client.upgrade() {
                client.queries.lock().remove(&hash_for_hook);
            }
        }));
        queries.insert(key_hash, query.clone());
        query
    }

    pub fn get_query(&self, key: &QueryKey) -> Option<Query> {
        let ignore = self.ignore_set();
        let key_hash = hash_key(key, &ignore);
        self.inner.queries.lock().get(&key_hash).cloned()
    }

    pub fn query_count(&self) -> usize {
        self.inner.queries.lock().len()
    }

    fn matching(&self, filters: &QueryFilters) -> Vec<Query> {
        let ignore = self.ignore_set();
        let queries: Vec<Query> = self.inner.queries.lock().values().cloned().collect();
        queries
            .into_iter()
            .filter(|query| {
                if let Some(key) = &filters.query_key {
                    let matched = if filters.exact {
                        hash_key(key, &ignore) == query.key_hash()
                    } else {
                        prefix_matches(key, query.key(), &ignore)
                    };
                    if !matched {
                        return false;
                    }
                }
                match filters.kind {
                    FilterKind::Active if !query.is_active() => return false,
                    FilterKind::Inactive if query.is_active() => return false,
                    _ => {},
                }
                if let Some(stale) = filters.stale {
                    if query.is_stale() != stale {
                        return false;
                    }
                }
                if let Some(fetch_status) = filters.fetch_status {
                    if query.state().fetch_status != fetch_status {
                        return false;
                    }
                }
                if let Some(predicate) = &filters.predicate {
                    if !predicate(query) {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    /// Invalidates every matching query; active ones refetch.
    pub fn invalidate_queries(&self, filters: &QueryFilters) {
        for query in self.matching(filters) {
            query.invalidate();
        }
    }

    /// The single window-focus hook: the host calls this when the window
    /// regains focus; every active stale query that opted in refetches.
    pub fn notify_focus(&self) {
        let refetched: Vec<Query> = self
            .matching(&QueryFilters {
                kind: FilterKind::Active,
                ..QueryFilters::default()
            })
            .into_iter()
            .filter(|q| q.options().refetch_on_window_focus && q.is_stale())
            .collect();
        if !refetched.is_empty() {
            tracing::debug!(count = refetched.len(), "window focus refetch");
        }
        for query in refetched {
            query.spawn_fetch();
        }
    }

    /// Gets or creates a mutation under a caller-supplied id.
    pub fn mutation(&self, id: &str, options: MutationOptions) -> Mutation {
        let mut mutations = self.inner.mutations.lock();
        if let Some(existing) = mutations.get(id) {
            return existing.clone();
        }
        let mutation = Mutation::new(id.to_owned(), options);
        mutations.insert(id.to_owned(), mutation.clone());
        mutation
    }

    pub fn remove_mutation(&self, id: &str) {
        self.inner.mutations.lock().remove(id);
    }
}
