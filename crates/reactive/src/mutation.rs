//! Mutation entities: keyed by a caller-supplied id, never auto-run, not
//! cancellable once started. Lifecycle callbacks run in order, awaited:
//! on_mutate, the mutation itself, on_success/on_error, on_settled.

use std::{
    collections::HashMap,
    sync::Arc,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::retry::{
    Retry,
    RetryDelay,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

#[derive(Clone, Debug)]
pub struct MutationState {
    pub status: MutationStatus,
    pub data: Option<JsonValue>,
    pub error: Option<Arc<anyhow::Error>>,
    pub failure_count: u32,
    pub variables: Option<JsonValue>,
}

impl MutationState {
    fn initial() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            failure_count: 0,
            variables: None,
        }
    }
}

pub type MutateFn =
    Arc<dyn Fn(JsonValue) -> BoxFuture<'static, anyhow::Result<JsonValue>> + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct MutationOptions {
    pub mutate_fn: MutateFn,
    pub on_mutate: Option<LifecycleHook>,
    pub on_success: Option<LifecycleHook>,
    pub on_error: Option<LifecycleHook>,
    pub on_settled: Option<LifecycleHook>,
    /// Mutations do not retry unless asked to.
    pub retry: Retry,
    pub retry_delay: RetryDelay,
}

impl MutationOptions {
    pub fn new(
        mutate_fn: impl Fn(JsonValue) -> BoxFuture<'static, anyhow::Result<JsonValue>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            mutate_fn: Arc::new(mutate_fn),
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            retry: Retry::Never,
            retry_delay: RetryDelay::Default,
        }
    }
}

type ObserverCallback = Arc<dyn Fn(&MutationState) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    callbacks: HashMap<u64, ObserverCallback>,
}

struct MutationShared {
    id: String,
    options: MutationOptions,
    state: Mutex<MutationState>,
    observers: Mutex<Observers>,
}

#[derive(Clone)]
pub struct Mutation {
    inner: Arc<MutationShared>,
}

impl Mutation {
    pub(crate) fn new(id: String, options: MutationOptions) -> Self {
        Self {
            inner: Arc::new(MutationShared {
                id,
                options,
                state: Mutex::new(MutationState::initial()),
                observers: Mutex::new(Observers::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> MutationState {
        self.inner.state.lock().clone()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&MutationState) + Send + Sync + 'static,
    ) -> MutationObserver {
        let mut observers = self.inner.observers.lock();
        let id = observers.next_id;
        observers.next_id += 1;
        observers.callbacks.insert(id, Arc::new(callback));
        MutationObserver {
            mutation: self.clone(),
            id,
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

    /// Runs the mutation once with its retry policy. Observers hear every
    /// transition; the error and failure count stay on the state until
    /// [`Mutation::reset`].
    pub async fn mutate(&self, variables: JsonValue) -> Result<JsonValue, Arc<anyhow::Error>> {
        let options = self.inner.options.clone();
        if let Some(on_mutate) = &options.on_mutate {
            on_mutate(variables.clone()).await;
        }
        {
            let mut state = self.inner.state.lock();
            state.status = MutationStatus::Pending;
            state.variables = Some(variables.clone());
            state.error = None;
        }
        self.notify();

        let result = loop {
            match (options.mutate_fn)(variables.clone()).await {
                Ok(data) => break Ok(data),
                Err(error) => {
                    let failure_count = {
                        let mut state = self.inner.state.lock();
                        state.failure_count += 1;
                        state.failure_count
                    };
                    self.notify();
                    if options.retry.should_retry(failure_count, &error) {
                        let delay = options.retry_delay.delay(failure_count, &error);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break Err(Arc::new(error));
                },
            }
        };

        match &result {
            Ok(data) => {
                {
                    let mut state = self.inner.state.lock();
                    state.status = MutationStatus::Success;
                    state.data = Some(data.clone());
                    state.failure_count = 0;
                }
                self.notify();
                if let Some(on_success) = &options.on_success {
                    on_success(data.clone()).await;
                }
            },
            Err(error) => {
                {
                    let mut state = self.inner.state.lock();
                    state.status = MutationStatus::Error;
                    state.error = Some(error.clone());
                }
                self.notify();
                if let Some(on_error) = &options.on_error {
                    on_error(JsonValue::String(format!("{error:#}"))).await;
                }
            },
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(JsonValue::Null).await;
        }
        result
    }

    /// Clears all mutation state back to idle.
    pub fn reset(&self) {
        *self.inner.state.lock() = MutationState::initial();
        self.notify();
    }
}

pub struct MutationObserver {
    mutation: Mutation,
    id: u64,
}

impl Drop for MutationObserver {
    fn drop(&mut self) {
        self.mutation
            .inner
            .observers
            .lock()
            .callbacks
            .remove(&self.id);
    }
}
