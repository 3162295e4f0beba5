//! Table-level invalidation fan-out: each subscription holds the set of
//! tables its query reads, and an invalidation of any of them fires the
//! callback exactly once.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Weak,
    },
};

use parking_lot::Mutex;
use sql::QueryAnalysis;

/// Carries which table changed; `changed_ids` is best-effort and may be
/// empty. Future versions may narrow the fan-out with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub table: String,
    pub changed_ids: Vec<String>,
}

pub type LiveCallback = Arc<dyn Fn(&InvalidationEvent) + Send + Sync>;

struct SubscriptionEntry {
    affected_tables: HashSet<String>,
    callback: LiveCallback,
}

#[derive(Default)]
struct LiveInner {
    next_id: u64,
    subscriptions: HashMap<u64, SubscriptionEntry>,
}

#[derive(Clone, Default)]
pub struct LiveQueryManager {
    inner: Arc<Mutex<LiveInner>>,
}

impl LiveQueryManager {
    /// Subscribes a callback to every table the analyzed query touches:
    /// WHERE, select lists, joins, CTEs and subqueries all contribute, and
    /// for writes the target table plus FROM/USING sources.
    pub fn subscribe(
        &self,
        analysis: &QueryAnalysis,
        callback: impl Fn(&InvalidationEvent) + Send + Sync + 'static,
    ) -> LiveSubscription {
        let affected_tables: HashSet<String> =
            analysis.table_names().map(str::to_owned).collect();
        self.subscribe_tables(affected_tables, callback)
    }

    pub fn subscribe_tables(
        &self,
        affected_tables: HashSet<String>,
        callback: impl Fn(&InvalidationEvent) + Send + Sync + 'static,
    ) -> LiveSubscription {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscriptions.insert(
            id,
            SubscriptionEntry {
                affected_tables,
                callback: Arc::new(callback),
            },
        );
        LiveSubscription {
            id,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Fires callbacks of every subscription whose affected set contains
    /// `table`, after the causing write has committed.
    pub fn invalidate(&self, table: &str, changed_ids: &[String]) {
        let event = InvalidationEvent {
            table: table.to_owned(),
            changed_ids: changed_ids.to_vec(),
        };
        // Snapshot callbacks so one of them may unsubscribe without
        // deadlocking on the registry lock.
        let callbacks: Vec<LiveCallback> = {
            let inner = self.inner.lock();
            inner
                .subscriptions
                .values()
                .filter(|s| s.affected_tables.contains(table))
                .map(|s| s.callback.clone())
                .collect()
        };
        if !callbacks.is_empty() {
            tracing::debug!(table, subscribers = callbacks.len(), "table invalidation");
        }
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }
}

/// Unsubscribes on drop.
pub struct LiveSubscription {
    id: u64,
    manager: Weak<Mutex<LiveInner>>,
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.lock().subscriptions.remove(&self.id);
        }
    }
}
