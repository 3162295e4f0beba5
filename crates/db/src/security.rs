//! Per-table rule evaluation over analyzed query context. Rules never mutate
//! queries; they only admit or reject the operation carrying the analysis.

use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use sql::QueryAnalysis;

use crate::error::DbError;

/// The current user as supplied by the host. Attributes are opaque to the
/// engine; rules interpret them.
#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub id: String,
    pub attributes: JsonValue,
}

impl User {
    pub fn anonymous() -> Self {
        Self {
            id: String::new(),
            attributes: JsonValue::Null,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_empty()
    }
}

#[async_trait]
pub trait SecurityRule: Send + Sync {
    async fn allow(&self, analysis: &QueryAnalysis, user: &User) -> anyhow::Result<bool>;
}

struct FnRule<F>(F);

#[async_trait]
impl<F> SecurityRule for FnRule<F>
where
    F: Fn(&QueryAnalysis, &User) -> bool + Send + Sync,
{
    async fn allow(&self, analysis: &QueryAnalysis, user: &User) -> anyhow::Result<bool> {
        Ok((self.0)(analysis, user))
    }
}

/// Wraps a synchronous predicate as a rule.
pub fn rule_fn(
    f: impl Fn(&QueryAnalysis, &User) -> bool + Send + Sync + 'static,
) -> Arc<dyn SecurityRule> {
    Arc::new(FnRule(f))
}

pub type UserProvider = Arc<dyn Fn() -> User + Send + Sync>;

/// Holds the ordered rule lists, keyed by table name. Every rule of every
/// accessed table must return true; any false or error short-circuits with
/// [`DbError::AuthorizationDenied`].
#[derive(Default)]
pub struct SecurityEngine {
    rules: RwLock<HashMap<String, Vec<Arc<dyn SecurityRule>>>>,
    user_provider: RwLock<Option<UserProvider>>,
}

impl SecurityEngine {
    pub fn add_rule(&self, table: &str, rule: Arc<dyn SecurityRule>) {
        self.rules
            .write()
            .entry(table.to_owned())
            .or_default()
            .push(rule);
    }

    pub fn set_user_provider(&self, provider: UserProvider) {
        *self.user_provider.write() = Some(provider);
    }

    pub fn current_user(&self) -> User {
        match self.user_provider.read().as_ref() {
            Some(provider) => provider(),
            None => User::anonymous(),
        }
    }

    pub async fn check(&self, analysis: &QueryAnalysis) -> anyhow::Result<()> {
        // Collect up front so no lock is held across rule awaits.
        let to_check: Vec<(String, Vec<Arc<dyn SecurityRule>>)> = {
            let rules = self.rules.read();
            analysis
                .table_names()
                .filter_map(|name| rules.get(name).map(|r| (name.to_owned(), r.clone())))
                .collect()
        };
        if to_check.is_empty() {
            return Ok(());
        }
        let user = self.current_user();
        for (table, rules) in to_check {
            for rule in rules {
                let allowed = rule.allow(analysis, &user).await.unwrap_or(false);
                if !allowed {
                    return Err(DbError::AuthorizationDenied(format!(
                        "a rule on table {table} rejected the operation"
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sql::{
        analyze,
        RawSql,
    };

    use super::*;

    fn analysis(text: &str) -> QueryAnalysis {
        analyze(&RawSql::new(text)).unwrap()
    }

    #[tokio::test]
    async fn no_rules_means_allowed() {
        let engine = SecurityEngine::default();
        engine.check(&analysis("SELECT * FROM t")).await.unwrap();
    }

    #[tokio::test]
    async fn all_rules_must_pass() {
        let engine = SecurityEngine::default();
        engine.add_rule("t", rule_fn(|_, _| true));
        engine.add_rule("t", rule_fn(|_, _| false));
        let err = engine.check(&analysis("SELECT * FROM t")).await.unwrap_err();
        assert!(err.downcast_ref::<DbError>().is_some());
    }

    #[tokio::test]
    async fn rules_only_gate_their_own_table() {
        let engine = SecurityEngine::default();
        engine.add_rule("secret", rule_fn(|_, _| false));
        engine.check(&analysis("SELECT * FROM open")).await.unwrap();
        assert!(engine
            .check(&analysis("SELECT * FROM open JOIN secret ON secret.id = open.s_id"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rules_see_the_user() {
        let engine = SecurityEngine::default();
        engine.set_user_provider(Arc::new(|| User {
            id: "u1".into(),
            attributes: JsonValue::Null,
        }));
        engine.add_rule("t", rule_fn(|_, user| user.id == "u1"));
        engine.check(&analysis("DELETE FROM t")).await.unwrap();
    }

    #[tokio::test]
    async fn write_analysis_carries_filters_for_rules() {
        let engine = SecurityEngine::default();
        engine.add_rule(
            "docs",
            rule_fn(|analysis, _| {
                // Only row-targeted deletes allowed.
                analysis
                    .table("docs")
                    .map(|t| t.filters.iter().any(|f| f.column == "id"))
                    .unwrap_or(false)
            }),
        );
        engine
            .check(&analysis("DELETE FROM docs WHERE id = 'a'"))
            .await
            .unwrap();
        assert!(engine.check(&analysis("DELETE FROM docs")).await.is_err());
    }
}
