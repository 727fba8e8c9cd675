//! Per-tenant RuleSet cache
//!
//! Readers get an `Arc<RuleSet>` snapshot; a refresh swaps the whole Arc, so
//! evaluation never observes a partially-updated rule list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;
use vigil_core::{RuleProvider, RuleSet};

struct CachedRules {
    rules: Arc<RuleSet>,
    loaded_at: Instant,
}

pub struct RuleSetCache {
    provider: Arc<dyn RuleProvider>,
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, CachedRules>>,
    refresh: Mutex<()>,
}

impl RuleSetCache {
    pub fn new(provider: Arc<dyn RuleProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            entries: RwLock::new(HashMap::new()),
            refresh: Mutex::new(()),
        }
    }

    fn fresh(&self, tenant_id: Uuid) -> Option<Arc<RuleSet>> {
        self.entries
            .read()
            .get(&tenant_id)
            .filter(|cached| cached.loaded_at.elapsed() < self.ttl)
            .map(|cached| cached.rules.clone())
    }

    /// Current rules for a tenant, reloading when the cached copy expired.
    /// Falls back to the last loaded set, then to the built-in defaults.
    pub async fn get(&self, tenant_id: Uuid) -> Arc<RuleSet> {
        if let Some(rules) = self.fresh(tenant_id) {
            return rules;
        }

        let _guard = self.refresh.lock().await;
        if let Some(rules) = self.fresh(tenant_id) {
            return rules;
        }

        match self.provider.active_rules(tenant_id).await {
            Ok(definitions) => {
                let rules = match RuleSet::from_definitions(&definitions) {
                    decoded if decoded.is_empty() => {
                        if !definitions.is_empty() {
                            warn!(
                                %tenant_id,
                                definitions = definitions.len(),
                                "No usable triage rules, using built-in rules"
                            );
                        }
                        RuleSet::builtin_default()
                    }
                    decoded => decoded,
                };
                debug!(%tenant_id, rules = %rules, "Loaded triage rules");
                let rules = Arc::new(rules);
                self.entries.write().insert(
                    tenant_id,
                    CachedRules {
                        rules: rules.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                rules
            }
            Err(e) => {
                let stale = self
                    .entries
                    .read()
                    .get(&tenant_id)
                    .map(|cached| cached.rules.clone());
                match stale {
                    Some(rules) => {
                        warn!(%tenant_id, error = %e, "Rule provider failed, keeping previous rules");
                        rules
                    }
                    None => {
                        warn!(%tenant_id, error = %e, "Rule provider failed, using built-in rules");
                        Arc::new(RuleSet::builtin_default())
                    }
                }
            }
        }
    }

    /// Drop a tenant's cached rules so the next read reloads them
    pub fn invalidate(&self, tenant_id: Uuid) {
        self.entries.write().remove(&tenant_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_core::{RuleDefinition, RuleKind, StaticRuleProvider};

    fn max_age(limit: u32) -> RuleDefinition {
        RuleDefinition {
            id: Uuid::now_v7(),
            name: format!("max age {limit}"),
            priority: 1,
            active: true,
            config: json!({"type": "max-age", "value": limit, "action": "reject"}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_caches_until_ttl() {
        let provider = Arc::new(StaticRuleProvider::new());
        let tenant = Uuid::now_v7();
        provider.set_rules(tenant, vec![max_age(75)]);
        let cache = RuleSetCache::new(provider.clone(), Duration::from_secs(300));

        let first = cache.get(tenant).await;
        assert_eq!(first.rules()[0].kind, RuleKind::MaxAge(75));

        provider.set_rules(tenant, vec![max_age(60)]);
        let cached = cache.get(tenant).await;
        assert!(Arc::ptr_eq(&first, &cached));
        assert_eq!(provider.calls(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        let reloaded = cache.get(tenant).await;
        assert_eq!(reloaded.rules()[0].kind, RuleKind::MaxAge(60));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let provider = Arc::new(StaticRuleProvider::new());
        let tenant = Uuid::now_v7();
        provider.set_rules(tenant, vec![max_age(75)]);
        let cache = RuleSetCache::new(provider.clone(), Duration::from_secs(300));

        cache.get(tenant).await;
        cache.invalidate(tenant);
        cache.get(tenant).await;
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_tenant_uses_builtin() {
        let provider = Arc::new(StaticRuleProvider::new());
        let cache = RuleSetCache::new(provider, Duration::from_secs(300));
        let rules = cache.get(Uuid::now_v7()).await;
        let kinds: Vec<_> = rules.rules().iter().map(|r| r.kind.clone()).collect();
        let expected: Vec<_> = RuleSet::builtin_default()
            .rules()
            .iter()
            .map(|r| r.kind.clone())
            .collect();
        assert_eq!(kinds, expected);
    }

    #[tokio::test]
    async fn test_unusable_rules_fall_back_to_builtin() {
        let provider = Arc::new(StaticRuleProvider::new());
        let tenant = Uuid::now_v7();
        let mut inactive = max_age(60);
        inactive.active = false;
        let mut garbled = max_age(60);
        garbled.config = json!({"type": "max-age", "value": "sixty"});
        provider.set_rules(tenant, vec![inactive, garbled]);
        let cache = RuleSetCache::new(provider, Duration::from_secs(300));

        let rules = cache.get(tenant).await;
        assert!(!rules.is_empty());
        assert_eq!(rules.len(), RuleSet::builtin_default().len());
        assert_eq!(rules.rules()[0].kind, RuleKind::MaxAge(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_keeps_previous() {
        let provider = Arc::new(StaticRuleProvider::new());
        let tenant = Uuid::now_v7();
        provider.set_rules(tenant, vec![max_age(70)]);
        let cache = RuleSetCache::new(provider.clone(), Duration::from_secs(1));

        cache.get(tenant).await;
        provider.set_unavailable(true);
        tokio::time::advance(Duration::from_secs(2)).await;
        let rules = cache.get(tenant).await;
        assert_eq!(rules.rules()[0].kind, RuleKind::MaxAge(70));

        let other = cache.get(Uuid::now_v7()).await;
        assert_eq!(other.len(), RuleSet::builtin_default().len());
    }
}
