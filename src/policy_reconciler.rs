//! Policy reconciler (spec.md §4.6). Watches `KubeTemplatePolicy` in the
//! operator's own namespace and keeps the admission-time policy cache
//! pushed forward, so lookups after a policy edit don't have to wait out
//! the full TTL.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::crd::KubeTemplatePolicy;
use crate::policy_cache::PolicyCache;

pub struct ReconcilerContext {
    pub policy_cache: Arc<PolicyCache>,
}

/// On create/update, push the fresh object straight into the cache keyed by
/// its declared `sourceNamespace` — this is strictly additive, so a policy
/// rename (which changes `sourceNamespace`) still needs the delete path
/// below to drop the cache entry under the old key. On delete, clear the
/// whole cache (spec.md §4.1: `Clear()` is called when the source namespace
/// is unavailable) rather than let a stale positive entry live out its TTL.
pub async fn reconcile(
    policy: Arc<KubeTemplatePolicy>,
    ctx: Arc<ReconcilerContext>,
) -> Result<Action, kube::Error> {
    if policy.metadata.deletion_timestamp.is_some() {
        info!(policy = %policy.name_any(), "policy_deleted_cache_cleared");
        handle_deletion(&policy, &ctx.policy_cache);
        return Ok(Action::await_change());
    }

    let source_namespace = policy.spec.source_namespace.clone();
    info!(
        policy = %policy.name_any(),
        source_namespace = %source_namespace,
        "policy_cache_refreshed"
    );
    ctx.policy_cache.set(&source_namespace, (*policy).clone());
    Ok(Action::requeue(Duration::from_secs(3600)))
}

pub fn error_policy(
    _policy: Arc<KubeTemplatePolicy>,
    error: &kube::Error,
    _ctx: Arc<ReconcilerContext>,
) -> Action {
    warn!(error = %error, "policy_reconcile_error");
    Action::requeue(Duration::from_secs(30))
}

/// Called from the controller's deletion event handling (spec.md §4.6): the
/// watch stream hands us the last-known object, but the cache is keyed by
/// `sourceNamespace`, which may have changed since the cached entry was
/// populated (e.g. the policy was edited just before being deleted). Rather
/// than risk leaving a stale positive entry under a key we can no longer
/// prove is wrong, a full clear is used — coarse, but always safe, and
/// deletions of `KubeTemplatePolicy` objects are rare.
pub fn handle_deletion(_deleted: &KubeTemplatePolicy, cache: &PolicyCache) {
    cache.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KubeTemplatePolicySpec;
    use crate::policy_cache::CacheLookup;
    use std::time::Duration as StdDuration;

    fn sample_policy(source_namespace: &str) -> KubeTemplatePolicy {
        KubeTemplatePolicy::new(
            "team-a-policy",
            KubeTemplatePolicySpec {
                source_namespace: source_namespace.to_string(),
                rules: Vec::new(),
            },
        )
    }

    struct PanicSource;

    #[async_trait::async_trait]
    impl crate::policy_cache::PolicySource for PanicSource {
        async fn lookup(
            &self,
            _source_namespace: &str,
        ) -> Result<Vec<KubeTemplatePolicy>, crate::error::OperatorError> {
            panic!("cache should already be populated by reconcile, not refreshed from source");
        }
    }

    #[tokio::test]
    async fn reconcile_populates_the_cache_for_its_source_namespace() {
        let cache = Arc::new(PolicyCache::new(StdDuration::from_secs(60)));
        let ctx = Arc::new(ReconcilerContext {
            policy_cache: cache.clone(),
        });
        let policy = Arc::new(sample_policy("team-a"));

        reconcile(policy, ctx).await.unwrap();

        let result = cache.get("team-a", &PanicSource).await.unwrap();
        assert!(matches!(result, CacheLookup::Found(_)));
    }

    #[test]
    fn deletion_clears_the_whole_cache() {
        let cache = PolicyCache::new(StdDuration::from_secs(60));
        cache.set("team-a", sample_policy("team-a"));
        assert!(!cache.is_empty());

        handle_deletion(&sample_policy("team-a"), &cache);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn reconcile_clears_the_cache_when_the_policy_is_being_deleted() {
        let cache = Arc::new(PolicyCache::new(StdDuration::from_secs(60)));
        cache.set("team-a", sample_policy("team-a"));
        assert!(!cache.is_empty());

        let ctx = Arc::new(ReconcilerContext {
            policy_cache: cache.clone(),
        });
        let mut policy = sample_policy("team-b");
        policy.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));

        reconcile(Arc::new(policy), ctx).await.unwrap();
        assert!(cache.is_empty());
    }
}
