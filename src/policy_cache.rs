//! TTL-bounded policy cache (spec.md §4.1).
//!
//! Constant-time lookup of the `KubeTemplatePolicy` governing a source
//! namespace, with eventual consistency bounded by a TTL. Reads are served
//! from an `RwLock` so many concurrent admission requests never block behind
//! each other; only the occasional watch-driven write takes the write half.
//!
//! Negative results (`NotFound`) are cached under the same TTL as positive
//! ones — spec.md §9 calls this out explicitly: skipping it lets a storm of
//! requests against a namespace with no policy hammer the API server on
//! every admission.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::crd::KubeTemplatePolicy;
use crate::error::OperatorError;

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Found(KubeTemplatePolicy),
    NotFound,
    /// More than one policy claims the same `sourceNamespace`.
    Ambiguous,
}

#[derive(Clone)]
enum CacheEntry {
    Positive(KubeTemplatePolicy),
    Negative,
    Ambiguous,
}

struct TimedEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// The default TTL (spec.md §4.1: default 60s, hard floor 30s).
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const MIN_TTL: Duration = Duration::from_secs(30);

/// A trait for whatever can refresh a cache miss from the Kubernetes API.
/// Kept separate from the cache itself so unit tests can drive the cache
/// with a fake source instead of a live cluster.
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync {
    async fn lookup(&self, source_namespace: &str) -> Result<Vec<KubeTemplatePolicy>, OperatorError>;
}

pub struct PolicyCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, TimedEntry>>,
}

impl PolicyCache {
    pub fn new(ttl: Duration) -> Self {
        let ttl = ttl.max(MIN_TTL);
        PolicyCache {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `Get(sourceNamespace)`: serve a fresh cached entry, or refresh from
    /// `source` and populate both positive and negative results.
    pub async fn get(
        &self,
        source_namespace: &str,
        source: &dyn PolicySource,
    ) -> Result<CacheLookup, OperatorError> {
        if let Some(hit) = self.read_if_fresh(source_namespace) {
            return Ok(hit);
        }

        let policies = source.lookup(source_namespace).await?;
        let (entry, lookup) = match policies.len() {
            0 => (CacheEntry::Negative, CacheLookup::NotFound),
            1 => {
                let policy = policies.into_iter().next().unwrap();
                (CacheEntry::Positive(policy.clone()), CacheLookup::Found(policy))
            }
            _ => (CacheEntry::Ambiguous, CacheLookup::Ambiguous),
        };

        let mut guard = self.entries.write().expect("policy cache lock poisoned");
        guard.insert(
            source_namespace.to_string(),
            TimedEntry {
                entry,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(lookup)
    }

    fn read_if_fresh(&self, source_namespace: &str) -> Option<CacheLookup> {
        let guard = self.entries.read().expect("policy cache lock poisoned");
        let timed = guard.get(source_namespace)?;
        if timed.expires_at <= Instant::now() {
            return None;
        }
        Some(match &timed.entry {
            CacheEntry::Positive(p) => CacheLookup::Found(p.clone()),
            CacheEntry::Negative => CacheLookup::NotFound,
            CacheEntry::Ambiguous => CacheLookup::Ambiguous,
        })
    }

    /// Called by the policy reconciler on every create/update watch event.
    pub fn set(&self, source_namespace: &str, policy: KubeTemplatePolicy) {
        let mut guard = self.entries.write().expect("policy cache lock poisoned");
        guard.insert(
            source_namespace.to_string(),
            TimedEntry {
                entry: CacheEntry::Positive(policy),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Called by the policy reconciler when a policy it can still identify
    /// the source namespace for is deleted.
    pub fn invalidate(&self, source_namespace: &str) {
        let mut guard = self.entries.write().expect("policy cache lock poisoned");
        guard.remove(source_namespace);
    }

    /// Called on delete when the prior `sourceNamespace` is unknown — coarse
    /// but safe per spec.md §4.6.
    pub fn clear(&self) {
        let mut guard = self.entries.write().expect("policy cache lock poisoned");
        guard.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("policy cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(source_namespace: &str) -> KubeTemplatePolicy {
        KubeTemplatePolicy::new(
            "p",
            crate::crd::KubeTemplatePolicySpec {
                source_namespace: source_namespace.to_string(),
                rules: Vec::new(),
            },
        )
    }

    struct CountingSource {
        calls: AtomicUsize,
        responses: Vec<KubeTemplatePolicy>,
    }

    #[async_trait::async_trait]
    impl PolicySource for CountingSource {
        async fn lookup(&self, _ns: &str) -> Result<Vec<KubeTemplatePolicy>, OperatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses.clone())
        }
    }

    #[tokio::test]
    async fn caches_positive_result() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            responses: vec![policy("team-a")],
        };

        for _ in 0..5 {
            let result = cache.get("team-a", &source).await.unwrap();
            assert!(matches!(result, CacheLookup::Found(_)));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caches_negative_result() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            responses: vec![],
        };

        for _ in 0..5 {
            let result = cache.get("team-a", &source).await.unwrap();
            assert!(matches!(result, CacheLookup::NotFound));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ambiguous_when_multiple_policies_match() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            responses: vec![policy("team-a"), policy("team-a")],
        };

        let result = cache.get("team-a", &source).await.unwrap();
        assert!(matches!(result, CacheLookup::Ambiguous));
    }

    #[tokio::test]
    async fn ttl_expiry_triggers_refresh() {
        let cache = PolicyCache::new(Duration::from_millis(10));
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            responses: vec![policy("team-a")],
        });

        cache.get("team-a", source.as_ref()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get("team-a", source.as_ref()).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_populates_cache_without_a_source_call() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            responses: vec![],
        };

        cache.set("team-a", policy("team-a"));
        let result = cache.get("team-a", &source).await.unwrap();
        assert!(matches!(result, CacheLookup::Found(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        cache.set("team-a", policy("team-a"));
        cache.invalidate("team-a");

        let source = CountingSource {
            calls: AtomicUsize::new(0),
            responses: vec![],
        };
        let result = cache.get("team-a", &source).await.unwrap();
        assert!(matches!(result, CacheLookup::NotFound));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_drops_all_entries() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        cache.set("a", policy("a"));
        cache.set("b", policy("b"));
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn new_enforces_ttl_floor() {
        let cache = PolicyCache::new(Duration::from_secs(1));
        assert_eq!(cache.ttl, MIN_TTL);
    }
}
