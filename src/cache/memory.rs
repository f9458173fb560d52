//! In-memory artifact cache
//!
//! The default cache for a single process: a mutex-guarded slot map from
//! fingerprint to either a ready entry or an in-flight execution. All
//! mutation is linearized per fingerprint through the slot map; lookups of
//! distinct fingerprints only contend on the map lock itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::artifact::CacheEntry;
use crate::cache::{select_doomed, ArtifactCache, Claim, EvictionPolicy, FlightOutcome};
use crate::error::StagecraftResult;
use crate::fingerprint::Fingerprint;

enum Slot {
    Ready(Arc<CacheEntry>),
    Building(watch::Sender<Option<FlightOutcome>>),
}

#[derive(Default)]
struct Inner {
    slots: HashMap<Fingerprint, Slot>,
    pins: HashMap<Fingerprint, usize>,
}

impl Inner {
    fn pinned(&self, fp: &Fingerprint) -> bool {
        self.pins.get(fp).is_some_and(|&n| n > 0)
    }
}

/// Mutex-guarded in-memory cache with single-flight claims
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ready entries (in-flight slots excluded)
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ArtifactCache for MemoryCache {
    async fn lookup(&self, fingerprint: Fingerprint) -> Option<Arc<CacheEntry>> {
        let inner = self.inner.lock().await;
        match inner.slots.get(&fingerprint) {
            Some(Slot::Ready(entry)) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    async fn claim(&self, fingerprint: Fingerprint) -> Claim {
        let mut inner = self.inner.lock().await;
        match inner.slots.get(&fingerprint) {
            Some(Slot::Ready(entry)) => Claim::Hit(Arc::clone(entry)),
            Some(Slot::Building(tx)) => Claim::Wait(tx.subscribe()),
            None => {
                let (tx, _rx) = watch::channel(None);
                inner.slots.insert(fingerprint, Slot::Building(tx));
                debug!(fingerprint = %fingerprint.short(), "cache miss, claimed for execution");
                Claim::Execute
            }
        }
    }

    async fn store(&self, entry: CacheEntry) -> StagecraftResult<Arc<CacheEntry>> {
        let entry = Arc::new(entry);
        let mut inner = self.inner.lock().await;
        let previous = inner
            .slots
            .insert(entry.fingerprint, Slot::Ready(Arc::clone(&entry)));
        if let Some(Slot::Building(tx)) = previous {
            let _ = tx.send(Some(FlightOutcome::Stored(Arc::clone(&entry))));
        }
        debug!(
            fingerprint = %entry.fingerprint.short(),
            files = entry.delta.len(),
            size = entry.size_bytes(),
            "cache entry stored"
        );
        Ok(entry)
    }

    async fn release(&self, fingerprint: Fingerprint, outcome: FlightOutcome) {
        let mut inner = self.inner.lock().await;
        if let Some(Slot::Building(tx)) = inner.slots.remove(&fingerprint) {
            let _ = tx.send(Some(outcome));
        }
    }

    async fn pin(&self, fingerprint: Fingerprint) {
        let mut inner = self.inner.lock().await;
        *inner.pins.entry(fingerprint).or_insert(0) += 1;
    }

    async fn unpin(&self, fingerprints: &[Fingerprint]) {
        let mut inner = self.inner.lock().await;
        for fp in fingerprints {
            if let Some(count) = inner.pins.get_mut(fp) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.pins.remove(fp);
                }
            }
        }
    }

    async fn evict(&self, policy: &EvictionPolicy) -> usize {
        let mut inner = self.inner.lock().await;

        let candidates: Vec<(Fingerprint, DateTime<Utc>)> = inner
            .slots
            .iter()
            .filter_map(|(fp, slot)| match slot {
                Slot::Ready(entry) if !inner.pinned(fp) => Some((*fp, entry.created_at)),
                _ => None,
            })
            .collect();
        let ready_total = inner
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count();

        let doomed = select_doomed(candidates, ready_total, policy);
        for fp in &doomed {
            inner.slots.remove(fp);
        }
        if !doomed.is_empty() {
            debug!(evicted = doomed.len(), "cache eviction pass");
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactSet;

    fn entry(seed: &str) -> CacheEntry {
        CacheEntry::new(
            Fingerprint::of_content(seed.as_bytes()),
            ArtifactSet::from_files([("out.txt", seed)]),
            vec!["out.txt".into()],
        )
    }

    #[tokio::test]
    async fn lookup_miss_then_hit() {
        let cache = MemoryCache::new();
        let e = entry("a");
        let fp = e.fingerprint;

        assert!(cache.lookup(fp).await.is_none());
        cache.store(e).await.unwrap();
        let hit = cache.lookup(fp).await.unwrap();
        assert_eq!(hit.fingerprint, fp);
    }

    #[tokio::test]
    async fn claim_is_single_flight() {
        let cache = MemoryCache::new();
        let fp = Fingerprint::of_content(b"shared");

        let first = cache.claim(fp).await;
        assert!(matches!(first, Claim::Execute));

        // Every later claimant joins the flight instead of executing
        let second = cache.claim(fp).await;
        let mut rx = match second {
            Claim::Wait(rx) => rx,
            _ => panic!("expected Wait"),
        };

        let mut e = entry("x");
        e.fingerprint = fp;
        cache.store(e).await.unwrap();

        let outcome = rx.wait_for(|o| o.is_some()).await.unwrap().clone();
        match outcome {
            Some(FlightOutcome::Stored(stored)) => assert_eq!(stored.fingerprint, fp),
            other => panic!("expected Stored, got {other:?}"),
        }

        assert!(matches!(cache.claim(fp).await, Claim::Hit(_)));
    }

    #[tokio::test]
    async fn release_frees_slot_and_wakes_waiters() {
        let cache = MemoryCache::new();
        let fp = Fingerprint::of_content(b"doomed");

        assert!(matches!(cache.claim(fp).await, Claim::Execute));
        let mut rx = match cache.claim(fp).await {
            Claim::Wait(rx) => rx,
            _ => panic!("expected Wait"),
        };

        cache.release(fp, FlightOutcome::Failed).await;
        let outcome = rx.wait_for(|o| o.is_some()).await.unwrap().clone();
        assert!(matches!(outcome, Some(FlightOutcome::Failed)));

        // Slot is free again; a retry may claim execution
        assert!(matches!(cache.claim(fp).await, Claim::Execute));
    }

    #[tokio::test]
    async fn release_with_entry_feeds_waiters_without_caching() {
        let cache = MemoryCache::new();
        let e = Arc::new(entry("uncachable"));
        let fp = e.fingerprint;

        assert!(matches!(cache.claim(fp).await, Claim::Execute));
        let mut rx = match cache.claim(fp).await {
            Claim::Wait(rx) => rx,
            _ => panic!("expected Wait"),
        };

        // The store-failed path: waiters get the result, the cache keeps nothing
        cache
            .release(fp, FlightOutcome::Stored(Arc::clone(&e)))
            .await;
        let outcome = rx.wait_for(|o| o.is_some()).await.unwrap().clone();
        match outcome {
            Some(FlightOutcome::Stored(shared)) => assert_eq!(shared.fingerprint, fp),
            other => panic!("expected Stored, got {other:?}"),
        }
        assert!(cache.lookup(fp).await.is_none());
    }

    #[tokio::test]
    async fn many_concurrent_claims_one_executor() {
        let cache = Arc::new(MemoryCache::new());
        let fp = Fingerprint::of_content(b"contended");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                matches!(cache.claim(fp).await, Claim::Execute)
            }));
        }

        let mut executors = 0;
        for handle in handles {
            if handle.await.unwrap() {
                executors += 1;
            }
        }
        assert_eq!(executors, 1);
    }

    #[tokio::test]
    async fn evict_respects_pins_and_bounds() {
        let cache = MemoryCache::new();
        let a = entry("a");
        let b = entry("b");
        let pinned_fp = a.fingerprint;

        cache.store(a).await.unwrap();
        cache.store(b).await.unwrap();
        cache.pin(pinned_fp).await;

        let removed = cache
            .evict(&EvictionPolicy {
                max_entries: Some(0),
                max_age_secs: None,
            })
            .await;
        assert_eq!(removed, 1);
        assert!(cache.lookup(pinned_fp).await.is_some());

        cache.unpin(&[pinned_fp]).await;
        let removed = cache
            .evict(&EvictionPolicy {
                max_entries: Some(0),
                max_age_secs: None,
            })
            .await;
        assert_eq!(removed, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn age_and_count_bounds_combine_without_double_counting() {
        let cache = MemoryCache::new();
        let mut old = entry("old");
        old.created_at = Utc::now() - chrono::Duration::seconds(3600);
        cache.store(old).await.unwrap();
        cache.store(entry("new")).await.unwrap();

        // "old" falls to the age bound, "new" to the count bound; each
        // counted once
        let removed = cache
            .evict(&EvictionPolicy {
                max_entries: Some(0),
                max_age_secs: Some(60),
            })
            .await;
        assert_eq!(removed, 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn unbounded_policy_never_evicts() {
        let cache = MemoryCache::new();
        cache.store(entry("a")).await.unwrap();
        assert_eq!(cache.evict(&EvictionPolicy::unbounded()).await, 0);
        assert_eq!(cache.len().await, 1);
    }
}
