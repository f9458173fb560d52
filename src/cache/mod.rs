//! Artifact cache
//!
//! Maps stage fingerprints to materialized results. Entries are immutable
//! once stored and only ever superseded under a new fingerprint. The cache
//! is the only shared mutable structure in a build, handed explicitly to
//! the scheduler (never ambient state), so tests can substitute their own.
//!
//! # Single-flight
//!
//! Concurrent requesters for the same uncached fingerprint must not both
//! execute: [`ArtifactCache::claim`] hands exactly one caller
//! [`Claim::Execute`]; everyone else gets [`Claim::Wait`] and joins the
//! in-flight execution's outcome.
//!
//! # Pinning
//!
//! Entries a build depends on are pinned for its duration; `evict` never
//! removes a pinned entry, so an in-flight composition cannot lose its
//! inputs.

pub mod disk;
pub mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::artifact::CacheEntry;
use crate::error::StagecraftResult;
use crate::fingerprint::Fingerprint;

/// Terminal outcome of an in-flight execution, delivered to waiters
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    /// The producer finished; waiters share this entry. Sent on a normal
    /// store, and also when storage failed but the producer still holds the
    /// result in memory (storage failure is a miss, never a stage failure).
    Stored(Arc<CacheEntry>),

    /// The producer failed; waiters must treat the stage as failed, not
    /// re-execute
    Failed,

    /// The producer was cancelled; waiters abort rather than fail
    Cancelled,
}

/// Receiver side of an in-flight execution. `None` until the producer
/// finishes.
pub type FlightWaiter = watch::Receiver<Option<FlightOutcome>>;

/// Result of claiming a fingerprint for execution
pub enum Claim {
    /// Entry already materialized
    Hit(Arc<CacheEntry>),

    /// Caller owns the execution; it must end with `store` or `release`
    Execute,

    /// Another caller is executing this fingerprint; await the outcome
    Wait(FlightWaiter),
}

/// Caller-configurable eviction bounds
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Keep at most this many entries (oldest evicted first)
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Evict entries older than this many seconds
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

impl EvictionPolicy {
    /// Policy that never evicts
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// The artifact cache contract used by the scheduler
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Look up a materialized entry
    async fn lookup(&self, fingerprint: Fingerprint) -> Option<Arc<CacheEntry>>;

    /// Claim a fingerprint: hit, own the execution, or join the in-flight one
    async fn claim(&self, fingerprint: Fingerprint) -> Claim;

    /// Store a produced entry and wake any waiters. On failure the claim
    /// stays open; the producer must conclude it with [`Self::release`],
    /// passing the entry so waiters still receive the result.
    async fn store(&self, entry: CacheEntry) -> StagecraftResult<Arc<CacheEntry>>;

    /// Conclude an `Execute` claim without a successful store: the slot is
    /// freed and any waiters receive `outcome`
    async fn release(&self, fingerprint: Fingerprint, outcome: FlightOutcome);

    /// Pin an entry (or future entry) against eviction
    async fn pin(&self, fingerprint: Fingerprint);

    /// Drop one pin for each given fingerprint
    async fn unpin(&self, fingerprints: &[Fingerprint]);

    /// Apply an eviction policy; returns the number of entries removed
    async fn evict(&self, policy: &EvictionPolicy) -> usize;
}

/// Pick the entries an eviction pass removes: age bound first, then the
/// oldest of the rest until the count bound holds. `candidates` are the
/// evictable (ready, unpinned) entries; `ready_total` counts every stored
/// entry, pinned included.
pub(crate) fn select_doomed(
    mut candidates: Vec<(Fingerprint, DateTime<Utc>)>,
    ready_total: usize,
    policy: &EvictionPolicy,
) -> Vec<Fingerprint> {
    candidates.sort_by_key(|&(_, at)| at);
    let mut doomed: Vec<Fingerprint> = Vec::new();

    if let Some(max_age) = policy.max_age_secs {
        let cutoff = Utc::now() - Duration::seconds(max_age as i64);
        doomed.extend(
            candidates
                .iter()
                .filter(|&&(_, at)| at < cutoff)
                .map(|&(fp, _)| fp),
        );
    }

    if let Some(max_entries) = policy.max_entries {
        let surviving = ready_total - doomed.len();
        if surviving > max_entries {
            let overflow: Vec<Fingerprint> = candidates
                .iter()
                .filter(|(fp, _)| !doomed.contains(fp))
                .take(surviving - max_entries)
                .map(|&(fp, _)| fp)
                .collect();
            doomed.extend(overflow);
        }
    }
    doomed
}
