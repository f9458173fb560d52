//! Disk-backed artifact cache
//!
//! Content-addressed on-disk layout: one directory per fingerprint under
//! the cache root, holding `meta.json` (declared outputs, creation time)
//! and the stage's delta files under `files/`. Entries survive across
//! invocations, which is what turns deterministic fingerprints into a warm
//! cache for the next build. Single-flight claims and pins are
//! process-local; the disk only ever holds completed entries, staged into
//! place with a rename so readers never observe a half-written one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::artifact::{normalize_path, ArtifactSet, CacheEntry};
use crate::cache::{select_doomed, ArtifactCache, Claim, EvictionPolicy, FlightOutcome};
use crate::error::{StagecraftError, StagecraftResult};
use crate::fingerprint::Fingerprint;

/// Default cache root under the user cache directory
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stagecraft")
}

/// Sidecar metadata persisted next to an entry's files
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    outputs: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Flights {
    building: HashMap<Fingerprint, watch::Sender<Option<FlightOutcome>>>,
    pins: HashMap<Fingerprint, usize>,
}

impl Flights {
    fn pinned(&self, fp: &Fingerprint) -> bool {
        self.pins.get(fp).is_some_and(|&n| n > 0)
    }
}

/// Cross-invocation cache persisting entries under a root directory
pub struct DiskCache {
    root: PathBuf,
    flights: Mutex<Flights>,
}

impl DiskCache {
    /// Cache rooted under the user cache directory
    pub fn new() -> Self {
        Self::with_root(default_cache_dir())
    }

    /// Cache rooted at an explicit directory
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            flights: Mutex::default(),
        }
    }

    fn entry_dir(&self, fingerprint: Fingerprint) -> PathBuf {
        self.root.join(fingerprint.to_string())
    }

    /// Read a completed entry back from disk; any read problem is a miss
    async fn read_entry(&self, fingerprint: Fingerprint) -> Option<Arc<CacheEntry>> {
        let dir = self.entry_dir(fingerprint);
        let meta_bytes = tokio::fs::read(dir.join("meta.json")).await.ok()?;
        let meta: EntryMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), "unreadable cache metadata: {e}");
                return None;
            }
        };
        let delta = match read_tree(dir.join("files")).await {
            Ok(delta) => delta,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), "unreadable cache entry: {e}");
                return None;
            }
        };
        Some(Arc::new(CacheEntry {
            fingerprint,
            delta,
            outputs: meta.outputs,
            created_at: meta.created_at,
        }))
    }

    /// Write an entry into a staging directory and rename it into place
    async fn write_entry(&self, entry: &CacheEntry) -> StagecraftResult<()> {
        let dir = self.entry_dir(entry.fingerprint);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(());
        }

        let staging = self.root.join(format!(".staging-{}", uuid::Uuid::new_v4()));
        let files = staging.join("files");
        tokio::fs::create_dir_all(&files)
            .await
            .map_err(|e| store_err(entry.fingerprint, "creating staging directory", e))?;

        for (path, contents) in entry.delta.iter() {
            let file = files.join(path);
            if let Some(parent) = file.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| store_err(entry.fingerprint, "creating entry directory", e))?;
            }
            tokio::fs::write(&file, contents)
                .await
                .map_err(|e| store_err(entry.fingerprint, "writing entry file", e))?;
        }

        let meta = EntryMeta {
            outputs: entry.outputs.clone(),
            created_at: entry.created_at,
        };
        tokio::fs::write(staging.join("meta.json"), serde_json::to_vec_pretty(&meta)?)
            .await
            .map_err(|e| store_err(entry.fingerprint, "writing entry metadata", e))?;

        match tokio::fs::rename(&staging, &dir).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                // A concurrent process may have won the rename; that entry
                // is byte-identical under the same fingerprint
                if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                    Ok(())
                } else {
                    Err(store_err(entry.fingerprint, "publishing entry", e))
                }
            }
        }
    }
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new()
    }
}

fn store_err(fingerprint: Fingerprint, context: &str, e: std::io::Error) -> StagecraftError {
    StagecraftError::CacheStore {
        fingerprint: fingerprint.to_string(),
        reason: format!("{context}: {e}"),
    }
}

/// Read every file under `root` into an artifact set
async fn read_tree(root: PathBuf) -> StagecraftResult<ArtifactSet> {
    tokio::task::spawn_blocking(move || {
        let mut set = ArtifactSet::new();
        if !root.exists() {
            return Ok(set);
        }
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry
                .map_err(|e| StagecraftError::internal(format!("walking cache entry: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&root) {
                Ok(rel) => normalize_path(&rel.to_string_lossy()),
                Err(_) => continue,
            };
            let contents = std::fs::read(entry.path())
                .map_err(|e| StagecraftError::io(format!("reading cached {rel}"), e))?;
            set.insert(rel, Arc::<[u8]>::from(contents.as_slice()));
        }
        Ok(set)
    })
    .await
    .map_err(|_| StagecraftError::internal("cache read task panicked"))?
}

#[async_trait]
impl ArtifactCache for DiskCache {
    async fn lookup(&self, fingerprint: Fingerprint) -> Option<Arc<CacheEntry>> {
        self.read_entry(fingerprint).await
    }

    async fn claim(&self, fingerprint: Fingerprint) -> Claim {
        // Held across the disk probe so two claimants cannot both miss
        let mut flights = self.flights.lock().await;
        if let Some(tx) = flights.building.get(&fingerprint) {
            return Claim::Wait(tx.subscribe());
        }
        if let Some(entry) = self.read_entry(fingerprint).await {
            return Claim::Hit(entry);
        }
        let (tx, _rx) = watch::channel(None);
        flights.building.insert(fingerprint, tx);
        debug!(fingerprint = %fingerprint.short(), "cache miss, claimed for execution");
        Claim::Execute
    }

    async fn store(&self, entry: CacheEntry) -> StagecraftResult<Arc<CacheEntry>> {
        let entry = Arc::new(entry);
        // On failure the flight stays open for the producer's release call
        self.write_entry(&entry).await?;

        let mut flights = self.flights.lock().await;
        if let Some(tx) = flights.building.remove(&entry.fingerprint) {
            let _ = tx.send(Some(FlightOutcome::Stored(Arc::clone(&entry))));
        }
        debug!(
            fingerprint = %entry.fingerprint.short(),
            files = entry.delta.len(),
            size = entry.size_bytes(),
            "cache entry written"
        );
        Ok(entry)
    }

    async fn release(&self, fingerprint: Fingerprint, outcome: FlightOutcome) {
        let mut flights = self.flights.lock().await;
        if let Some(tx) = flights.building.remove(&fingerprint) {
            let _ = tx.send(Some(outcome));
        }
    }

    async fn pin(&self, fingerprint: Fingerprint) {
        let mut flights = self.flights.lock().await;
        *flights.pins.entry(fingerprint).or_insert(0) += 1;
    }

    async fn unpin(&self, fingerprints: &[Fingerprint]) {
        let mut flights = self.flights.lock().await;
        for fp in fingerprints {
            if let Some(count) = flights.pins.get_mut(fp) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    flights.pins.remove(fp);
                }
            }
        }
    }

    async fn evict(&self, policy: &EvictionPolicy) -> usize {
        let pinned: HashSet<Fingerprint> = {
            let flights = self.flights.lock().await;
            flights
                .pins
                .keys()
                .copied()
                .filter(|fp| flights.pinned(fp))
                .collect()
        };

        let mut candidates: Vec<(Fingerprint, DateTime<Utc>)> = Vec::new();
        let mut ready_total = 0usize;
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(_) => return 0,
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let name = item.file_name();
            let Some(fp) = Fingerprint::from_hex(&name.to_string_lossy()) else {
                continue;
            };
            ready_total += 1;
            if pinned.contains(&fp) {
                continue;
            }
            let meta_bytes = match tokio::fs::read(item.path().join("meta.json")).await {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if let Ok(meta) = serde_json::from_slice::<EntryMeta>(&meta_bytes) {
                candidates.push((fp, meta.created_at));
            }
        }

        let doomed = select_doomed(candidates, ready_total, policy);
        let mut removed = 0usize;
        for fp in &doomed {
            match tokio::fs::remove_dir_all(self.entry_dir(*fp)).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(fingerprint = %fp.short(), "eviction failed: {e}"),
            }
        }
        if removed > 0 {
            debug!(evicted = removed, "cache eviction pass");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(seed: &str) -> CacheEntry {
        CacheEntry::new(
            Fingerprint::of_content(seed.as_bytes()),
            ArtifactSet::from_files([("out/app", seed), ("etc/conf", "static")]),
            vec!["out/app".into()],
        )
    }

    #[tokio::test]
    async fn entries_survive_across_instances() {
        let root = TempDir::new().unwrap();
        let e = entry("persist");
        let fp = e.fingerprint;

        let first = DiskCache::with_root(root.path().to_path_buf());
        first.store(e).await.unwrap();
        drop(first);

        // A fresh instance over the same root sees the entry: this is the
        // warm second invocation
        let second = DiskCache::with_root(root.path().to_path_buf());
        let hit = second.lookup(fp).await.unwrap();
        assert_eq!(hit.fingerprint, fp);
        assert_eq!(hit.delta.get("out/app").unwrap().as_ref(), b"persist");
        assert_eq!(hit.outputs, vec!["out/app"]);
        assert!(matches!(second.claim(fp).await, Claim::Hit(_)));
    }

    #[tokio::test]
    async fn claim_is_single_flight() {
        let root = TempDir::new().unwrap();
        let cache = DiskCache::with_root(root.path().to_path_buf());
        let fp = Fingerprint::of_content(b"contended");

        assert!(matches!(cache.claim(fp).await, Claim::Execute));
        let mut rx = match cache.claim(fp).await {
            Claim::Wait(rx) => rx,
            _ => panic!("expected Wait"),
        };

        cache.release(fp, FlightOutcome::Failed).await;
        let outcome = rx.wait_for(|o| o.is_some()).await.unwrap().clone();
        assert!(matches!(outcome, Some(FlightOutcome::Failed)));
        assert!(matches!(cache.claim(fp).await, Claim::Execute));
    }

    #[tokio::test]
    async fn unwritable_root_is_a_store_error() {
        let root = TempDir::new().unwrap();
        let blocker = root.path().join("occupied");
        std::fs::write(&blocker, "not a directory").unwrap();

        let cache = DiskCache::with_root(blocker);
        let err = cache.store(entry("doomed")).await.unwrap_err();
        assert!(matches!(err, StagecraftError::CacheStore { .. }));
    }

    #[tokio::test]
    async fn evict_drops_oldest_beyond_count_bound() {
        let root = TempDir::new().unwrap();
        let cache = DiskCache::with_root(root.path().to_path_buf());

        let mut old = entry("old");
        old.created_at = Utc::now() - chrono::Duration::seconds(3600);
        let old_fp = old.fingerprint;
        let new = entry("new");
        let new_fp = new.fingerprint;
        cache.store(old).await.unwrap();
        cache.store(new).await.unwrap();

        let removed = cache
            .evict(&EvictionPolicy {
                max_entries: Some(1),
                max_age_secs: None,
            })
            .await;
        assert_eq!(removed, 1);
        assert!(cache.lookup(old_fp).await.is_none());
        assert!(cache.lookup(new_fp).await.is_some());
    }

    #[tokio::test]
    async fn evict_spares_pinned_entries() {
        let root = TempDir::new().unwrap();
        let cache = DiskCache::with_root(root.path().to_path_buf());

        let e = entry("pinned");
        let fp = e.fingerprint;
        cache.store(e).await.unwrap();
        cache.pin(fp).await;

        let removed = cache
            .evict(&EvictionPolicy {
                max_entries: Some(0),
                max_age_secs: None,
            })
            .await;
        assert_eq!(removed, 0);
        assert!(cache.lookup(fp).await.is_some());
    }
}
