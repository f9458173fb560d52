//! Immutable artifact sets
//!
//! An [`ArtifactSet`] is an in-memory filesystem delta: a sorted map of
//! normalized paths to file contents. Stages never mutate each other's
//! artifacts — cross-stage data flow goes through cloned sets, and contents
//! are behind `Arc` so cloning a set is cheap.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fingerprint::Fingerprint;

/// Format bytes as human-readable size (e.g., "1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// An ordered, immutable set of file artifacts keyed by normalized path.
///
/// Paths are stored without a leading `/` and with `/` separators. The
/// `BTreeMap` keeps iteration deterministic, which in turn keeps composed
/// output byte-identical across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl ArtifactSet {
    /// Create an empty artifact set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, replacing any existing entry at the same path
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Arc<[u8]>>) {
        self.files.insert(normalize_path(&path.into()), contents.into());
    }

    /// Look up a file by path
    pub fn get(&self, path: &str) -> Option<&Arc<[u8]>> {
        self.files.get(&normalize_path(path))
    }

    /// Whether a file exists at the given path
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_path(path))
    }

    /// Iterate over `(path, contents)` in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<[u8]>)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c))
    }

    /// Paths only, in sorted order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Number of files in the set
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the set holds no files
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total content size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.files.values().map(|c| c.len() as u64).sum()
    }

    /// Layer `other` on top of this set. Overlapping paths take `other`'s
    /// contents (last-write-wins).
    pub fn layer(&mut self, other: &ArtifactSet) {
        for (path, contents) in &other.files {
            self.files.insert(path.clone(), Arc::clone(contents));
        }
    }

    /// Build a set from `(path, contents)` pairs, for tests and fixtures
    pub fn from_files<P, C>(files: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: Into<String>,
        C: AsRef<[u8]>,
    {
        let mut set = Self::new();
        for (path, contents) in files {
            set.insert(path, Arc::<[u8]>::from(contents.as_ref()));
        }
        set
    }
}

/// Normalize a path: forward slashes, no leading `/`, no `.` segments
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// A materialized stage result stored in the artifact cache.
///
/// Holds the stage's own filesystem delta (files its actions produced), not
/// the full base chain. Immutable once stored; superseded only by a new
/// entry under a new fingerprint.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Fingerprint this entry is keyed by
    pub fingerprint: Fingerprint,

    /// Filesystem delta produced by the stage's actions
    pub delta: ArtifactSet,

    /// Declared output paths reachable from the delta
    pub outputs: Vec<String>,

    /// When the entry was stored
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry timestamped now
    pub fn new(fingerprint: Fingerprint, delta: ArtifactSet, outputs: Vec<String>) -> Self {
        Self {
            fingerprint,
            delta,
            outputs,
            created_at: Utc::now(),
        }
    }

    /// Total content size of the delta in bytes
    pub fn size_bytes(&self) -> u64 {
        self.delta.size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_leading_slash_and_dots() {
        assert_eq!(normalize_path("/usr/local/bin"), "usr/local/bin");
        assert_eq!(normalize_path("./a//b/."), "a/b");
        assert_eq!(normalize_path("a\\b"), "a/b");
    }

    #[test]
    fn layer_last_write_wins() {
        let mut base = ArtifactSet::from_files([("bin/app", "v1"), ("etc/conf", "x")]);
        let top = ArtifactSet::from_files([("bin/app", "v2")]);
        base.layer(&top);

        assert_eq!(base.get("bin/app").unwrap().as_ref(), b"v2");
        assert_eq!(base.get("etc/conf").unwrap().as_ref(), b"x");
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn iteration_is_sorted() {
        let set = ArtifactSet::from_files([("z", "1"), ("a", "2"), ("m", "3")]);
        let paths: Vec<&str> = set.paths().collect();
        assert_eq!(paths, vec!["a", "m", "z"]);
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
