//! Execution collaborators
//!
//! The evaluator never interprets action contents or external references
//! itself. Both concerns sit behind traits: [`ActionExecutor`] runs a
//! stage's substituted actions against a materialized input tree and hands
//! back the filesystem delta, and [`ExternalResolver`] turns an external
//! reference (base image identifier, prebuilt artifact source) into a
//! fingerprint plus a pre-materialized artifact set.
//!
//! [`LocalShellExecutor`] is the CLI's default executor: each action runs
//! under `sh -c` in a scratch directory seeded with the input tree, and the
//! delta is whatever the actions created or changed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::artifact::{normalize_path, ArtifactSet};
use crate::error::{StagecraftError, StagecraftResult};
use crate::fingerprint::Fingerprint;

/// Cancellation signal shared across a build; `true` means stop at the
/// next safe boundary (between actions).
pub type CancelSignal = watch::Receiver<bool>;

/// A cancel signal that never fires, for standalone executor use.
/// `watch::Receiver::borrow` keeps returning the last value after the
/// sender drops, so holding only the receiver is fine here.
pub fn never_cancelled() -> CancelSignal {
    let (_tx, rx) = watch::channel(false);
    rx
}

/// Max number of output lines included in action failure messages
const ACTION_ERROR_TAIL_LINES: usize = 20;

/// A resolved external reference: leaf fingerprint plus pre-materialized
/// artifacts
#[derive(Debug, Clone)]
pub struct ResolvedExternal {
    pub fingerprint: Fingerprint,
    pub artifacts: ArtifactSet,
}

/// Runs a stage's substituted actions and returns the produced delta
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute `actions` in order against `input`. Each action's filesystem
    /// effects must be visible to the next. Returns only the files the
    /// actions created or changed, never the input tree itself.
    async fn execute(
        &self,
        stage: &str,
        input: &ArtifactSet,
        actions: &[String],
        cancel: &CancelSignal,
    ) -> StagecraftResult<ArtifactSet>;
}

/// Resolves external references into leaf fingerprints and artifacts
#[async_trait]
pub trait ExternalResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> StagecraftResult<ResolvedExternal>;
}

/// Resolver that treats every reference as an opaque pinned identifier:
/// the fingerprint is a digest of the reference string and the artifact
/// set is empty. This is the CLI default — artifact fetch is a collaborator
/// concern, and a pinned reference string is already a stable cache key.
#[derive(Debug, Default)]
pub struct IdentityResolver;

#[async_trait]
impl ExternalResolver for IdentityResolver {
    async fn resolve(&self, reference: &str) -> StagecraftResult<ResolvedExternal> {
        Ok(ResolvedExternal {
            fingerprint: Fingerprint::of_content(reference.as_bytes()),
            artifacts: ArtifactSet::new(),
        })
    }
}

/// Resolver backed by a fixed map, for tests and embedders that
/// pre-materialize their externals
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, ResolvedExternal>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reference with the given artifacts; the fingerprint is
    /// derived from the reference and content
    pub fn with(mut self, reference: impl Into<String>, artifacts: ArtifactSet) -> Self {
        let reference = reference.into();
        let mut seed = reference.clone().into_bytes();
        for (path, contents) in artifacts.iter() {
            seed.extend_from_slice(path.as_bytes());
            seed.extend_from_slice(contents);
        }
        self.entries.insert(
            reference,
            ResolvedExternal {
                fingerprint: Fingerprint::of_content(&seed),
                artifacts,
            },
        );
        self
    }
}

#[async_trait]
impl ExternalResolver for StaticResolver {
    async fn resolve(&self, reference: &str) -> StagecraftResult<ResolvedExternal> {
        self.entries.get(reference).cloned().ok_or_else(|| {
            StagecraftError::ExternalResolve {
                reference: reference.to_string(),
                reason: "not registered with the resolver".to_string(),
            }
        })
    }
}

/// Shell-based action executor working in throwaway scratch directories
pub struct LocalShellExecutor {
    scratch_root: PathBuf,
}

impl LocalShellExecutor {
    /// Executor with scratch dirs under the user state directory
    pub fn new() -> Self {
        let root = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("stagecraft")
            .join("scratch");
        Self { scratch_root: root }
    }

    /// Executor with an explicit scratch root, for tests
    pub fn with_scratch_root(root: PathBuf) -> Self {
        Self { scratch_root: root }
    }

    async fn seed_scratch(&self, dir: &Path, input: &ArtifactSet) -> StagecraftResult<()> {
        for (path, contents) in input.iter() {
            let file = dir.join(path);
            if let Some(parent) = file.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StagecraftError::io(format!("creating {}", parent.display()), e))?;
            }
            tokio::fs::write(&file, contents)
                .await
                .map_err(|e| StagecraftError::io(format!("seeding {}", file.display()), e))?;
        }
        Ok(())
    }
}

impl Default for LocalShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for LocalShellExecutor {
    async fn execute(
        &self,
        stage: &str,
        input: &ArtifactSet,
        actions: &[String],
        cancel: &CancelSignal,
    ) -> StagecraftResult<ArtifactSet> {
        let scratch = self.scratch_root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| StagecraftError::io("creating scratch directory", e))?;

        let result = run_actions(stage, &scratch, input, actions, cancel, self).await;

        // Best-effort cleanup
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        result
    }
}

async fn run_actions(
    stage: &str,
    scratch: &Path,
    input: &ArtifactSet,
    actions: &[String],
    cancel: &CancelSignal,
    executor: &LocalShellExecutor,
) -> StagecraftResult<ArtifactSet> {
    executor.seed_scratch(scratch, input).await?;

    for (index, action) in actions.iter().enumerate() {
        if *cancel.borrow() {
            return Err(StagecraftError::Cancelled);
        }
        debug!(stage, index, "running action");

        let output = Command::new("sh")
            .arg("-c")
            .arg(action)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StagecraftError::io(format!("spawning action for stage '{stage}'"), e))?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StagecraftError::ActionFailed {
                stage: stage.to_string(),
                action_index: index,
                detail: error_tail(&stdout, &stderr),
            });
        }
    }

    collect_delta(scratch.to_path_buf(), input.clone()).await
}

/// Last lines of combined output, for actionable failure messages
fn error_tail(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let skip = lines.len().saturating_sub(ACTION_ERROR_TAIL_LINES);
    lines[skip..].join("\n")
}

/// Scan the scratch tree and keep files the actions created or changed
async fn collect_delta(scratch: PathBuf, input: ArtifactSet) -> StagecraftResult<ArtifactSet> {
    tokio::task::spawn_blocking(move || {
        let mut delta = ArtifactSet::new();
        for entry in WalkDir::new(&scratch).follow_links(false) {
            let entry = entry.map_err(|e| {
                StagecraftError::internal(format!("walking scratch tree: {e}"))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&scratch) {
                Ok(rel) => normalize_path(&rel.to_string_lossy()),
                Err(_) => continue,
            };
            let contents = std::fs::read(entry.path())
                .map_err(|e| StagecraftError::io(format!("reading {rel}"), e))?;

            let unchanged = input
                .get(&rel)
                .is_some_and(|prev| prev.as_ref() == contents.as_slice());
            if !unchanged {
                delta.insert(rel, Arc::<[u8]>::from(contents.as_slice()));
            }
        }
        Ok(delta)
    })
    .await
    .map_err(|e| {
        warn!("delta scan task failed: {e}");
        StagecraftError::internal("delta scan task panicked")
    })?
}
