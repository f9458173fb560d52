//! Build scheduling
//!
//! Walks the reachable subgraph with Kahn's algorithm and dispatches stage
//! executions to spawned tasks, bounded by the configured job limit. All
//! dependency counting lives in the single-threaded coordination loop;
//! workers report back over an mpsc channel rather than through callbacks,
//! so the bookkeeping stays easy to reason about while execution runs in
//! parallel.
//!
//! Ready stages dispatch FIFO in topological discovery order. Any fair
//! policy is correct here; this one is deterministic for a given document.
//!
//! Failure isolation: a failed stage marks its transitive dependents
//! `Aborted` and nothing else — independent branches run to completion and
//! their results stay cached. Cancellation stops in-flight work at the next
//! action boundary and aborts everything not yet started; completed entries
//! remain cached.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::artifact::CacheEntry;
use crate::cache::{ArtifactCache, Claim, FlightOutcome};
use crate::compose::{ComposedOutput, Composer};
use crate::config::BuildOptions;
use crate::error::{StagecraftError, StagecraftResult};
use crate::executor::{ActionExecutor, CancelSignal, ExternalResolver};
use crate::fingerprint::{stage_fingerprint, substituted_actions, Fingerprint};
use crate::graph::{ArgOverrides, BuildGraph, NodeId};
use crate::report::{BuildReport, StageReport, StageStatus};

/// Everything a finished build hands back: the per-stage report plus the
/// composed output for each requested target (empty unless the build
/// succeeded).
#[derive(Debug)]
pub struct BuildOutcome {
    pub report: BuildReport,
    pub outputs: Vec<ComposedOutput>,
}

/// Message a worker or flight-waiter sends back to the coordination loop
struct Completion {
    id: NodeId,
    /// Whether actions actually ran (false for joined in-flight executions)
    executed: bool,
    duration: Duration,
    result: StagecraftResult<Arc<CacheEntry>>,
}

/// Terminal record for one stage, accumulated during the run
struct StageRecord {
    status: StageStatus,
    fingerprint: Option<Fingerprint>,
    duration: Duration,
    error: Option<String>,
}

/// Coordinates a build over an explicit graph, cache, executor, and
/// resolver. The cache is passed in, never ambient, so tests can hand in
/// their own.
pub struct Scheduler {
    cache: Arc<dyn ArtifactCache>,
    executor: Arc<dyn ActionExecutor>,
    resolver: Arc<dyn ExternalResolver>,
    options: BuildOptions,
}

impl Scheduler {
    pub fn new(
        cache: Arc<dyn ArtifactCache>,
        executor: Arc<dyn ActionExecutor>,
        resolver: Arc<dyn ExternalResolver>,
        options: BuildOptions,
    ) -> Self {
        Self {
            cache,
            executor,
            resolver,
            options,
        }
    }

    /// Run the build for the given targets.
    ///
    /// Structural problems (missing target, unresolvable external) return
    /// `Err` before anything executes. Per-stage failures do not: they are
    /// reported through the per-stage statuses, and `outputs` stays empty.
    pub async fn run(
        &self,
        graph: &BuildGraph,
        targets: &[String],
        overrides: &ArgOverrides,
        cancel: CancelSignal,
    ) -> StagecraftResult<BuildOutcome> {
        let started_at = Utc::now();
        let reachable = graph.reachable(targets)?;
        let order = graph.topo_order(&reachable);

        // Resolve external leaves up front; failures here are fatal before
        // any execution, like the structural errors.
        let mut composer = Composer::new(graph, self.options.pattern_policy);
        let mut fps: HashMap<NodeId, Fingerprint> = HashMap::new();
        for &id in &reachable {
            if !graph.is_external(id) {
                continue;
            }
            let reference = graph.node(id).name().to_string();
            let resolved = match self.resolver.resolve(&reference).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    // A reference that is neither a declared stage nor
                    // resolvable externally is a structural problem
                    warn!(reference = %reference, "external resolution failed: {e}");
                    let stage = graph
                        .dependents(id)
                        .first()
                        .map(|&d| graph.node(d).name().to_string())
                        .unwrap_or_default();
                    return Err(StagecraftError::UndefinedReference { stage, reference });
                }
            };
            debug!(reference = %reference, fingerprint = %resolved.fingerprint.short(), "external resolved");
            fps.insert(id, resolved.fingerprint);
            composer.set_external(id, resolved.artifacts);
        }

        let mut in_set = vec![false; graph.len()];
        for &id in &reachable {
            in_set[id] = true;
        }

        // In-degree counts only unfinished (stage) dependencies; resolved
        // externals are already satisfied.
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut remaining = 0usize;
        for &id in &reachable {
            if graph.is_external(id) {
                continue;
            }
            remaining += 1;
            let degree = graph
                .deps(id)
                .iter()
                .filter(|&&d| in_set[d] && !graph.is_external(d))
                .count();
            in_degree.insert(id, degree);
        }

        let mut ready: VecDeque<NodeId> = order
            .iter()
            .copied()
            .filter(|&id| !graph.is_external(id) && in_degree[&id] == 0)
            .collect();

        let (tx, mut rx) = mpsc::channel::<Completion>(64.max(remaining));
        let mut records: HashMap<NodeId, StageRecord> = HashMap::new();
        let mut pinned: Vec<Fingerprint> = Vec::new();
        let mut running = 0usize; // worker slots in use
        let mut inflight = 0usize; // tasks that will report (workers + waiters)
        let mut executed = 0usize;
        let mut cache_hits = 0usize;

        let mut cancel_rx = cancel.clone();
        let mut cancelled = *cancel_rx.borrow();
        let mut cancel_closed = false;

        while remaining > 0 {
            // Dispatch phase
            while let Some(&id) = ready.front() {
                if records.contains_key(&id) {
                    ready.pop_front();
                    continue;
                }
                if cancelled {
                    ready.pop_front();
                    self.record(&mut records, &mut remaining, id, StageRecord {
                        status: StageStatus::Aborted,
                        fingerprint: fps.get(&id).copied(),
                        duration: Duration::ZERO,
                        error: None,
                    });
                    continue;
                }
                if running >= self.options.jobs {
                    break;
                }
                ready.pop_front();

                let fp = match stage_fingerprint(graph, id, overrides, &fps) {
                    Ok(fp) => fp,
                    Err(e) => {
                        self.fail_stage(
                            graph, &in_set, &mut records, &mut remaining, id, None,
                            Duration::ZERO, e,
                        );
                        continue;
                    }
                };
                fps.insert(id, fp);
                self.cache.pin(fp).await;
                pinned.push(fp);

                match self.cache.claim(fp).await {
                    Claim::Hit(entry) => {
                        debug!(stage = graph.node(id).name(), fingerprint = %fp.short(), "cache hit");
                        composer.set_entry(id, entry);
                        cache_hits += 1;
                        self.record(&mut records, &mut remaining, id, StageRecord {
                            status: StageStatus::CacheHit,
                            fingerprint: Some(fp),
                            duration: Duration::ZERO,
                            error: None,
                        });
                        Self::satisfy_dependents(graph, &in_set, &records, &mut in_degree, &mut ready, id);
                    }
                    Claim::Wait(mut flight) => {
                        debug!(stage = graph.node(id).name(), fingerprint = %fp.short(), "joining in-flight execution");
                        let tx = tx.clone();
                        inflight += 1;
                        tokio::spawn(async move {
                            let outcome = flight
                                .wait_for(|o| o.is_some())
                                .await
                                .map(|o| o.clone())
                                .unwrap_or(Some(FlightOutcome::Failed));
                            let result = match outcome {
                                Some(FlightOutcome::Stored(entry)) => Ok(entry),
                                Some(FlightOutcome::Cancelled) => {
                                    Err(StagecraftError::Cancelled)
                                }
                                _ => Err(StagecraftError::internal(
                                    "joined execution failed",
                                )),
                            };
                            let _ = tx
                                .send(Completion {
                                    id,
                                    executed: false,
                                    duration: Duration::ZERO,
                                    result,
                                })
                                .await;
                        });
                    }
                    Claim::Execute => {
                        let input = match composer.stage_input(id) {
                            Ok(input) => input,
                            Err(e) => {
                                self.cache.release(fp, FlightOutcome::Failed).await;
                                self.fail_stage(
                                    graph, &in_set, &mut records, &mut remaining, id, Some(fp),
                                    Duration::ZERO, e,
                                );
                                continue;
                            }
                        };
                        let spec = graph.stage(id).ok_or_else(|| {
                            StagecraftError::internal("ready node is not a stage")
                        })?;
                        let actions = match substituted_actions(spec, overrides) {
                            Ok(actions) => actions,
                            Err(e) => {
                                self.cache.release(fp, FlightOutcome::Failed).await;
                                self.fail_stage(
                                    graph, &in_set, &mut records, &mut remaining, id, Some(fp),
                                    Duration::ZERO, e,
                                );
                                continue;
                            }
                        };

                        debug!(stage = %spec.name, fingerprint = %fp.short(), "dispatching");
                        let stage_name = spec.name.clone();
                        let outputs = spec.outputs.clone();
                        let executor = Arc::clone(&self.executor);
                        let cache = Arc::clone(&self.cache);
                        let worker_cancel = cancel.clone();
                        let tx = tx.clone();
                        running += 1;
                        inflight += 1;
                        tokio::spawn(async move {
                            let started = Instant::now();
                            let result = match executor
                                .execute(&stage_name, &input, &actions, &worker_cancel)
                                .await
                            {
                                Ok(delta) => {
                                    let entry = CacheEntry::new(fp, delta, outputs);
                                    match cache.store(entry.clone()).await {
                                        Ok(stored) => Ok(stored),
                                        Err(e) => {
                                            // Storage trouble degrades to a miss:
                                            // the produced entry still feeds this
                                            // build, waiters included
                                            warn!(stage = %stage_name, "cache store failed: {e}");
                                            let entry = Arc::new(entry);
                                            cache
                                                .release(
                                                    fp,
                                                    FlightOutcome::Stored(Arc::clone(&entry)),
                                                )
                                                .await;
                                            Ok(entry)
                                        }
                                    }
                                }
                                Err(e) => {
                                    let outcome = if matches!(e, StagecraftError::Cancelled) {
                                        FlightOutcome::Cancelled
                                    } else {
                                        FlightOutcome::Failed
                                    };
                                    cache.release(fp, outcome).await;
                                    Err(e)
                                }
                            };
                            let _ = tx
                                .send(Completion {
                                    id,
                                    executed: true,
                                    duration: started.elapsed(),
                                    result,
                                })
                                .await;
                        });
                    }
                }
            }

            if remaining == 0 {
                break;
            }
            if inflight == 0 {
                if ready.is_empty() {
                    break;
                }
                continue;
            }

            // Wait phase: next completion, or the cancel signal
            let completion = tokio::select! {
                completion = rx.recv() => completion,
                changed = cancel_rx.changed(), if !cancelled && !cancel_closed => {
                    match changed {
                        Ok(()) => {
                            if *cancel_rx.borrow() {
                                info!("build cancelled, stopping at next action boundary");
                                cancelled = true;
                                self.abort_pending(graph, &reachable, &mut records, &mut remaining, &mut ready, &fps);
                            }
                        }
                        Err(_) => cancel_closed = true,
                    }
                    continue;
                }
            };

            let Some(completion) = completion else {
                break;
            };
            if completion.executed {
                running -= 1;
            }
            inflight -= 1;

            let id = completion.id;
            match completion.result {
                Ok(entry) => {
                    composer.set_entry(id, Arc::clone(&entry));
                    let status = if completion.executed {
                        executed += 1;
                        StageStatus::Succeeded
                    } else {
                        cache_hits += 1;
                        StageStatus::CacheHit
                    };
                    self.record(&mut records, &mut remaining, id, StageRecord {
                        status,
                        fingerprint: Some(entry.fingerprint),
                        duration: completion.duration,
                        error: None,
                    });
                    Self::satisfy_dependents(graph, &in_set, &records, &mut in_degree, &mut ready, id);
                }
                Err(StagecraftError::Cancelled) => {
                    self.record(&mut records, &mut remaining, id, StageRecord {
                        status: StageStatus::Aborted,
                        fingerprint: fps.get(&id).copied(),
                        duration: completion.duration,
                        error: None,
                    });
                }
                Err(e) => {
                    self.fail_stage(
                        graph,
                        &in_set,
                        &mut records,
                        &mut remaining,
                        id,
                        fps.get(&id).copied(),
                        completion.duration,
                        e,
                    );
                }
            }
        }

        // Every reachable stage gets exactly one terminal status
        for &id in &reachable {
            if !graph.is_external(id) && !records.contains_key(&id) {
                records.insert(id, StageRecord {
                    status: StageStatus::Aborted,
                    fingerprint: fps.get(&id).copied(),
                    duration: Duration::ZERO,
                    error: None,
                });
            }
        }

        self.cache.unpin(&pinned).await;
        let evicted = self.cache.evict(&self.options.eviction).await;
        if evicted > 0 {
            debug!(evicted, "post-build cache eviction");
        }

        let stages: Vec<StageReport> = order
            .iter()
            .filter(|&&id| !graph.is_external(id))
            .map(|&id| {
                let record = &records[&id];
                StageReport {
                    stage: graph.node(id).name().to_string(),
                    status: record.status,
                    fingerprint: record.fingerprint.map(|f| f.to_string()),
                    duration_ms: record.duration.as_millis() as u64,
                    error: record.error.clone(),
                }
            })
            .collect();

        let report = BuildReport {
            started_at,
            finished_at: Utc::now(),
            stages,
            executed,
            cache_hits,
        };

        let mut outputs = Vec::new();
        if report.succeeded() {
            for target in targets {
                let id = graph
                    .lookup(target)
                    .ok_or_else(|| StagecraftError::MissingTarget(target.clone()))?;
                outputs.push(composer.compose(id)?);
            }
        }

        info!(
            executed,
            cache_hits,
            success = report.succeeded(),
            "build finished"
        );
        Ok(BuildOutcome { report, outputs })
    }

    fn record(
        &self,
        records: &mut HashMap<NodeId, StageRecord>,
        remaining: &mut usize,
        id: NodeId,
        record: StageRecord,
    ) {
        if records.insert(id, record).is_none() {
            *remaining -= 1;
        }
    }

    /// Mark a stage failed and abort its transitive dependents
    #[allow(clippy::too_many_arguments)]
    fn fail_stage(
        &self,
        graph: &BuildGraph,
        in_set: &[bool],
        records: &mut HashMap<NodeId, StageRecord>,
        remaining: &mut usize,
        id: NodeId,
        fingerprint: Option<Fingerprint>,
        duration: Duration,
        error: StagecraftError,
    ) {
        warn!(stage = graph.node(id).name(), "stage failed: {error}");
        self.record(records, remaining, id, StageRecord {
            status: StageStatus::Failed,
            fingerprint,
            duration,
            error: Some(error.to_string()),
        });
        for dependent in graph.transitive_dependents(id) {
            if in_set[dependent] && !records.contains_key(&dependent) {
                self.record(records, remaining, dependent, StageRecord {
                    status: StageStatus::Aborted,
                    fingerprint: None,
                    duration: Duration::ZERO,
                    error: None,
                });
            }
        }
    }

    /// Decrement dependents' in-degrees after a successful completion
    fn satisfy_dependents(
        graph: &BuildGraph,
        in_set: &[bool],
        records: &HashMap<NodeId, StageRecord>,
        in_degree: &mut HashMap<NodeId, usize>,
        ready: &mut VecDeque<NodeId>,
        id: NodeId,
    ) {
        for &dependent in graph.dependents(id) {
            if !in_set[dependent] || records.contains_key(&dependent) {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(&dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    /// On cancellation, abort everything that has not started
    fn abort_pending(
        &self,
        graph: &BuildGraph,
        reachable: &[NodeId],
        records: &mut HashMap<NodeId, StageRecord>,
        remaining: &mut usize,
        ready: &mut VecDeque<NodeId>,
        fps: &HashMap<NodeId, Fingerprint>,
    ) {
        ready.clear();
        for &id in reachable {
            if graph.is_external(id) || records.contains_key(&id) {
                continue;
            }
            if fps.contains_key(&id) {
                // Dispatched (executing or joined); its task reports its
                // own terminal status when it stops
                continue;
            }
            self.record(records, remaining, id, StageRecord {
                status: StageStatus::Aborted,
                fingerprint: None,
                duration: Duration::ZERO,
                error: None,
            });
        }
    }
}
