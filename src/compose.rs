//! Final output composition
//!
//! Materializes a stage's full filesystem tree from its cached pieces:
//! the base chain first, then cross-stage copy imports in declaration
//! order, then the stage's own delta. Later writes win at overlapping
//! paths. The same materialization feeds both a stage's execution input
//! and the final composed target, so copy patterns are resolved exactly
//! one way.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::artifact::{normalize_path, ArtifactSet, CacheEntry};
use crate::error::{StagecraftError, StagecraftResult};
use crate::graph::{BuildGraph, NodeId};

/// What to do when a copy pattern matches nothing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternPolicy {
    /// Fail the stage and its dependents
    #[default]
    Fatal,
    /// Log a warning and copy nothing
    Warn,
}

/// Composed output for one target
#[derive(Debug)]
pub struct ComposedOutput {
    /// Target stage name
    pub target: String,

    /// Fully materialized filesystem tree
    pub artifacts: ArtifactSet,

    /// The target's declared output paths
    pub outputs: Vec<String>,
}

/// Materializes full stage trees from cached deltas and external artifacts.
///
/// Owned by the build coordination loop; entries are fed in as stages
/// complete and full trees are memoized per node.
pub struct Composer<'g> {
    graph: &'g BuildGraph,
    policy: PatternPolicy,
    externals: HashMap<NodeId, ArtifactSet>,
    entries: HashMap<NodeId, Arc<CacheEntry>>,
    memo: HashMap<NodeId, ArtifactSet>,
}

impl<'g> Composer<'g> {
    pub fn new(graph: &'g BuildGraph, policy: PatternPolicy) -> Self {
        Self {
            graph,
            policy,
            externals: HashMap::new(),
            entries: HashMap::new(),
            memo: HashMap::new(),
        }
    }

    /// Provide a resolved external leaf's artifact set
    pub fn set_external(&mut self, id: NodeId, artifacts: ArtifactSet) {
        self.externals.insert(id, artifacts);
    }

    /// Provide a completed stage's cache entry
    pub fn set_entry(&mut self, id: NodeId, entry: Arc<CacheEntry>) {
        self.entries.insert(id, entry);
    }

    /// The input tree a stage's actions run against: materialized base
    /// plus copy imports in declaration order
    pub fn stage_input(&mut self, id: NodeId) -> StagecraftResult<ArtifactSet> {
        let spec = self
            .graph
            .stage(id)
            .ok_or_else(|| StagecraftError::internal("external node has no stage input"))?;
        let stage_name = spec.name.clone();
        let base_name = spec.base.clone();
        let copies = spec.copies.clone();

        let base_id = self
            .graph
            .lookup(&base_name)
            .ok_or_else(|| StagecraftError::internal(format!("base '{base_name}' not in graph")))?;
        let mut tree = self.materialize(base_id)?;

        for copy in &copies {
            let source_id = self.graph.lookup(&copy.from).ok_or_else(|| {
                StagecraftError::internal(format!("copy source '{}' not in graph", copy.from))
            })?;
            let source_tree = self.materialize(source_id)?;
            let matched = select_files(&source_tree, &copy.pattern, &copy.dest);

            if matched.is_empty() {
                match self.policy {
                    PatternPolicy::Fatal => {
                        return Err(StagecraftError::PatternMatch {
                            stage: stage_name,
                            source_stage: copy.from.clone(),
                            pattern: copy.pattern.clone(),
                        })
                    }
                    PatternPolicy::Warn => {
                        warn!(
                            stage = %stage_name,
                            source = %copy.from,
                            pattern = %copy.pattern,
                            "copy pattern matched nothing"
                        );
                        continue;
                    }
                }
            }
            debug!(
                stage = %stage_name,
                source = %copy.from,
                files = matched.len(),
                "copying artifacts"
            );
            tree.layer(&matched);
        }
        Ok(tree)
    }

    /// Full materialized tree for a node: external artifacts for leaves,
    /// `stage_input` layered with the cached delta for stages. Memoized.
    pub fn materialize(&mut self, id: NodeId) -> StagecraftResult<ArtifactSet> {
        if let Some(tree) = self.memo.get(&id) {
            return Ok(tree.clone());
        }

        let tree = if self.graph.is_external(id) {
            self.externals.get(&id).cloned().ok_or_else(|| {
                StagecraftError::internal(format!(
                    "external '{}' was never resolved",
                    self.graph.node(id).name()
                ))
            })?
        } else {
            let delta = self
                .entries
                .get(&id)
                .map(|e| e.delta.clone())
                .ok_or_else(|| {
                    StagecraftError::internal(format!(
                        "stage '{}' materialized before completion",
                        self.graph.node(id).name()
                    ))
                })?;
            let mut tree = self.stage_input(id)?;
            tree.layer(&delta);
            tree
        };

        self.memo.insert(id, tree.clone());
        Ok(tree)
    }

    /// Compose the final output for a target stage
    pub fn compose(&mut self, id: NodeId) -> StagecraftResult<ComposedOutput> {
        let spec = self
            .graph
            .stage(id)
            .ok_or_else(|| StagecraftError::internal("compose target must be a stage"))?;
        let target = spec.name.clone();
        let outputs = spec.outputs.clone();

        let artifacts = self.materialize(id)?;
        for output in &outputs {
            if !artifacts.contains(output) {
                warn!(target = %target, output = %output, "declared output missing from tree");
            }
        }
        Ok(ComposedOutput {
            target,
            artifacts,
            outputs,
        })
    }
}

/// Select files matching `pattern` from `tree`, re-rooted under `dest`.
///
/// Supported patterns, resolved against normalized paths:
/// - exact file path (`target/app`), placed at `dest/<basename>`
/// - directory prefix (`target`), contents placed at `dest/<relative>`
/// - wildcards `*` and `?` within a segment and `**` across segments;
///   matches are placed relative to the longest wildcard-free prefix
pub fn select_files(tree: &ArtifactSet, pattern: &str, dest: &str) -> ArtifactSet {
    let pattern = normalize_path(pattern);
    let dest = normalize_path(dest);
    let mut out = ArtifactSet::new();

    let strip_root = static_prefix(&pattern);
    for (path, contents) in tree.iter() {
        let rel = if path == pattern {
            // Exact file match keeps only the basename
            Some(path.rsplit('/').next().unwrap_or(path).to_string())
        } else if let Some(under) = path.strip_prefix(&format!("{pattern}/")) {
            Some(under.to_string())
        } else if glob_match(&pattern, path) {
            Some(
                path.strip_prefix(&format!("{strip_root}/"))
                    .unwrap_or(path)
                    .to_string(),
            )
        } else {
            None
        };

        if let Some(rel) = rel {
            let target = if dest.is_empty() {
                rel
            } else {
                format!("{dest}/{rel}")
            };
            out.insert(target, Arc::clone(contents));
        }
    }
    out
}

/// Longest leading run of pattern segments without wildcards
fn static_prefix(pattern: &str) -> String {
    pattern
        .split('/')
        .take_while(|seg| !seg.contains(['*', '?']))
        .collect::<Vec<_>>()
        .join("/")
}

/// Segment-wise glob match; `**` spans any number of segments
fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segs)
}

fn match_segments(pat: &[&str], segs: &[&str]) -> bool {
    match pat.first() {
        None => segs.is_empty(),
        Some(&"**") => {
            // Zero or more segments
            (0..=segs.len()).any(|skip| match_segments(&pat[1..], &segs[skip..]))
        }
        Some(first) => match segs.first() {
            Some(seg) => match_one(first, seg) && match_segments(&pat[1..], &segs[1..]),
            None => false,
        },
    }
}

/// Single-segment wildcard match (`*`, `?`)
fn match_one(pattern: &str, segment: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let seg: Vec<char> = segment.chars().collect();

    // Classic iterative glob with backtracking over the last `*`
    let (mut p, mut s) = (0usize, 0usize);
    let (mut star, mut star_s) = (None::<usize>, 0usize);

    while s < seg.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == seg[s]) {
            p += 1;
            s += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            star_s = s;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_s += 1;
            s = star_s;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::spec::{Action, BuildArg, CopySpec, StageSpec};
    use crate::fingerprint::Fingerprint;

    #[test]
    fn glob_segments() {
        assert!(glob_match("target/*.so", "target/libfoo.so"));
        assert!(!glob_match("target/*.so", "target/debug/libfoo.so"));
        assert!(glob_match("target/**", "target/debug/libfoo.so"));
        assert!(glob_match("**/app", "a/b/app"));
        assert!(glob_match("lib?.a", "lib1.a"));
        assert!(!glob_match("lib?.a", "lib10.a"));
    }

    #[test]
    fn select_exact_file_takes_basename() {
        let tree = ArtifactSet::from_files([("target/release/app", "bin")]);
        let out = select_files(&tree, "target/release/app", "usr/local/bin");
        assert_eq!(out.get("usr/local/bin/app").unwrap().as_ref(), b"bin");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn select_directory_keeps_relative_layout() {
        let tree = ArtifactSet::from_files([
            ("dist/bin/app", "a"),
            ("dist/lib/libx.so", "b"),
            ("other/file", "c"),
        ]);
        let out = select_files(&tree, "dist", "opt/app");
        assert!(out.contains("opt/app/bin/app"));
        assert!(out.contains("opt/app/lib/libx.so"));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn select_wildcard_strips_static_prefix() {
        let tree = ArtifactSet::from_files([
            ("build/kernels/sm80.cubin", "x"),
            ("build/kernels/sm90.cubin", "y"),
            ("build/notes.txt", "z"),
        ]);
        let out = select_files(&tree, "build/kernels/*.cubin", "opt/kernels");
        assert!(out.contains("opt/kernels/sm80.cubin"));
        assert!(out.contains("opt/kernels/sm90.cubin"));
        assert_eq!(out.len(), 2);
    }

    fn stage(name: &str, base: &str) -> StageSpec {
        StageSpec {
            name: name.into(),
            base: base.into(),
            args: Vec::<BuildArg>::new(),
            actions: vec![Action("true".into())],
            copies: vec![],
            outputs: vec![],
        }
    }

    fn entry_for(delta: ArtifactSet) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            Fingerprint::of_content(b"test"),
            delta,
            vec![],
        ))
    }

    #[test]
    fn materialize_layers_base_imports_delta() {
        let mut compile = stage("compile", "rust:1.82");
        compile.outputs = vec!["target/app".into()];
        let mut package = stage("package", "debian:12");
        package.copies = vec![CopySpec {
            from: "compile".into(),
            pattern: "target/app".into(),
            dest: "usr/bin".into(),
        }];
        package.outputs = vec!["usr/bin/app".into(), "etc/banner".into()];

        let graph = BuildGraph::build(vec![compile, package]).unwrap();
        let mut composer = Composer::new(&graph, PatternPolicy::Fatal);

        for (id, _) in graph.externals() {
            composer.set_external(id, ArtifactSet::from_files([("etc/os-release", "base")]));
        }
        composer.set_entry(
            graph.lookup("compile").unwrap(),
            entry_for(ArtifactSet::from_files([("target/app", "ELF")])),
        );
        composer.set_entry(
            graph.lookup("package").unwrap(),
            entry_for(ArtifactSet::from_files([("etc/banner", "v1")])),
        );

        let out = composer.compose(graph.lookup("package").unwrap()).unwrap();
        assert_eq!(out.target, "package");
        assert_eq!(out.artifacts.get("usr/bin/app").unwrap().as_ref(), b"ELF");
        assert_eq!(out.artifacts.get("etc/banner").unwrap().as_ref(), b"v1");
        assert!(out.artifacts.contains("etc/os-release"));
        assert_eq!(out.outputs, vec!["usr/bin/app", "etc/banner"]);
    }

    #[test]
    fn empty_pattern_fatal_by_default() {
        let mut package = stage("package", "debian:12");
        package.copies = vec![CopySpec {
            from: "compile".into(),
            pattern: "missing/*".into(),
            dest: "out".into(),
        }];
        let graph = BuildGraph::build(vec![stage("compile", "rust:1.82"), package]).unwrap();

        let mut composer = Composer::new(&graph, PatternPolicy::Fatal);
        for (id, _) in graph.externals() {
            composer.set_external(id, ArtifactSet::new());
        }
        composer.set_entry(graph.lookup("compile").unwrap(), entry_for(ArtifactSet::new()));

        let err = composer
            .stage_input(graph.lookup("package").unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            StagecraftError::PatternMatch { stage, .. } if stage == "package"
        ));
    }

    #[test]
    fn empty_pattern_warn_copies_nothing() {
        let mut package = stage("package", "debian:12");
        package.copies = vec![CopySpec {
            from: "compile".into(),
            pattern: "missing/*".into(),
            dest: "out".into(),
        }];
        let graph = BuildGraph::build(vec![stage("compile", "rust:1.82"), package]).unwrap();

        let mut composer = Composer::new(&graph, PatternPolicy::Warn);
        for (id, _) in graph.externals() {
            composer.set_external(id, ArtifactSet::new());
        }
        composer.set_entry(graph.lookup("compile").unwrap(), entry_for(ArtifactSet::new()));

        let input = composer
            .stage_input(graph.lookup("package").unwrap())
            .unwrap();
        assert!(input.is_empty());
    }

    #[test]
    fn later_copies_overwrite_earlier() {
        let mut package = stage("package", "debian:12");
        package.copies = vec![
            CopySpec {
                from: "a".into(),
                pattern: "bin/tool".into(),
                dest: "usr/bin".into(),
            },
            CopySpec {
                from: "b".into(),
                pattern: "bin/tool".into(),
                dest: "usr/bin".into(),
            },
        ];
        let graph = BuildGraph::build(vec![
            stage("a", "img"),
            stage("b", "img"),
            package,
        ])
        .unwrap();

        let mut composer = Composer::new(&graph, PatternPolicy::Fatal);
        for (id, _) in graph.externals() {
            composer.set_external(id, ArtifactSet::new());
        }
        composer.set_entry(
            graph.lookup("a").unwrap(),
            entry_for(ArtifactSet::from_files([("bin/tool", "from-a")])),
        );
        composer.set_entry(
            graph.lookup("b").unwrap(),
            entry_for(ArtifactSet::from_files([("bin/tool", "from-b")])),
        );
        composer.set_entry(graph.lookup("package").unwrap(), entry_for(ArtifactSet::new()));

        let input = composer
            .stage_input(graph.lookup("package").unwrap())
            .unwrap();
        assert_eq!(input.get("usr/bin/tool").unwrap().as_ref(), b"from-b");
    }
}
