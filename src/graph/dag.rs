//! Dependency graph construction
//!
//! Builds an explicit node-and-edge graph from stage declarations: one node
//! per declared stage, plus synthetic leaf nodes for external references
//! (bases or copy sources naming no declared stage). Edges run from a stage
//! to its base and to each copy source. Stages reference each other by name
//! before the graph is known, so resolution goes through an arena with a
//! name-to-index map rather than chasing names at execution time.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{StagecraftError, StagecraftResult};
use crate::graph::spec::StageSpec;

/// Index of a node in the graph arena
pub type NodeId = usize;

/// A node in the build graph
#[derive(Debug)]
pub enum Node {
    /// A declared stage
    Stage(StageSpec),

    /// An external reference (base image, prebuilt artifact source).
    /// Externals are leaves: no actions, no dependencies, fingerprint
    /// supplied by the external resolver.
    External { reference: String },
}

impl Node {
    /// Node name: stage name or external reference string
    pub fn name(&self) -> &str {
        match self {
            Node::Stage(spec) => &spec.name,
            Node::External { reference } => reference,
        }
    }
}

/// The build DAG: arena of nodes plus adjacency lists in both directions
#[derive(Debug)]
pub struct BuildGraph {
    nodes: Vec<Node>,
    name_index: HashMap<String, NodeId>,
    /// node -> nodes it depends on (base first, then copy sources, deduped)
    deps: Vec<Vec<NodeId>>,
    /// node -> nodes that depend on it
    dependents: Vec<Vec<NodeId>>,
}

impl BuildGraph {
    /// Build the graph from stage declarations.
    ///
    /// Fails with [`StagecraftError::DuplicateStage`] on a repeated name and
    /// [`StagecraftError::Cycle`] if the base/copy edges form a cycle. Both
    /// are fatal before any execution.
    pub fn build(stages: Vec<StageSpec>) -> StagecraftResult<Self> {
        let mut graph = Self {
            nodes: Vec::with_capacity(stages.len()),
            name_index: HashMap::new(),
            deps: Vec::new(),
            dependents: Vec::new(),
        };

        // Declared stages first so forward references resolve to stage nodes
        for spec in stages {
            if graph.name_index.contains_key(&spec.name) {
                return Err(StagecraftError::DuplicateStage(spec.name));
            }
            let id = graph.nodes.len();
            graph.name_index.insert(spec.name.clone(), id);
            graph.nodes.push(Node::Stage(spec));
            graph.deps.push(Vec::new());
            graph.dependents.push(Vec::new());
        }

        // Edges; undeclared references become external leaf nodes
        for id in 0..graph.nodes.len() {
            let (base, copy_froms) = match &graph.nodes[id] {
                Node::Stage(spec) => (
                    spec.base.clone(),
                    spec.copies.iter().map(|c| c.from.clone()).collect::<Vec<_>>(),
                ),
                Node::External { .. } => continue,
            };

            let base_id = graph.intern(&base);
            graph.add_edge(id, base_id);
            for from in copy_froms {
                let from_id = graph.intern(&from);
                graph.add_edge(id, from_id);
            }
        }

        graph.check_acyclic()?;
        debug!(
            nodes = graph.nodes.len(),
            externals = graph.externals().count(),
            "Build graph constructed"
        );
        Ok(graph)
    }

    /// Resolve a name to an existing node or create an external leaf for it
    fn intern(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.name_index.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.name_index.insert(name.to_string(), id);
        self.nodes.push(Node::External {
            reference: name.to_string(),
        });
        self.deps.push(Vec::new());
        self.dependents.push(Vec::new());
        id
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if !self.deps[from].contains(&to) {
            self.deps[from].push(to);
            self.dependents[to].push(from);
        }
    }

    /// Three-color DFS cycle check, reporting the cycle path on failure
    fn check_acyclic(&self) -> StagecraftResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let mut marks = vec![Mark::White; self.nodes.len()];

        // Iterative DFS; `work` holds the gray path plus a per-frame cursor
        // into the dependency list, so the cycle path falls out for free.
        for start in 0..self.nodes.len() {
            if marks[start] != Mark::White {
                continue;
            }
            let mut work: Vec<(NodeId, usize)> = vec![(start, 0)];
            marks[start] = Mark::Gray;

            while let Some(&(node, next_dep)) = work.last() {
                if next_dep < self.deps[node].len() {
                    if let Some(frame) = work.last_mut() {
                        frame.1 += 1;
                    }
                    let dep = self.deps[node][next_dep];
                    match marks[dep] {
                        Mark::White => {
                            marks[dep] = Mark::Gray;
                            work.push((dep, 0));
                        }
                        Mark::Gray => {
                            // Cycle: slice the gray path from the repeat point
                            let pos = work.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                            let mut path: Vec<String> = work[pos..]
                                .iter()
                                .map(|&(n, _)| self.nodes[n].name().to_string())
                                .collect();
                            path.push(self.nodes[dep].name().to_string());
                            return Err(StagecraftError::Cycle { path });
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[node] = Mark::Black;
                    work.pop();
                }
            }
        }
        Ok(())
    }

    /// Node count, stages and externals included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node id by name
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    /// Node by id
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Stage spec for a node, `None` for externals
    pub fn stage(&self, id: NodeId) -> Option<&StageSpec> {
        match &self.nodes[id] {
            Node::Stage(spec) => Some(spec),
            Node::External { .. } => None,
        }
    }

    /// Whether a node is an external leaf
    pub fn is_external(&self, id: NodeId) -> bool {
        matches!(self.nodes[id], Node::External { .. })
    }

    /// All external leaf nodes as `(id, reference)`
    pub fn externals(&self) -> impl Iterator<Item = (NodeId, &str)> {
        self.nodes.iter().enumerate().filter_map(|(id, node)| match node {
            Node::External { reference } => Some((id, reference.as_str())),
            Node::Stage(_) => None,
        })
    }

    /// Direct dependencies of a node (base first, then copy sources)
    pub fn deps(&self, id: NodeId) -> &[NodeId] {
        &self.deps[id]
    }

    /// Direct dependents of a node
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id]
    }

    /// Transitive dependents of a node, excluding the node itself
    pub fn transitive_dependents(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = vec![id];
        let mut out = Vec::new();
        while let Some(n) = queue.pop() {
            for &dep in &self.dependents[n] {
                if !seen[dep] {
                    seen[dep] = true;
                    out.push(dep);
                    queue.push(dep);
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Nodes reachable from the targets via base and copy edges, targets
    /// included. Fails with [`StagecraftError::MissingTarget`] if a target
    /// is not a declared stage.
    pub fn reachable(&self, targets: &[String]) -> StagecraftResult<Vec<NodeId>> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = Vec::new();

        for target in targets {
            let id = self
                .lookup(target)
                .filter(|&id| !self.is_external(id))
                .ok_or_else(|| StagecraftError::MissingTarget(target.clone()))?;
            if !seen[id] {
                seen[id] = true;
                queue.push(id);
            }
        }

        let mut out = Vec::new();
        while let Some(n) = queue.pop() {
            out.push(n);
            for &dep in &self.deps[n] {
                if !seen[dep] {
                    seen[dep] = true;
                    queue.push(dep);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Topological order of the given nodes (dependencies first), computed
    /// with Kahn's algorithm over in-degrees restricted to the set. The
    /// ready queue is FIFO in node-index order, which keeps the order
    /// deterministic for a given document.
    pub fn topo_order(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        let in_set = {
            let mut v = vec![false; self.nodes.len()];
            for &n in nodes {
                v[n] = true;
            }
            v
        };

        let mut in_degree = vec![0usize; self.nodes.len()];
        for &n in nodes {
            in_degree[n] = self.deps[n].iter().filter(|&&d| in_set[d]).count();
        }

        let mut ready: std::collections::VecDeque<NodeId> =
            nodes.iter().copied().filter(|&n| in_degree[n] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(n) = ready.pop_front() {
            order.push(n);
            for &dep in &self.dependents[n] {
                if in_set[dep] {
                    in_degree[dep] -= 1;
                    if in_degree[dep] == 0 {
                        ready.push_back(dep);
                    }
                }
            }
        }

        // Acyclicity is checked at construction, so every node drains
        debug_assert_eq!(order.len(), nodes.len());
        order
    }
}
