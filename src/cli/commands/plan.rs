//! The plan command: dry-run fingerprinting without execution

use std::collections::HashMap;

use console::style;

use crate::cache::{disk::default_cache_dir, ArtifactCache, DiskCache};
use crate::cli::args::PlanArgs;
use crate::error::StagecraftResult;
use crate::executor::{ExternalResolver, IdentityResolver};
use crate::fingerprint::{compute_fingerprints, Fingerprint};
use crate::graph::{parse_arg_overrides, BuildGraph, NodeId, StageDocument};

/// Print the topological execution plan for the requested targets
pub async fn plan(args: PlanArgs) -> StagecraftResult<()> {
    let document = StageDocument::load(&args.file).await?;
    let overrides = parse_arg_overrides(&args.args)?;
    let targets = if args.target.is_empty() {
        document.targets.clone()
    } else {
        args.target.clone()
    };

    let graph = BuildGraph::build(document.stages)?;
    let reachable = graph.reachable(&targets)?;
    let order = graph.topo_order(&reachable);

    let resolver = IdentityResolver;
    let mut external_fps: HashMap<NodeId, Fingerprint> = HashMap::new();
    for (id, reference) in graph.externals() {
        if reachable.contains(&id) {
            external_fps.insert(id, resolver.resolve(reference).await?.fingerprint);
        }
    }
    let fps = compute_fingerprints(&graph, &reachable, &overrides, &external_fps)?;

    // Predict per-stage cache behavior against the same cache a build
    // would use. A prediction, not a promise: the cache can change
    // between plan and build.
    let cache = DiskCache::with_root(args.cache_dir.clone().unwrap_or_else(default_cache_dir));

    println!(
        "{} for {} ({} stages, {} externals)",
        style("Execution plan").bold(),
        targets.join(", "),
        order.iter().filter(|&&id| !graph.is_external(id)).count(),
        order.iter().filter(|&&id| graph.is_external(id)).count(),
    );
    for (position, &id) in order.iter().enumerate() {
        let fp = fps[&id].short();
        if graph.is_external(id) {
            println!(
                "{:>3}. {}  {}  {}",
                position + 1,
                fp,
                graph.node(id).name(),
                style("(external)").dim()
            );
        } else {
            let prediction = if cache.lookup(fps[&id]).await.is_some() {
                style("cached").cyan()
            } else {
                style("build").yellow()
            };
            let deps: Vec<&str> = graph
                .deps(id)
                .iter()
                .map(|&d| graph.node(d).name())
                .collect();
            println!(
                "{:>3}. {}  {:<6}  {}  {} {}",
                position + 1,
                fp,
                prediction,
                graph.node(id).name(),
                style("needs").dim(),
                deps.join(", ")
            );
        }
    }
    Ok(())
}
