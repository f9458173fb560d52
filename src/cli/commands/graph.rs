//! The graph command: print the resolved DAG

use console::style;

use crate::cli::args::GraphArgs;
use crate::error::StagecraftResult;
use crate::graph::{BuildGraph, StageDocument};

/// Print every declared stage with its edges
pub async fn graph(args: GraphArgs) -> StagecraftResult<()> {
    let document = StageDocument::load(&args.file).await?;
    let graph = BuildGraph::build(document.stages)?;

    for id in 0..graph.len() {
        let Some(spec) = graph.stage(id) else {
            continue;
        };
        println!("{}", style(&spec.name).bold());
        println!("  base: {}", spec.base);
        for copy in &spec.copies {
            println!("  copy: {} ({} -> {})", copy.from, copy.pattern, copy.dest);
        }
        let dependents: Vec<&str> = graph
            .dependents(id)
            .iter()
            .map(|&d| graph.node(d).name())
            .collect();
        if !dependents.is_empty() {
            println!("  needed by: {}", dependents.join(", "));
        }
    }

    let externals: Vec<&str> = graph.externals().map(|(_, r)| r).collect();
    if !externals.is_empty() {
        println!("\n{}: {}", style("external references").dim(), externals.join(", "));
    }
    Ok(())
}
