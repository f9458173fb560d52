//! The build command

use std::path::Path;
use std::sync::Arc;

use console::style;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::artifact::format_bytes;
use crate::cache::{disk::default_cache_dir, DiskCache};
use crate::cli::args::BuildArgs;
use crate::compose::ComposedOutput;
use crate::config::Config;
use crate::error::{StagecraftError, StagecraftResult};
use crate::executor::{IdentityResolver, LocalShellExecutor};
use crate::graph::{parse_arg_overrides, BuildGraph, StageDocument};
use crate::scheduler::Scheduler;

/// Run a build end to end: document -> graph -> scheduler -> composed
/// outputs on disk
pub async fn build(args: BuildArgs, config: Config) -> StagecraftResult<()> {
    let document = StageDocument::load(&args.file).await?;
    let overrides = parse_arg_overrides(&args.args)?;
    let targets = pick_targets(&args.target, &document)?;
    let options = config.into_options(args.jobs);

    let graph = BuildGraph::build(document.stages)?;

    // The cache outlives the process: entries land on disk under the user
    // cache dir unless --cache-dir points elsewhere
    let cache_dir = args.cache_dir.clone().unwrap_or_else(default_cache_dir);
    let scheduler = Scheduler::new(
        Arc::new(DiskCache::with_root(cache_dir)),
        Arc::new(LocalShellExecutor::new()),
        Arc::new(IdentityResolver),
        options,
    );

    // Ctrl-C stops in-flight stages at the next action boundary
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling build");
            let _ = cancel_tx.send(true);
        }
    });

    let outcome = scheduler.run(&graph, &targets, &overrides, cancel_rx).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        print!("{}", outcome.report.render());
    }

    if let Some(output_dir) = &args.output {
        for composed in &outcome.outputs {
            write_output(output_dir, composed).await?;
        }
    }

    if !outcome.report.succeeded() {
        let failed = outcome
            .report
            .first_failure()
            .map(|s| s.stage.clone())
            .unwrap_or_else(|| "build cancelled".to_string());
        return Err(StagecraftError::User(format!(
            "build failed: {failed}"
        )));
    }
    Ok(())
}

/// CLI targets win; otherwise the document's declared targets
fn pick_targets(flag: &[String], document: &StageDocument) -> StagecraftResult<Vec<String>> {
    let targets = if flag.is_empty() {
        document.targets.clone()
    } else {
        flag.to_vec()
    };
    if targets.is_empty() {
        return Err(StagecraftError::User(
            "no build targets: pass --target or declare \"targets\" in the document".to_string(),
        ));
    }
    Ok(targets)
}

/// Materialize a composed target under `<dir>/<target>/`
async fn write_output(dir: &Path, composed: &ComposedOutput) -> StagecraftResult<()> {
    let root = dir.join(&composed.target);
    for (path, contents) in composed.artifacts.iter() {
        let file = root.join(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StagecraftError::io(format!("creating {}", parent.display()), e))?;
        }
        tokio::fs::write(&file, contents)
            .await
            .map_err(|e| StagecraftError::io(format!("writing {}", file.display()), e))?;
    }
    debug!(target = %composed.target, files = composed.artifacts.len(), "output written");
    println!(
        "{} {} ({} files, {})",
        style("Wrote").green().bold(),
        root.display(),
        composed.artifacts.len(),
        format_bytes(composed.artifacts.size_bytes())
    );
    Ok(())
}
