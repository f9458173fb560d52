//! Stagecraft - Cache-Aware Build Graph Evaluator
//!
//! Turns declarative multi-stage build definitions into a minimal,
//! cache-aware execution plan: infers the dependency DAG from cross-stage
//! references, fingerprints each stage, runs independent branches in
//! parallel, and composes final artifact sets from selected stages.

pub mod artifact;
pub mod cache;
pub mod cli;
pub mod compose;
pub mod config;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod report;
pub mod scheduler;

pub use error::{StagecraftError, StagecraftResult};
