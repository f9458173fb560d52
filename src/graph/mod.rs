//! Stage declarations and dependency graph construction

pub mod dag;
pub mod spec;

pub use dag::{BuildGraph, Node, NodeId};
pub use spec::{parse_arg_overrides, Action, ArgOverrides, BuildArg, CopySpec, StageDocument, StageSpec};
