//! Error types for Stagecraft
//!
//! All modules use `StagecraftResult<T>` as their return type.
//!
//! The taxonomy mirrors how failures propagate through a build:
//! structural errors (bad graph) abort before any execution, resolution
//! errors (unresolved args, empty copy patterns) kill a stage and its
//! dependents, execution errors kill the transitive dependents only, and
//! cache storage errors degrade to a cache miss.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Stagecraft operations
pub type StagecraftResult<T> = Result<T, StagecraftError>;

/// All errors that can occur in Stagecraft
#[derive(Error, Debug)]
pub enum StagecraftError {
    // Structural errors — detected at graph construction, before any execution
    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("Stage '{stage}' references undefined stage '{reference}'")]
    UndefinedReference { stage: String, reference: String },

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Requested target '{0}' is not a declared stage")]
    MissingTarget(String),

    // Resolution errors — per-stage, at fingerprinting or composition time
    #[error("Stage '{stage}': build argument '{arg}' has no value and no default")]
    UnresolvedArgument { stage: String, arg: String },

    #[error("Stage '{stage}': copy pattern '{pattern}' from '{source_stage}' matched nothing")]
    PatternMatch {
        stage: String,
        source_stage: String,
        pattern: String,
    },

    #[error("External reference '{reference}' could not be resolved: {reason}")]
    ExternalResolve { reference: String, reason: String },

    // Execution errors — fatal for the stage and its transitive dependents
    #[error("Stage '{stage}' failed at action {action_index}: {detail}")]
    ActionFailed {
        stage: String,
        action_index: usize,
        detail: String,
    },

    #[error("Build cancelled")]
    Cancelled,

    // Cache errors — treated as a miss by the scheduler, never fatal
    #[error("Cache store failed for {fingerprint}: {reason}")]
    CacheStore { fingerprint: String, reason: String },

    // Document / configuration errors
    #[error("Invalid stage document {path}: {reason}")]
    DocumentInvalid { path: PathBuf, reason: String },

    #[error("Stage document not found: {0}")]
    DocumentNotFound(PathBuf),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid build argument override '{0}': expected NAME=VALUE")]
    ArgOverrideInvalid(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StagecraftError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error aborts the whole build before execution starts
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStage(_)
                | Self::UndefinedReference { .. }
                | Self::Cycle { .. }
                | Self::MissingTarget(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnresolvedArgument { .. } => Some("Supply a value with --arg NAME=VALUE"),
            Self::MissingTarget(_) => Some("Run: stagecraft graph to list declared stages"),
            Self::DocumentNotFound(_) => Some("Pass the stage document with -f <path>"),
            _ => None,
        }
    }
}
