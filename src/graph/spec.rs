//! Stage declarations
//!
//! The data model for a pre-parsed stage document: named stages with a
//! base, scoped build arguments, opaque actions, and cross-stage copies.
//! Surface-syntax parsing happens upstream; this module only deserializes
//! the structured form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{StagecraftError, StagecraftResult};

/// A build argument declared by a stage, optionally with a default value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArg {
    /// Argument name as it appears in `${name}` placeholders
    pub name: String,

    /// Default used when the caller supplies no override
    #[serde(default)]
    pub default: Option<String>,
}

/// An opaque command unit. Stagecraft never interprets the content; it only
/// substitutes build-arg placeholders and hashes the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(pub String);

impl Action {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A cross-stage artifact import: paths matching `pattern` in stage `from`
/// are layered under `dest` before this stage's actions run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySpec {
    /// Source stage name, or an external reference if undeclared
    pub from: String,

    /// Path pattern resolved against the source's materialized tree
    pub pattern: String,

    /// Destination directory in this stage's tree
    pub dest: String,
}

/// A named build stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique name within the graph
    pub name: String,

    /// Another stage's name, or an external base image reference
    pub base: String,

    /// Build arguments scoped to this stage, in declaration order
    #[serde(default)]
    pub args: Vec<BuildArg>,

    /// Ordered command units
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Ordered cross-stage imports
    #[serde(default)]
    pub copies: Vec<CopySpec>,

    /// Declared output paths
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl StageSpec {
    /// Look up a declared argument by name
    pub fn arg(&self, name: &str) -> Option<&BuildArg> {
        self.args.iter().find(|a| a.name == name)
    }
}

/// The structured stage document consumed by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDocument {
    /// All declared stages, in document order
    pub stages: Vec<StageSpec>,

    /// Default build targets when the caller names none
    #[serde(default)]
    pub targets: Vec<String>,
}

impl StageDocument {
    /// Parse a document from JSON text
    pub fn parse(content: &str) -> StagecraftResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a document from a JSON file
    pub async fn load(path: &Path) -> StagecraftResult<Self> {
        if !path.exists() {
            return Err(StagecraftError::DocumentNotFound(path.to_path_buf()));
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StagecraftError::io(format!("reading {}", path.display()), e))?;

        serde_json::from_str(&content).map_err(|e| StagecraftError::DocumentInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Caller-supplied build argument overrides, name → value
pub type ArgOverrides = BTreeMap<String, String>;

/// Parse repeated `NAME=VALUE` override flags into a map
pub fn parse_arg_overrides(pairs: &[String]) -> StagecraftResult<ArgOverrides> {
    let mut overrides = ArgOverrides::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| StagecraftError::ArgOverrideInvalid(pair.clone()))?;
        if name.is_empty() {
            return Err(StagecraftError::ArgOverrideInvalid(pair.clone()));
        }
        overrides.insert(name.to_string(), value.to_string());
    }
    Ok(overrides)
}
