//! Stage fingerprinting
//!
//! A fingerprint is an order-sensitive SHA-256 digest over everything that
//! determines a stage's result: the base fingerprint, resolved build-arg
//! values, substituted action contents, and the ordered copy-source
//! fingerprints with their patterns and destinations. Every field is
//! length-prefixed before hashing so adjacent fields cannot collide by
//! concatenation.
//!
//! Fingerprints are computed post-order over the DAG (dependencies before
//! dependents), so a stage's digest always incorporates already-computed
//! dependency digests. Identical inputs yield the identical digest across
//! processes and machines, which is what makes cross-invocation caching
//! safe.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{StagecraftError, StagecraftResult};
use crate::graph::{ArgOverrides, BuildGraph, NodeId, StageSpec};

/// Domain tag hashed ahead of every stage fingerprint
const FINGERPRINT_DOMAIN: &[u8] = b"stagecraft.fingerprint.v1";

/// An opaque, deterministic stage digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Wrap a raw digest
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest arbitrary content, for external leaf fingerprints
    pub fn of_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Parse the 64-char hex form produced by `Display`
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        <[u8; 32]>::try_from(bytes).ok().map(Self::from_bytes)
    }

    /// First 12 hex characters, for display and log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Resolve a stage's declared build arguments against caller overrides.
///
/// Overrides win over declared defaults; a declared argument with neither
/// is fatal for the stage.
pub fn resolve_args(
    spec: &StageSpec,
    overrides: &ArgOverrides,
) -> StagecraftResult<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();
    for arg in &spec.args {
        let value = overrides
            .get(&arg.name)
            .cloned()
            .or_else(|| arg.default.clone())
            .ok_or_else(|| StagecraftError::UnresolvedArgument {
                stage: spec.name.clone(),
                arg: arg.name.clone(),
            })?;
        resolved.insert(arg.name.clone(), value);
    }
    Ok(resolved)
}

/// Substitute `${name}` and `$name` placeholders for declared arguments.
///
/// Placeholders naming no declared argument are left verbatim: they may be
/// shell variables that only exist at action runtime, and the executor owns
/// those.
pub fn substitute(template: &str, args: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&(_, '{')) => {
                chars.next();
                let mut key = String::new();
                let mut closed = false;
                for (_, k) in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                match (closed, args.get(&key)) {
                    (true, Some(value)) => out.push_str(value),
                    _ => {
                        out.push_str("${");
                        out.push_str(&key);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            Some(&(_, k)) if k.is_ascii_alphanumeric() || k == '_' => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, k)) = chars.peek() {
                    if k.is_ascii_alphanumeric() || k == '_' {
                        end = j + k.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let key = &template[start..end];
                match args.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('$');
                        out.push_str(key);
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// A stage's fully substituted action contents
pub fn substituted_actions(
    spec: &StageSpec,
    overrides: &ArgOverrides,
) -> StagecraftResult<Vec<String>> {
    let args = resolve_args(spec, overrides)?;
    Ok(spec
        .actions
        .iter()
        .map(|action| substitute(action.as_str(), &args))
        .collect())
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Compute one stage's fingerprint from its already-known dependency
/// fingerprints
fn fingerprint_stage(
    spec: &StageSpec,
    base_fp: Fingerprint,
    copy_fps: &[Fingerprint],
    overrides: &ArgOverrides,
) -> StagecraftResult<Fingerprint> {
    let args = resolve_args(spec, overrides)?;

    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hash_field(&mut hasher, base_fp.as_bytes());

    hasher.update((args.len() as u64).to_le_bytes());
    for (name, value) in &args {
        hash_field(&mut hasher, name.as_bytes());
        hash_field(&mut hasher, value.as_bytes());
    }

    hasher.update((spec.actions.len() as u64).to_le_bytes());
    for action in &spec.actions {
        hash_field(&mut hasher, substitute(action.as_str(), &args).as_bytes());
    }

    hasher.update((spec.copies.len() as u64).to_le_bytes());
    for (copy, fp) in spec.copies.iter().zip(copy_fps) {
        hash_field(&mut hasher, fp.as_bytes());
        hash_field(&mut hasher, copy.pattern.as_bytes());
        hash_field(&mut hasher, copy.dest.as_bytes());
    }

    Ok(Fingerprint(hasher.finalize().into()))
}

/// Fingerprint one stage whose dependency fingerprints are already in
/// `known`. The scheduler uses this per stage so a resolution failure stays
/// scoped to the stage and its dependents instead of aborting the build.
pub fn stage_fingerprint(
    graph: &BuildGraph,
    id: NodeId,
    overrides: &ArgOverrides,
    known: &HashMap<NodeId, Fingerprint>,
) -> StagecraftResult<Fingerprint> {
    let spec = graph
        .stage(id)
        .ok_or_else(|| StagecraftError::internal("cannot fingerprint an external node"))?;

    let dep_fp = |name: &str| -> StagecraftResult<Fingerprint> {
        graph
            .lookup(name)
            .and_then(|dep| known.get(&dep).copied())
            .ok_or_else(|| {
                StagecraftError::internal(format!("dependency '{name}' fingerprinted out of order"))
            })
    };

    let base_fp = dep_fp(&spec.base)?;
    let copy_fps: Vec<Fingerprint> = spec
        .copies
        .iter()
        .map(|c| dep_fp(&c.from))
        .collect::<StagecraftResult<_>>()?;

    fingerprint_stage(spec, base_fp, &copy_fps, overrides)
}

/// Compute fingerprints for every node in `nodes`, dependencies first.
///
/// `external_fps` supplies the resolver-provided digests for external leaf
/// nodes; those are passed through into the result map unchanged.
pub fn compute_fingerprints(
    graph: &BuildGraph,
    nodes: &[NodeId],
    overrides: &ArgOverrides,
    external_fps: &HashMap<NodeId, Fingerprint>,
) -> StagecraftResult<HashMap<NodeId, Fingerprint>> {
    let mut fps: HashMap<NodeId, Fingerprint> = HashMap::with_capacity(nodes.len());

    for &id in &graph.topo_order(nodes) {
        if graph.is_external(id) {
            let fp = external_fps.get(&id).copied().ok_or_else(|| {
                StagecraftError::internal(format!(
                    "no resolved fingerprint for external '{}'",
                    graph.node(id).name()
                ))
            })?;
            fps.insert(id, fp);
            continue;
        }
        let fp = stage_fingerprint(graph, id, overrides, &fps)?;
        fps.insert(id, fp);
    }
    Ok(fps)
}
