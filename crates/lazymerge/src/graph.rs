//! Operation nodes and the merge graph arena.
//!
//! A [`MergeGraph`] owns every node of a merge request. Nodes refer to their
//! sources by [`NodeId`], so a subgraph can feed any number of parents and a
//! node can only point at nodes that already exist, which rules out cycles.
//!
//! Each node carries a [`Fingerprint`]: a SHA3-256 digest over its operator,
//! weight key, parameters and the fingerprints of its sources. The digest is
//! computed once at construction and never depends on ids or addresses, so two
//! graphs built independently (in the same process or not) agree on the
//! fingerprint of every structurally equal node.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tracing::trace;

use crate::{MergeError, Result};

/// Domain tag mixed into every node digest.
const FINGERPRINT_DOMAIN: &[u8] = b"lazymerge/node/v1";

/// Operator kinds understood by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Resolve a tensor from a checkpoint.
    Load,
    /// Scale by `alpha`.
    Multiply,
    /// Element-wise sum.
    Add,
    /// Element-wise difference.
    Sub,
    /// Median then Gaussian smoothing.
    Smooth,
    /// Trained-difference extraction.
    #[serde(alias = "traindiff")]
    TrainDiff,
    /// Cosine-similarity guided blend.
    #[serde(alias = "extract")]
    Similarity,
}

impl OpKind {
    /// Source counts accepted by this operator.
    pub fn arity(self) -> Arity {
        match self {
            Self::Load => Arity::Exact(0),
            Self::Multiply | Self::Smooth => Arity::Exact(1),
            Self::Add | Self::Sub => Arity::Exact(2),
            Self::TrainDiff => Arity::Exact(3),
            Self::Similarity => Arity::Between(2, 3),
        }
    }

    /// Lowercase name, as used in recipes.
    pub fn name(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Multiply => "multiply",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Smooth => "smooth",
            Self::TrainDiff => "train_diff",
            Self::Similarity => "similarity",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Load => 0,
            Self::Multiply => 1,
            Self::Add => 2,
            Self::Sub => 3,
            Self::Smooth => 4,
            Self::TrainDiff => 5,
            Self::Similarity => 6,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of sources an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly this many.
    Exact(usize),
    /// Inclusive range.
    Between(usize, usize),
}

impl Arity {
    /// Whether `count` sources are acceptable.
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Self::Exact(n) => count == n,
            Self::Between(lo, hi) => (lo..=hi).contains(&count),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "{}", n),
            Self::Between(lo, hi) => write!(f, "{} to {}", lo, hi),
        }
    }
}

/// Loosely typed parameters handed to [`MergeGraph::build_node`].
///
/// Which fields are required depends on the operator; anything an operator
/// does not use must be left unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    /// Checkpoint id for `load`.
    pub checkpoint: Option<String>,
    /// Primary scale or interpolation factor.
    pub alpha: Option<f32>,
    /// Secondary factor.
    pub beta: Option<f32>,
    /// Sharpness factor.
    pub gamma: Option<f32>,
}

impl Params {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the checkpoint id.
    pub fn checkpoint(mut self, id: impl Into<String>) -> Self {
        self.checkpoint = Some(id.into());
        self
    }

    /// Set alpha.
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = Some(alpha);
        self
    }

    /// Set beta.
    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = Some(beta);
        self
    }

    /// Set gamma.
    pub fn gamma(mut self, gamma: f32) -> Self {
        self.gamma = Some(gamma);
        self
    }
}

/// A validated operator together with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Resolve the node's key from `checkpoint`.
    Load {
        /// Checkpoint id in the registry.
        checkpoint: String,
    },
    /// `source * alpha`.
    Multiply {
        /// Scale factor.
        alpha: f32,
    },
    /// `a + b`.
    Add,
    /// `a - b`.
    Sub,
    /// Median then Gaussian filtered source.
    Smooth,
    /// `a + trained_difference(a, b, c) * alpha`.
    TrainDiff {
        /// Scale applied to the cached difference.
        alpha: f32,
    },
    /// Similarity-gated blend of `a` and `b`, optionally relative to a base.
    Similarity {
        /// Interpolation from `a` (0) to `b` (1).
        alpha: f32,
        /// Interpolation of the gate from `d` (0) to `1 - d` (1).
        beta: f32,
        /// Gate sharpness.
        gamma: f32,
    },
}

impl Operation {
    /// Operator kind.
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Load { .. } => OpKind::Load,
            Self::Multiply { .. } => OpKind::Multiply,
            Self::Add => OpKind::Add,
            Self::Sub => OpKind::Sub,
            Self::Smooth => OpKind::Smooth,
            Self::TrainDiff { .. } => OpKind::TrainDiff,
            Self::Similarity { .. } => OpKind::Similarity,
        }
    }

    /// Alpha parameter, if the operator has one.
    pub fn alpha(&self) -> Option<f32> {
        match self {
            Self::Multiply { alpha } | Self::TrainDiff { alpha } => Some(*alpha),
            Self::Similarity { alpha, .. } => Some(*alpha),
            _ => None,
        }
    }

    /// Beta parameter, if the operator has one.
    pub fn beta(&self) -> Option<f32> {
        match self {
            Self::Similarity { beta, .. } => Some(*beta),
            _ => None,
        }
    }

    /// Gamma parameter, if the operator has one.
    pub fn gamma(&self) -> Option<f32> {
        match self {
            Self::Similarity { gamma, .. } => Some(*gamma),
            _ => None,
        }
    }

    fn checkpoint(&self) -> Option<&str> {
        match self {
            Self::Load { checkpoint } => Some(checkpoint),
            _ => None,
        }
    }

    /// Validate loose parameters for `kind`.
    pub fn from_params(kind: OpKind, key: &str, params: Params) -> Result<Self> {
        let invalid = |reason: String| MergeError::InvalidParameter {
            kind,
            key: key.to_string(),
            reason,
        };
        let Params {
            checkpoint,
            alpha,
            beta,
            gamma,
        } = params;

        for (name, value) in [("alpha", alpha), ("beta", beta), ("gamma", gamma)] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(invalid(format!("{} must be finite, got {}", name, v)));
                }
            }
        }

        let unexpected = |name: &str, present: bool| -> Result<()> {
            if present {
                Err(invalid(format!("{} does not take {}", kind, name)))
            } else {
                Ok(())
            }
        };
        let required =
            |name: &str, value: Option<f32>| value.ok_or_else(|| invalid(format!("{} is required", name)));

        if kind != OpKind::Load {
            unexpected("a checkpoint", checkpoint.is_some())?;
        }

        match kind {
            OpKind::Load => {
                unexpected("alpha", alpha.is_some())?;
                unexpected("beta", beta.is_some())?;
                unexpected("gamma", gamma.is_some())?;
                match checkpoint {
                    Some(checkpoint) if !checkpoint.is_empty() => Ok(Self::Load { checkpoint }),
                    _ => Err(invalid("checkpoint id is required".to_string())),
                }
            }
            OpKind::Add | OpKind::Sub | OpKind::Smooth => {
                unexpected("alpha", alpha.is_some())?;
                unexpected("beta", beta.is_some())?;
                unexpected("gamma", gamma.is_some())?;
                Ok(match kind {
                    OpKind::Add => Self::Add,
                    OpKind::Sub => Self::Sub,
                    _ => Self::Smooth,
                })
            }
            OpKind::Multiply | OpKind::TrainDiff => {
                unexpected("beta", beta.is_some())?;
                unexpected("gamma", gamma.is_some())?;
                let alpha = required("alpha", alpha)?;
                Ok(if kind == OpKind::Multiply {
                    Self::Multiply { alpha }
                } else {
                    Self::TrainDiff { alpha }
                })
            }
            OpKind::Similarity => {
                let alpha = required("alpha", alpha)?;
                let beta = beta.unwrap_or(0.0);
                let gamma = gamma.unwrap_or(0.0);
                if !(0.0..=1.0).contains(&alpha) {
                    return Err(invalid(format!("alpha must be in [0, 1], got {}", alpha)));
                }
                if !(0.0..=1.0).contains(&beta) {
                    return Err(invalid(format!("beta must be in [0, 1], got {}", beta)));
                }
                if gamma < 0.0 {
                    return Err(invalid(format!("gamma must be >= 0, got {}", gamma)));
                }
                Ok(Self::Similarity { alpha, beta, gamma })
            }
        }
    }
}

/// Index of a node inside its [`MergeGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Position in the arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable structural digest of a node and everything it depends on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// One step of a merge formula.
#[derive(Debug, Clone)]
pub struct Node {
    op: Operation,
    key: String,
    sources: Vec<NodeId>,
    fingerprint: Fingerprint,
    cached: bool,
}

impl Node {
    /// Operator and parameters.
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Operator kind.
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    /// Weight key this node produces.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Source nodes in evaluation order.
    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    /// Structural fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Whether evaluation goes through the result cache.
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

/// Arena of operation nodes forming a DAG.
#[derive(Debug, Clone, Default)]
pub struct MergeGraph {
    nodes: Vec<Node>,
}

impl MergeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or(MergeError::UnknownNode(id.0))
    }

    /// Fingerprint of a node.
    pub fn fingerprint(&self, id: NodeId) -> Result<Fingerprint> {
        Ok(self.node(id)?.fingerprint)
    }

    /// Add a node of `kind` producing `key` from `sources`.
    ///
    /// Fails with [`MergeError::InvalidArity`] when the source count does not
    /// fit the operator and [`MergeError::InvalidParameter`] when `params` is
    /// incomplete or out of range.
    pub fn build_node(
        &mut self,
        kind: OpKind,
        key: impl Into<String>,
        sources: &[NodeId],
        params: Params,
    ) -> Result<NodeId> {
        let key = key.into();
        let expected = kind.arity();
        if !expected.accepts(sources.len()) {
            return Err(MergeError::InvalidArity {
                kind,
                key,
                expected,
                actual: sources.len(),
            });
        }
        let op = Operation::from_params(kind, &key, params)?;
        self.push(op, key, sources)
    }

    fn push(&mut self, op: Operation, key: String, sources: &[NodeId]) -> Result<NodeId> {
        let source_prints = sources
            .iter()
            .map(|&id| self.fingerprint(id))
            .collect::<Result<Vec<_>>>()?;
        let fingerprint = digest(&op, &key, &source_prints, AlphaMode::Include);
        let id = NodeId(self.nodes.len());
        trace!("node {} {} '{}' -> {}", id, op.kind(), key, fingerprint);
        self.nodes.push(Node {
            op,
            key,
            sources: sources.to_vec(),
            fingerprint,
            cached: false,
        });
        Ok(id)
    }

    /// Route evaluation of `id` through the result cache.
    pub fn enable_cache(&mut self, id: NodeId) -> Result<NodeId> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or(MergeError::UnknownNode(id.0))?;
        node.cached = true;
        Ok(id)
    }

    /// Load `key` from `checkpoint`.
    pub fn load(&mut self, key: impl Into<String>, checkpoint: impl Into<String>) -> Result<NodeId> {
        self.build_node(OpKind::Load, key, &[], Params::new().checkpoint(checkpoint))
    }

    /// `source * alpha`.
    pub fn multiply(&mut self, key: impl Into<String>, source: NodeId, alpha: f32) -> Result<NodeId> {
        self.build_node(OpKind::Multiply, key, &[source], Params::new().alpha(alpha))
    }

    /// `a + b`.
    pub fn add(&mut self, key: impl Into<String>, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.build_node(OpKind::Add, key, &[a, b], Params::new())
    }

    /// `a - b`.
    pub fn sub(&mut self, key: impl Into<String>, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.build_node(OpKind::Sub, key, &[a, b], Params::new())
    }

    /// Smoothed `source`.
    pub fn smooth(&mut self, key: impl Into<String>, source: NodeId) -> Result<NodeId> {
        self.build_node(OpKind::Smooth, key, &[source], Params::new())
    }

    /// Trained difference of `b` relative to `c`, applied to `a`.
    pub fn train_diff(
        &mut self,
        key: impl Into<String>,
        a: NodeId,
        b: NodeId,
        c: NodeId,
        alpha: f32,
    ) -> Result<NodeId> {
        self.build_node(OpKind::TrainDiff, key, &[a, b, c], Params::new().alpha(alpha))
    }

    /// Similarity blend of `a` and `b`, relative to `base` when given.
    #[allow(clippy::too_many_arguments)]
    pub fn similarity(
        &mut self,
        key: impl Into<String>,
        base: Option<NodeId>,
        a: NodeId,
        b: NodeId,
        alpha: f32,
        beta: f32,
        gamma: f32,
    ) -> Result<NodeId> {
        let sources: Vec<NodeId> = base.into_iter().chain([a, b]).collect();
        self.build_node(
            OpKind::Similarity,
            key,
            &sources,
            Params::new().alpha(alpha).beta(beta).gamma(gamma),
        )
    }

    /// Fingerprint of `node` with its alpha parameter removed.
    ///
    /// Used to cache the part of an operator that does not depend on alpha.
    pub(crate) fn fingerprint_without_alpha(&self, node: &Node) -> Result<Fingerprint> {
        let source_prints = node
            .sources
            .iter()
            .map(|&id| self.fingerprint(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(digest(&node.op, &node.key, &source_prints, AlphaMode::Strip))
    }

    /// Recursive field-by-field equality of `a` in this graph and `b` in `other`.
    ///
    /// Pairs already found equal are not walked again, so shared subgraphs
    /// are compared once.
    pub fn same_structure(&self, a: NodeId, other: &MergeGraph, b: NodeId) -> bool {
        self.same_structure_memo(a, other, b, &mut HashSet::new())
    }

    fn same_structure_memo(
        &self,
        a: NodeId,
        other: &MergeGraph,
        b: NodeId,
        equal: &mut HashSet<(NodeId, NodeId)>,
    ) -> bool {
        if equal.contains(&(a, b)) {
            return true;
        }
        let (Ok(left), Ok(right)) = (self.node(a), other.node(b)) else {
            return false;
        };
        let same = left.op == right.op
            && left.key == right.key
            && left.sources.len() == right.sources.len()
            && left
                .sources
                .iter()
                .zip(&right.sources)
                .all(|(&x, &y)| self.same_structure_memo(x, other, y, equal));
        if same {
            equal.insert((a, b));
        }
        same
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AlphaMode {
    Include,
    Strip,
}

fn digest(op: &Operation, key: &str, sources: &[Fingerprint], alpha: AlphaMode) -> Fingerprint {
    let mut hasher = Sha3_256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update([op.kind().tag()]);
    write_str(&mut hasher, key);
    write_opt_str(&mut hasher, op.checkpoint());
    let alpha = match alpha {
        AlphaMode::Include => op.alpha(),
        AlphaMode::Strip => None,
    };
    write_param(&mut hasher, alpha);
    write_param(&mut hasher, op.beta());
    write_param(&mut hasher, op.gamma());
    hasher.update((sources.len() as u64).to_le_bytes());
    for source in sources {
        hasher.update(source.0);
    }
    let result = hasher.finalize();

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    Fingerprint(bytes)
}

fn write_str(hasher: &mut Sha3_256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn write_opt_str(hasher: &mut Sha3_256, s: Option<&str>) {
    match s {
        Some(s) => {
            hasher.update([1u8]);
            write_str(hasher, s);
        }
        None => hasher.update([0u8]),
    }
}

fn write_param(hasher: &mut Sha3_256, value: Option<f32>) {
    match value {
        Some(v) => {
            // -0.0 and 0.0 compare equal, so they must hash equal
            let v = if v == 0.0 { 0.0 } else { v };
            hasher.update([1u8]);
            hasher.update(v.to_bits().to_le_bytes());
        }
        None => hasher.update([0u8]),
    }
}
