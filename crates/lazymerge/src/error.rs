//! Error types for graph-based merging.

use thiserror::Error;

use crate::{Arity, OpKind};

/// Errors that can occur while building or evaluating a merge graph.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Wrong number of sources for an operator, rejected at construction.
    #[error("{kind} '{key}' expects {expected} source(s), got {actual}")]
    InvalidArity {
        /// Operator being built.
        kind: OpKind,
        /// Weight key of the node.
        key: String,
        /// Source counts the operator accepts.
        expected: Arity,
        /// Source count supplied.
        actual: usize,
    },

    /// Missing, unexpected or out-of-range operator parameter.
    #[error("Invalid parameter for {kind} '{key}': {reason}")]
    InvalidParameter {
        /// Operator being built.
        kind: OpKind,
        /// Weight key of the node.
        key: String,
        /// What is wrong with the parameter.
        reason: String,
    },

    /// A node id that does not belong to the graph.
    #[error("Unknown node id {0}")]
    UnknownNode(usize),

    /// Element-wise operands with different shapes.
    #[error("Shape mismatch in {kind} '{key}': {left:?} vs {right:?}")]
    ShapeMismatch {
        /// Weight key of the failing node.
        key: String,
        /// Operator of the failing node.
        kind: OpKind,
        /// Shape of the first operand.
        left: Vec<usize>,
        /// Shape of the offending operand.
        right: Vec<usize>,
    },

    /// Tensor not present in a checkpoint.
    #[error("Tensor '{key}' not found in checkpoint '{checkpoint}'")]
    KeyNotFound {
        /// Checkpoint id that was queried.
        checkpoint: String,
        /// Weight key that was requested.
        key: String,
    },

    /// Checkpoint id not registered.
    #[error("Checkpoint '{}' is not loaded{}", .checkpoint, requested_by(.key.as_deref()))]
    UnknownCheckpoint {
        /// Checkpoint id that was referenced.
        checkpoint: String,
        /// Weight key being resolved, when raised during evaluation.
        key: Option<String>,
    },

    /// Checkpoint loading error.
    #[error("Failed to load checkpoint: {0}")]
    ModelLoad(String),

    /// Invalid recipe or settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Target selector that does not compile.
    #[error("Invalid key selector: {0}")]
    InvalidSelector(#[from] regex::Error),

    /// Tensor data that does not fit its shape.
    #[error("Tensor layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl MergeError {
    /// Checkpoint id referenced outside of any evaluation.
    pub fn unknown_checkpoint(checkpoint: impl Into<String>) -> Self {
        Self::UnknownCheckpoint {
            checkpoint: checkpoint.into(),
            key: None,
        }
    }

    /// Attach a node's weight key to an error raised by a pure operator.
    pub(crate) fn at_key(self, node_key: &str) -> Self {
        match self {
            Self::InvalidArity {
                kind,
                key,
                expected,
                actual,
            } if key.is_empty() => Self::InvalidArity {
                kind,
                key: node_key.to_string(),
                expected,
                actual,
            },
            Self::ShapeMismatch {
                key,
                kind,
                left,
                right,
            } if key.is_empty() => Self::ShapeMismatch {
                key: node_key.to_string(),
                kind,
                left,
                right,
            },
            other => other,
        }
    }
}

fn requested_by(key: Option<&str>) -> String {
    key.map(|key| format!(" (resolving '{}')", key)).unwrap_or_default()
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
