//! Merge settings and recipes.
//!
//! A recipe names the checkpoints taking part in a merge, which weight keys
//! to merge, and the formula applied to every selected key. It is normally
//! loaded from YAML:
//!
//! ```yaml
//! checkpoints:
//!   base: models/base.safetensors
//!   tuned: models/tuned.safetensors
//!   original: models/original.safetensors
//! precision: float16
//! targets: [unet]
//! formula:
//!   op: train_diff
//!   alpha: 0.8
//!   sources:
//!     - { op: load, checkpoint: base }
//!     - { op: load, checkpoint: tuned }
//!     - { op: load, checkpoint: original }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{KeySelector, MergeError, MergeGraph, NodeId, OpKind, Params, Precision, Result};

/// Process-wide evaluation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSettings {
    /// Output precision of operators that compute in wide precision.
    #[serde(default = "default_precision")]
    pub precision: Precision,

    /// Worker threads for evaluating independent keys (`None`: rayon default).
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            precision: default_precision(),
            threads: None,
        }
    }
}

fn default_precision() -> Precision {
    Precision::F16
}

fn default_targets() -> Vec<String> {
    vec!["all".to_string()]
}

/// Complete merge recipe, typically loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecipe {
    /// Checkpoint id to safetensors path (file or shard directory).
    pub checkpoints: BTreeMap<String, PathBuf>,

    /// Checkpoint providing every key that is not merged.
    #[serde(default)]
    pub primary: Option<String>,

    /// Working precision (float32, float16, bfloat16).
    #[serde(default = "default_precision")]
    pub precision: Precision,

    /// Worker threads.
    #[serde(default)]
    pub threads: Option<usize>,

    /// Key selectors the formula applies to.
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,

    /// Key selectors removed from `targets`.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Formula evaluated for every selected key.
    pub formula: FormulaNode,

    /// Output file for the merged state.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Down-cast the saved state to float16.
    #[serde(default)]
    pub fp16: bool,
}

impl MergeRecipe {
    /// Load a recipe from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a recipe from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Check references, arities and parameters without touching any file.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoints.is_empty() {
            return Err(MergeError::InvalidConfig(
                "recipe lists no checkpoints".to_string(),
            ));
        }

        if let Some(primary) = &self.primary {
            if !self.checkpoints.contains_key(primary) {
                return Err(MergeError::unknown_checkpoint(primary.as_str()));
            }
        }

        for id in self.formula.checkpoints() {
            if !self.checkpoints.contains_key(id) {
                return Err(MergeError::unknown_checkpoint(id));
            }
        }

        if self.threads == Some(0) {
            return Err(MergeError::InvalidConfig(
                "threads must be at least 1".to_string(),
            ));
        }

        KeySelector::new(&self.targets)?;
        KeySelector::new(&self.exclude)?;

        // Arity and parameter checks happen while building nodes.
        self.formula.instantiate(&mut MergeGraph::new(), "")?;
        Ok(())
    }

    /// Checkpoint unselected keys are copied from.
    pub fn primary(&self) -> Result<&str> {
        self.primary
            .as_deref()
            .or_else(|| self.checkpoints.keys().next().map(String::as_str))
            .ok_or_else(|| MergeError::InvalidConfig("no primary checkpoint".to_string()))
    }

    /// Evaluation settings described by this recipe.
    pub fn settings(&self) -> MergeSettings {
        MergeSettings {
            precision: self.precision,
            threads: self.threads,
        }
    }
}

/// One operator of a recipe formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaNode {
    /// Operator.
    pub op: OpKind,

    /// Checkpoint id, for `load`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,

    /// Primary factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,

    /// Secondary factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta: Option<f32>,

    /// Sharpness factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f32>,

    /// Operand formulas, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<FormulaNode>,

    /// Keep this node's result in the session cache.
    #[serde(default)]
    pub cache: bool,
}

impl FormulaNode {
    /// Operator over `sources` with no parameters set.
    pub fn new(op: OpKind, sources: Vec<FormulaNode>) -> Self {
        Self {
            op,
            checkpoint: None,
            alpha: None,
            beta: None,
            gamma: None,
            sources,
            cache: false,
        }
    }

    /// Load from `checkpoint`.
    pub fn load(checkpoint: impl Into<String>) -> Self {
        Self {
            checkpoint: Some(checkpoint.into()),
            ..Self::new(OpKind::Load, Vec::new())
        }
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

    /// Enable caching for this node.
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Parameters handed to the graph builder.
    pub fn params(&self) -> Params {
        Params {
            checkpoint: self.checkpoint.clone(),
            alpha: self.alpha,
            beta: self.beta,
            gamma: self.gamma,
        }
    }

    /// Every checkpoint id referenced below this node.
    pub fn checkpoints(&self) -> BTreeSet<&str> {
        let mut ids = BTreeSet::new();
        self.collect_checkpoints(&mut ids);
        ids
    }

    fn collect_checkpoints<'a>(&'a self, ids: &mut BTreeSet<&'a str>) {
        if let Some(id) = &self.checkpoint {
            ids.insert(id.as_str());
        }
        for source in &self.sources {
            source.collect_checkpoints(ids);
        }
    }

    /// Add this formula for weight `key` to `graph`, returning its root.
    pub fn instantiate(&self, graph: &mut MergeGraph, key: &str) -> Result<NodeId> {
        let sources = self
            .sources
            .iter()
            .map(|source| source.instantiate(graph, key))
            .collect::<Result<Vec<_>>>()?;
        let id = graph.build_node(self.op, key, &sources, self.params())?;
        if self.cache {
            graph.enable_cache(id)?;
        }
        Ok(id)
    }
}
