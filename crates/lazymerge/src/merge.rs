//! Merge orchestration.
//!
//! A [`MergePlan`] holds one graph with a root per weight key. Selected keys
//! get the recipe formula, every other key is copied from the primary
//! checkpoint. [`merge_state`] evaluates the roots in parallel against a
//! shared [`MergeContext`], so identical subgraphs across keys hit the same
//! cache entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    evaluate, CheckpointSet, FormulaNode, KeySelector, MergeContext, MergeError, MergeGraph,
    MergeRecipe, NodeId, OpKind, Precision, Result, SafetensorsCheckpoint, StateWriter, Tensor,
};

/// Merged weights by key.
pub type StateDict = BTreeMap<String, Tensor>;

/// Fallback file stem when no name can be derived from the recipe.
pub const DEFAULT_OUTPUT: &str = "merged";

/// Characters kept from each checkpoint stem in a derived name.
const ABRIDGED_STEM_LEN: usize = 10;

/// Checkpoints contributing to a derived name.
const NAMED_CHECKPOINTS: usize = 3;

/// Keys to evaluate and the graph they live in.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    graph: MergeGraph,
    roots: Vec<(String, NodeId)>,
    merged: usize,
}

impl MergePlan {
    /// Plan `recipe` over `keys`.
    pub fn build<I, S>(recipe: &MergeRecipe, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        recipe.validate()?;
        let targets = KeySelector::new(&recipe.targets)?;
        let exclude = KeySelector::new(&recipe.exclude)?;
        let primary = recipe.primary()?;

        let mut plan = Self::default();
        for key in keys {
            let key = key.into();
            let root = if targets.matches(&key) && !exclude.matches(&key) {
                plan.merged += 1;
                recipe.formula.instantiate(&mut plan.graph, &key)?
            } else {
                plan.graph.load(key.as_str(), primary)?
            };
            plan.roots.push((key, root));
        }

        info!(
            "Planned {} keys: {} merged, {} copied from '{}' ({} nodes)",
            plan.roots.len(),
            plan.merged,
            plan.roots.len() - plan.merged,
            primary,
            plan.graph.len()
        );
        Ok(plan)
    }

    /// Plan from an already built graph.
    pub fn from_parts(graph: MergeGraph, roots: Vec<(String, NodeId)>) -> Result<Self> {
        for (_, root) in &roots {
            graph.node(*root)?;
        }
        let merged = roots
            .iter()
            .filter(|(_, root)| {
                graph
                    .node(*root)
                    .map(|node| node.kind() != OpKind::Load)
                    .unwrap_or(false)
            })
            .count();
        Ok(Self {
            graph,
            roots,
            merged,
        })
    }

    /// The graph holding every root.
    pub fn graph(&self) -> &MergeGraph {
        &self.graph
    }

    /// Output keys and their roots, in order.
    pub fn roots(&self) -> &[(String, NodeId)] {
        &self.roots
    }

    /// Keys whose root is more than a plain load.
    pub fn merged_keys(&self) -> usize {
        self.merged
    }

    /// Number of output keys.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether the plan produces nothing.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Evaluate every root of `plan`.
///
/// Keys run in parallel on the context's thread count. The first failing key
/// aborts the merge; results already stored in the cache stay valid.
pub fn merge_state(plan: &MergePlan, ctx: &MergeContext) -> Result<StateDict> {
    let total = plan.len();
    let done = AtomicUsize::new(0);

    let run = || {
        plan.roots()
            .par_iter()
            .map(|(key, root)| {
                let tensor = evaluate(plan.graph(), *root, ctx)?;
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                if finished % 100 == 0 || finished == total {
                    info!("Merged {}/{}: {}", finished, total, key);
                }
                Ok((key.clone(), tensor))
            })
            .collect::<Result<StateDict>>()
    };

    let state = match ctx.settings().threads {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| MergeError::InvalidConfig(format!("thread pool: {}", e)))?;
            pool.install(run)?
        }
        None => run()?,
    };

    let stats = ctx.cache().stats();
    debug!(
        "Cache after merge: {} entries, {} bytes, {} hits, {} misses",
        stats.entries, stats.bytes, stats.hits, stats.misses
    );
    Ok(state)
}

/// Open every checkpoint named by `recipe`.
pub fn open_checkpoints(recipe: &MergeRecipe) -> Result<CheckpointSet> {
    let mut set = CheckpointSet::new();
    for (id, path) in &recipe.checkpoints {
        info!("Loading checkpoint '{}' from {:?}", id, path);
        set.insert(id.as_str(), SafetensorsCheckpoint::open(path)?);
    }
    Ok(set)
}

/// Keys of the primary checkpoint, sorted.
pub fn primary_keys(recipe: &MergeRecipe, checkpoints: &CheckpointSet) -> Result<Vec<String>> {
    let primary = recipe.primary()?;
    let source = checkpoints
        .get(primary)
        .ok_or_else(|| MergeError::unknown_checkpoint(primary))?;
    let mut keys = source.tensor_names();
    keys.sort();
    Ok(keys)
}

/// Load, plan and evaluate `recipe` with a fresh cache.
pub fn run_recipe(recipe: &MergeRecipe) -> Result<StateDict> {
    recipe.validate()?;
    let checkpoints = open_checkpoints(recipe)?;
    let keys = primary_keys(recipe, &checkpoints)?;
    let plan = MergePlan::build(recipe, keys)?;
    let ctx = MergeContext::new(Arc::new(checkpoints)).with_settings(recipe.settings());
    merge_state(&plan, &ctx)
}

/// Where `recipe` saves its result.
///
/// Without an explicit `output` the file is named by [`merge_name`] in the
/// working directory, with a `.fp16.safetensors` extension for fp16 output.
pub fn output_path(recipe: &MergeRecipe) -> PathBuf {
    recipe.output.clone().unwrap_or_else(|| {
        let extension = if recipe.fp16 {
            "fp16.safetensors"
        } else {
            "safetensors"
        };
        PathBuf::from(format!("{}.{}", merge_name(recipe), extension))
    })
}

/// File stem describing `recipe`: abridged checkpoint stems joined by `~`,
/// then the root operator and its alpha, e.g. `Base~Tuned_TRAIN-DIFFx0.5`.
pub fn merge_name(recipe: &MergeRecipe) -> String {
    let stems: Vec<String> = recipe
        .checkpoints
        .values()
        .take(NAMED_CHECKPOINTS)
        .map(|path| abridge(path))
        .filter(|stem| !stem.is_empty())
        .collect();
    if stems.is_empty() {
        return DEFAULT_OUTPUT.to_string();
    }

    let op = recipe.formula.op.name().replace('_', "-").to_uppercase();
    let mut name = format!("{}_{}", stems.join("~"), op);
    if let Some(alpha) = recipe.formula.alpha {
        name.push_str(&format!("x{}", alpha));
    }
    name
}

fn abridge(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let mut chars = stem.chars().take(ABRIDGED_STEM_LEN);
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Write `state` where `recipe` says, returning the path actually used.
pub fn save_state(recipe: &MergeRecipe, state: &StateDict, overwrite: bool) -> Result<PathBuf> {
    let mut writer = StateWriter::new(output_path(recipe)).overwrite(overwrite);
    if recipe.fp16 {
        writer = writer.cast_to(Precision::F16);
    }
    writer.write(state)
}

/// Builder for creating recipes programmatically.
#[derive(Debug, Default)]
pub struct RecipeBuilder {
    checkpoints: BTreeMap<String, PathBuf>,
    primary: Option<String>,
    precision: Option<Precision>,
    threads: Option<usize>,
    targets: Vec<String>,
    exclude: Vec<String>,
    formula: Option<FormulaNode>,
    output: Option<PathBuf>,
    fp16: bool,
}

impl RecipeBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a checkpoint.
    pub fn checkpoint(mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.checkpoints.insert(id.into(), path.into());
        self
    }

    /// Set the primary checkpoint.
    pub fn primary(mut self, id: impl Into<String>) -> Self {
        self.primary = Some(id.into());
        self
    }

    /// Set the working precision.
    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Set the worker thread count.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Add a target selector.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Add an exclusion selector.
    pub fn exclude(mut self, target: impl Into<String>) -> Self {
        self.exclude.push(target.into());
        self
    }

    /// Set the formula.
    pub fn formula(mut self, formula: FormulaNode) -> Self {
        self.formula = Some(formula);
        self
    }

    /// Set the output path.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Save as float16.
    pub fn fp16(mut self, fp16: bool) -> Self {
        self.fp16 = fp16;
        self
    }

    /// Build and validate the recipe.
    pub fn build(self) -> Result<MergeRecipe> {
        let formula = self
            .formula
            .ok_or_else(|| MergeError::InvalidConfig("Formula is required".to_string()))?;
        let targets = if self.targets.is_empty() {
            vec!["all".to_string()]
        } else {
            self.targets
        };

        let recipe = MergeRecipe {
            checkpoints: self.checkpoints,
            primary: self.primary,
            precision: self.precision.unwrap_or(Precision::F16),
            threads: self.threads,
            targets,
            exclude: self.exclude,
            formula,
            output: self.output,
            fp16: self.fp16,
        };
        recipe.validate()?;
        Ok(recipe)
    }

    /// Build and run the recipe.
    pub fn run(self) -> Result<StateDict> {
        let recipe = self.build()?;
        run_recipe(&recipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryCheckpoint, MergeSettings, ResultCache};

    const KEYS: [&str; 3] = [
        "cond_stage_model.proj.weight",
        "model.diffusion_model.input_blocks.0.weight",
        "model.diffusion_model.output_blocks.0.weight",
    ];

    fn context(settings: MergeSettings) -> MergeContext {
        let mut a = MemoryCheckpoint::new();
        let mut b = MemoryCheckpoint::new();
        for (i, key) in KEYS.iter().enumerate() {
            let i = i as f32;
            a.insert(*key, Tensor::from_values(&[i, i + 1.0]));
            b.insert(*key, Tensor::from_values(&[i + 2.0, i + 5.0]));
        }
        let set = CheckpointSet::new().with("a", a).with("b", b);
        MergeContext::new(Arc::new(set)).with_settings(settings)
    }

    fn weighted_sum() -> FormulaNode {
        FormulaNode::new(
            OpKind::Add,
            vec![
                FormulaNode::new(OpKind::Multiply, vec![FormulaNode::load("a")]).alpha(0.5),
                FormulaNode::new(OpKind::Multiply, vec![FormulaNode::load("b")]).alpha(0.5),
            ],
        )
    }

    fn recipe() -> RecipeBuilder {
        RecipeBuilder::new()
            .checkpoint("a", "a.safetensors")
            .checkpoint("b", "b.safetensors")
            .precision(Precision::F32)
            .formula(weighted_sum())
    }

    #[test]
    fn test_plan_selects_targets() {
        let recipe = recipe().target("unet").exclude("out").build().unwrap();
        let plan = MergePlan::build(&recipe, KEYS).unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.merged_keys(), 1);
        let kinds: Vec<OpKind> = plan
            .roots()
            .iter()
            .map(|(_, root)| plan.graph().node(*root).unwrap().kind())
            .collect();
        assert_eq!(kinds, vec![OpKind::Load, OpKind::Add, OpKind::Load]);
    }

    #[test]
    fn test_merge_state() {
        let recipe = recipe().target("unet").build().unwrap();
        let plan = MergePlan::build(&recipe, KEYS).unwrap();
        let state = merge_state(&plan, &context(recipe.settings())).unwrap();

        assert_eq!(state.len(), 3);
        // copied from the primary checkpoint `a`
        assert_eq!(state[KEYS[0]].to_vec(), vec![0.0, 1.0]);
        assert_eq!(state[KEYS[1]].to_vec(), vec![2.0, 4.0]);
        assert_eq!(state[KEYS[2]].to_vec(), vec![3.0, 5.0]);
    }

    #[test]
    fn test_merge_state_on_dedicated_pool() {
        let recipe = recipe().threads(2).build().unwrap();
        let plan = MergePlan::build(&recipe, KEYS).unwrap();
        let state = merge_state(&plan, &context(recipe.settings())).unwrap();
        assert_eq!(state[KEYS[0]].to_vec(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_merge_state_fails_on_missing_key() {
        let recipe = recipe().build().unwrap();
        let plan = MergePlan::build(&recipe, ["not.there"]).unwrap();
        let err = merge_state(&plan, &context(recipe.settings())).unwrap_err();
        assert!(matches!(err, MergeError::KeyNotFound { .. }));
    }

    #[test]
    fn test_shared_cache_across_merges() {
        let formula = FormulaNode::new(
            OpKind::Multiply,
            vec![FormulaNode::new(
                OpKind::Sub,
                vec![FormulaNode::load("b"), FormulaNode::load("a")],
            )
            .cached()],
        );
        let cache = Arc::new(ResultCache::new());
        let settings = MergeSettings {
            precision: Precision::F32,
            threads: None,
        };

        for (alpha, expected) in [(1.0, vec![2.0, 4.0]), (0.5, vec![1.0, 2.0])] {
            let recipe = recipe().formula(formula.clone().alpha(alpha)).build().unwrap();
            let plan = MergePlan::build(&recipe, [KEYS[0]]).unwrap();
            let ctx = context(settings).with_cache(cache.clone());
            let state = merge_state(&plan, &ctx).unwrap();
            assert_eq!(state[KEYS[0]].to_vec(), expected);
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_from_parts() {
        let mut graph = MergeGraph::new();
        let a = graph.load("w", "a").unwrap();
        let b = graph.load("w", "b").unwrap();
        let sum = graph.add("w", a, b).unwrap();

        let plan = MergePlan::from_parts(graph.clone(), vec![("w".to_string(), sum)]).unwrap();
        assert_eq!(plan.merged_keys(), 1);

        assert!(MergePlan::from_parts(MergeGraph::new(), vec![("w".to_string(), sum)]).is_err());
    }

    #[test]
    fn test_builder_requires_formula() {
        let result = RecipeBuilder::new().checkpoint("a", "a.safetensors").build();
        assert!(matches!(result, Err(MergeError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_requires_checkpoints() {
        let result = RecipeBuilder::new().formula(FormulaNode::load("a")).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_output_path() {
        let mut recipe = recipe().build().unwrap();
        assert_eq!(output_path(&recipe), PathBuf::from("A~B_ADD.safetensors"));
        recipe.fp16 = true;
        assert_eq!(output_path(&recipe), PathBuf::from("A~B_ADD.fp16.safetensors"));
        recipe.output = Some(PathBuf::from("out/x.safetensors"));
        assert_eq!(output_path(&recipe), PathBuf::from("out/x.safetensors"));
    }

    #[test]
    fn test_merge_name() {
        let formula = FormulaNode::new(
            OpKind::TrainDiff,
            vec![
                FormulaNode::load("base"),
                FormulaNode::load("tuned"),
                FormulaNode::load("orig"),
            ],
        )
        .alpha(0.5);
        let recipe = RecipeBuilder::new()
            .checkpoint("base", "models/SDXL-Base-1.0.safetensors")
            .checkpoint("orig", "models/original.safetensors")
            .checkpoint("tuned", "models/PhotoRealisticTune.safetensors")
            .checkpoint("zz", "models/unused.safetensors")
            .formula(formula)
            .build()
            .unwrap();

        // checkpoint ids in sorted order, at most three of them
        assert_eq!(
            merge_name(&recipe),
            "Sdxl-base-~Original_Photoreali_TRAIN-DIFFx0.5"
        );
    }
}
