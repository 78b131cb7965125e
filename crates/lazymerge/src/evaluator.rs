//! Depth-first evaluation of merge graphs.
//!
//! Evaluation is post-order: every source is evaluated, in order, before the
//! node's operator runs. A cache-enabled node consults the [`ResultCache`]
//! before touching its sources; on a hit the whole subgraph is skipped.
//! Results of nodes without caching are dropped as soon as their consumer
//! has run.

use std::sync::Arc;

use tracing::trace;

use crate::methods::{self, train_diff};
use crate::{
    CheckpointRegistry, MergeGraph, MergeSettings, Node, NodeId, Operation, ResultCache, Result,
    Tensor,
};

/// Shared state for a merge session: checkpoints, result cache and settings.
#[derive(Clone)]
pub struct MergeContext {
    registry: Arc<dyn CheckpointRegistry>,
    cache: Arc<ResultCache>,
    settings: MergeSettings,
}

impl MergeContext {
    /// Context with a fresh cache and default settings.
    pub fn new(registry: Arc<dyn CheckpointRegistry>) -> Self {
        Self {
            registry,
            cache: Arc::new(ResultCache::new()),
            settings: MergeSettings::default(),
        }
    }

    /// Share an existing cache, e.g. across repeated merges of one session.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the settings.
    pub fn with_settings(mut self, settings: MergeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Checkpoint registry.
    pub fn registry(&self) -> &dyn CheckpointRegistry {
        self.registry.as_ref()
    }

    /// Session cache.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Evaluation settings.
    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    /// Evaluator over `graph` using this context.
    pub fn evaluator<'a>(&'a self, graph: &'a MergeGraph) -> Evaluator<'a> {
        Evaluator::new(graph, self)
    }
}

impl std::fmt::Debug for MergeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeContext")
            .field("cache", &self.cache)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Evaluate `root` of `graph`.
pub fn evaluate(graph: &MergeGraph, root: NodeId, ctx: &MergeContext) -> Result<Tensor> {
    ctx.evaluator(graph).evaluate(root)
}

/// Counters collected by an [`Evaluator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Nodes whose operator ran (cache hits excluded).
    pub nodes_evaluated: usize,
    /// Tensors resolved from checkpoints.
    pub tensors_loaded: usize,
    /// Cache lookups that skipped work.
    pub cache_hits: usize,
}

/// Evaluates nodes of one graph against a [`MergeContext`].
#[derive(Debug)]
pub struct Evaluator<'a> {
    graph: &'a MergeGraph,
    ctx: &'a MergeContext,
    stats: EvalStats,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator.
    pub fn new(graph: &'a MergeGraph, ctx: &'a MergeContext) -> Self {
        Self {
            graph,
            ctx,
            stats: EvalStats::default(),
        }
    }

    /// Counters since creation.
    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    /// Evaluate a node and, recursively, whatever it needs.
    pub fn evaluate(&mut self, id: NodeId) -> Result<Tensor> {
        let node = self.graph.node(id)?;
        if !node.is_cached() {
            return self.compute(node);
        }

        let fingerprint = node.fingerprint();
        if let Some(hit) = self.ctx.cache().lookup(&fingerprint) {
            trace!("cache hit {} '{}' ({})", node.kind(), node.key(), fingerprint);
            self.stats.cache_hits += 1;
            return Ok(hit);
        }

        let tensor = self.compute(node)?;
        Ok(self.ctx.cache().insert(fingerprint, tensor))
    }

    fn compute(&mut self, node: &'a Node) -> Result<Tensor> {
        self.stats.nodes_evaluated += 1;
        match node.operation() {
            Operation::Load { checkpoint } => {
                self.stats.tensors_loaded += 1;
                self.ctx.registry().get_tensor(checkpoint, node.key())
            }
            Operation::TrainDiff { alpha } => {
                train_diff::evaluate(self, node, *alpha).map_err(|e| e.at_key(node.key()))
            }
            op => {
                let inputs = node
                    .sources()
                    .iter()
                    .map(|&source| self.evaluate(source))
                    .collect::<Result<Vec<_>>>()?;
                methods::apply(op, &inputs, self.ctx.settings()).map_err(|e| e.at_key(node.key()))
            }
        }
    }

    pub(crate) fn graph(&self) -> &'a MergeGraph {
        self.graph
    }

    pub(crate) fn cache(&self) -> &ResultCache {
        self.ctx.cache()
    }

    pub(crate) fn settings(&self) -> &MergeSettings {
        self.ctx.settings()
    }

    pub(crate) fn record_cache_hit(&mut self) {
        self.stats.cache_hits += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CheckpointSet, MemoryCheckpoint, MergeError, OpKind, Precision};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry wrapper counting every tensor request.
    struct CountingRegistry {
        inner: CheckpointSet,
        loads: AtomicUsize,
    }

    impl CheckpointRegistry for CountingRegistry {
        fn get_tensor(&self, checkpoint: &str, key: &str) -> Result<Tensor> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_tensor(checkpoint, key)
        }
    }

    fn checkpoints() -> CheckpointSet {
        CheckpointSet::new()
            .with(
                "a",
                MemoryCheckpoint::new()
                    .with("w", Tensor::from_values(&[1.0, 2.0, 3.0]))
                    .with("m", Tensor::from_values(&[1.0, 2.0])),
            )
            .with(
                "b",
                MemoryCheckpoint::new()
                    .with("w", Tensor::from_values(&[1.0, 4.0, 3.0]))
                    .with("m", Tensor::from_values(&[1.0, 2.0, 3.0])),
            )
            .with(
                "c",
                MemoryCheckpoint::new().with("w", Tensor::from_values(&[0.0, 2.0, 3.0])),
            )
    }

    fn counting_context() -> (Arc<CountingRegistry>, MergeContext) {
        let registry = Arc::new(CountingRegistry {
            inner: checkpoints(),
            loads: AtomicUsize::new(0),
        });
        let ctx = MergeContext::new(registry.clone())
            .with_settings(MergeSettings {
                precision: Precision::F32,
                threads: None,
            });
        (registry, ctx)
    }

    #[test]
    fn test_sub_then_multiply() {
        let ctx = MergeContext::new(Arc::new(checkpoints()));
        let mut graph = MergeGraph::new();
        let a = graph.load("w", "a").unwrap();
        let b = graph.load("w", "b").unwrap();
        let diff = graph.sub("w", a, b).unwrap();
        let root = graph.multiply("w", diff, 0.5).unwrap();

        let out = evaluate(&graph, root, &ctx).unwrap();
        assert_eq!(out.to_vec(), vec![0.0, -1.0, 0.0]);

        let diff = graph.sub("w", b, a).unwrap();
        let root = graph.multiply("w", diff, 0.5).unwrap();
        assert_eq!(evaluate(&graph, root, &ctx).unwrap().to_vec(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_cache_transparency() {
        let (registry, ctx) = counting_context();
        let mut graph = MergeGraph::new();
        let a = graph.load("w", "a").unwrap();
        let b = graph.load("w", "b").unwrap();
        let sum = graph.add("w", a, b).unwrap();
        let root = graph.enable_cache(sum).unwrap();

        let mut evaluator = ctx.evaluator(&graph);
        let first = evaluator.evaluate(root).unwrap();
        assert_eq!(registry.loads.load(Ordering::SeqCst), 2);
        assert_eq!(evaluator.stats().nodes_evaluated, 3);

        let second = evaluator.evaluate(root).unwrap();
        assert!(first.values_equal(&second));
        assert_eq!(registry.loads.load(Ordering::SeqCst), 2);
        assert_eq!(evaluator.stats().nodes_evaluated, 3);
        assert_eq!(evaluator.stats().cache_hits, 1);
        assert!(ctx.cache().contains(&graph.fingerprint(root).unwrap()));
    }

    #[test]
    fn test_uncached_nodes_leave_cache_empty() {
        let ctx = MergeContext::new(Arc::new(checkpoints()));
        let mut graph = MergeGraph::new();
        let a = graph.load("w", "a").unwrap();
        let root = graph.smooth("w", a).unwrap();

        evaluate(&graph, root, &ctx).unwrap();
        assert!(ctx.cache().is_empty());
    }

    #[test]
    fn test_train_diff_partial_invalidation() {
        let (registry, ctx) = counting_context();

        let build = |alpha: f32| {
            let mut graph = MergeGraph::new();
            let a = graph.load("w", "a").unwrap();
            let b = graph.load("w", "b").unwrap();
            let c = graph.load("w", "c").unwrap();
            let root = graph.train_diff("w", a, b, c, alpha).unwrap();
            (graph, root)
        };

        let (graph1, root1) = build(1.0);
        let mut first = ctx.evaluator(&graph1);
        let out1 = first.evaluate(root1).unwrap();
        assert_eq!(registry.loads.load(Ordering::SeqCst), 3);
        assert_eq!(first.stats().cache_hits, 0);
        assert_eq!(ctx.cache().len(), 1);

        let (graph2, root2) = build(0.25);
        let mut second = ctx.evaluator(&graph2);
        let out2 = second.evaluate(root2).unwrap();
        // only `a` is loaded again
        assert_eq!(registry.loads.load(Ordering::SeqCst), 4);
        assert_eq!(second.stats().cache_hits, 1);
        assert_eq!(ctx.cache().len(), 1);

        let a = Tensor::from_values(&[1.0, 2.0, 3.0]);
        let b = Tensor::from_values(&[1.0, 4.0, 3.0]);
        let c = Tensor::from_values(&[0.0, 2.0, 3.0]);
        let adjustment = methods::trained_difference(&a, &b, &c, Precision::F32)
            .unwrap()
            .unwrap();
        let expect = |alpha| methods::add(&a, &methods::multiply(&adjustment, alpha)).unwrap();
        assert!(out1.values_equal(&expect(1.0)));
        assert!(out2.values_equal(&expect(0.25)));
    }

    #[test]
    fn test_train_diff_identity() {
        let ctx = MergeContext::new(Arc::new(checkpoints()));
        let mut graph = MergeGraph::new();
        let a = graph.load("w", "c").unwrap();
        let b = graph.load("w", "b").unwrap();
        let c = graph.load("w", "b").unwrap();

        for alpha in [0.0, 0.5, 3.0] {
            let root = graph.train_diff("w", a, b, c, alpha).unwrap();
            let out = evaluate(&graph, root, &ctx).unwrap();
            assert_eq!(out.to_vec(), vec![0.0, 2.0, 3.0]);
        }
        assert!(ctx.cache().is_empty());
    }

    #[test]
    fn test_shape_mismatch_not_cached() {
        let ctx = MergeContext::new(Arc::new(checkpoints()));
        let mut graph = MergeGraph::new();
        let a = graph.load("m", "a").unwrap();
        let b = graph.load("m", "b").unwrap();
        let sum = graph.add("m", a, b).unwrap();
        let root = graph.enable_cache(sum).unwrap();

        let err = evaluate(&graph, root, &ctx).unwrap_err();
        match err {
            MergeError::ShapeMismatch { key, kind, .. } => {
                assert_eq!(key, "m");
                assert_eq!(kind, OpKind::Add);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!ctx.cache().contains(&graph.fingerprint(root).unwrap()));
    }

    #[test]
    fn test_missing_key() {
        let ctx = MergeContext::new(Arc::new(checkpoints()));
        let mut graph = MergeGraph::new();
        let root = graph.load("missing", "c").unwrap();

        let err = evaluate(&graph, root, &ctx).unwrap_err();
        assert!(matches!(
            err,
            MergeError::KeyNotFound { checkpoint, key } if checkpoint == "c" && key == "missing"
        ));
    }

    #[test]
    fn test_unknown_checkpoint_names_key() {
        let ctx = MergeContext::new(Arc::new(checkpoints()));
        let mut graph = MergeGraph::new();
        let a = graph.load("w", "a").unwrap();
        let stray = graph.load("w", "zz").unwrap();
        let root = graph.add("w", a, stray).unwrap();

        let err = evaluate(&graph, root, &ctx).unwrap_err();
        assert!(err.to_string().contains("resolving 'w'"));
        assert!(matches!(
            err,
            MergeError::UnknownCheckpoint { checkpoint, key: Some(key) } if checkpoint == "zz" && key == "w"
        ));
    }

    #[test]
    fn test_structurally_equal_graphs() {
        let ctx = MergeContext::new(Arc::new(checkpoints()));
        let build = |graph: &mut MergeGraph| {
            // unrelated node first so the ids differ
            graph.load("m", "a").unwrap();
            let a = graph.load("w", "a").unwrap();
            let b = graph.load("w", "b").unwrap();
            let c = graph.load("w", "c").unwrap();
            graph.similarity("w", Some(c), a, b, 0.3, 0.5, 0.1).unwrap()
        };

        let mut left = MergeGraph::new();
        let mut right = MergeGraph::new();
        right.load("w", "c").unwrap();
        let l = build(&mut left);
        let r = build(&mut right);
        assert_ne!(l, r);
        assert_eq!(left.fingerprint(l).unwrap(), right.fingerprint(r).unwrap());

        let x = evaluate(&left, l, &ctx).unwrap();
        let y = evaluate(&right, r, &ctx).unwrap();
        assert_eq!(
            x.to_vec().iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            y.to_vec().iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_smooth_uses_configured_precision() {
        let ctx = MergeContext::new(Arc::new(checkpoints())).with_settings(MergeSettings {
            precision: Precision::BF16,
            threads: None,
        });
        let mut graph = MergeGraph::new();
        let a = graph.load("w", "a").unwrap();
        let root = graph.smooth("w", a).unwrap();

        assert_eq!(evaluate(&graph, root, &ctx).unwrap().precision(), Precision::BF16);
    }
}
