//! Lazy, content-addressed merging of model weight checkpoints.
//!
//! A merge is described as a DAG of operations per weight key: loads from
//! named checkpoints combined by scaling, addition, subtraction, smoothing,
//! trained-difference extraction and similarity-gated blending. Nothing is
//! computed until a root is evaluated, and every node carries a structural
//! fingerprint so results can be memoized across keys and across repeated
//! merges of one session.
//!
//! # Operators
//!
//! - **load**: a tensor from a checkpoint
//! - **multiply**, **add**, **sub**: element-wise arithmetic
//! - **smooth**: median then Gaussian filter
//! - **train_diff**: transfer of what `b` learned relative to `c`, onto `a`
//! - **similarity**: cosine-similarity gated interpolation
//!
//! # Caching
//!
//! Nodes marked cache-enabled store their result in a shared
//! [`ResultCache`] under their [`Fingerprint`]. Trained difference caches its
//! alpha-independent adjustment on its own, so changing only alpha never
//! re-evaluates `b` or `c`.
//!
//! # Example
//!
//! ```ignore
//! use lazymerge::{MergeRecipe, run_recipe, save_state};
//!
//! let recipe = MergeRecipe::from_yaml_file("recipe.yaml")?;
//! let state = run_recipe(&recipe)?;
//! save_state(&recipe, &state, false)?;
//! ```

#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod evaluator;
mod graph;
mod loader;
mod merge;
pub mod methods;
mod selector;
mod tensor;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use evaluator::*;
pub use graph::*;
pub use loader::*;
pub use merge::*;
pub use selector::*;
pub use tensor::*;
