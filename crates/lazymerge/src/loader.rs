//! Checkpoint access and state output.
//!
//! The evaluator only ever talks to a [`CheckpointRegistry`]. [`CheckpointSet`]
//! is the standard registry: a map from checkpoint id to a [`TensorSource`],
//! either a memory-mapped [`SafetensorsCheckpoint`] or an in-memory
//! [`MemoryCheckpoint`]. Tensors are decoded lazily, one key at a time, so a
//! merge only ever holds the weights it is currently working on.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use half::{bf16, f16};
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};

use crate::{MergeError, Precision, Result, Tensor};

/// Resolves `(checkpoint, key)` pairs to tensors.
pub trait CheckpointRegistry: Send + Sync {
    /// Fetch `key` from `checkpoint`.
    ///
    /// Fails with [`MergeError::KeyNotFound`] when the checkpoint lacks the key.
    fn get_tensor(&self, checkpoint: &str, key: &str) -> Result<Tensor>;
}

/// A single loaded checkpoint.
pub trait TensorSource: Send + Sync {
    /// Names of all tensors in the checkpoint.
    fn tensor_names(&self) -> Vec<String>;

    /// Whether `name` is present.
    fn contains(&self, name: &str) -> bool;

    /// Load a tensor, `None` when absent.
    fn load_tensor(&self, name: &str) -> Result<Option<Tensor>>;
}

/// Registry of named checkpoints.
#[derive(Default)]
pub struct CheckpointSet {
    checkpoints: BTreeMap<String, Box<dyn TensorSource>>,
}

impl CheckpointSet {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checkpoint, replacing any previous one with the same id.
    pub fn insert(&mut self, id: impl Into<String>, source: impl TensorSource + 'static) {
        self.checkpoints.insert(id.into(), Box::new(source));
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, id: impl Into<String>, source: impl TensorSource + 'static) -> Self {
        self.insert(id, source);
        self
    }

    /// Look up a checkpoint.
    pub fn get(&self, id: &str) -> Option<&dyn TensorSource> {
        self.checkpoints.get(id).map(|s| s.as_ref())
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.checkpoints.keys().map(String::as_str)
    }

    /// Number of registered checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether no checkpoint is registered.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl CheckpointRegistry for CheckpointSet {
    fn get_tensor(&self, checkpoint: &str, key: &str) -> Result<Tensor> {
        let source = self
            .get(checkpoint)
            .ok_or_else(|| MergeError::UnknownCheckpoint {
                checkpoint: checkpoint.to_string(),
                key: Some(key.to_string()),
            })?;
        source
            .load_tensor(key)?
            .ok_or_else(|| MergeError::KeyNotFound {
                checkpoint: checkpoint.to_string(),
                key: key.to_string(),
            })
    }
}

/// Checkpoint held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    tensors: HashMap<String, Tensor>,
}

impl MemoryCheckpoint {
    /// Create an empty checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }
}

impl<S: Into<String>> FromIterator<(S, Tensor)> for MemoryCheckpoint {
    fn from_iter<I: IntoIterator<Item = (S, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl TensorSource for MemoryCheckpoint {
    fn tensor_names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn load_tensor(&self, name: &str) -> Result<Option<Tensor>> {
        Ok(self.tensors.get(name).cloned())
    }
}

/// Location of a tensor within a memory-mapped file.
#[derive(Debug, Clone)]
struct TensorLocation {
    file_idx: usize,
    offset: usize,
    len: usize,
    dtype: Dtype,
    shape: Vec<usize>,
}

/// Memory-mapped safetensors checkpoint (single file or sharded directory).
#[derive(Debug)]
pub struct SafetensorsCheckpoint {
    path: PathBuf,
    mmaps: Vec<(PathBuf, memmap2::Mmap)>,
    index: HashMap<String, TensorLocation>,
}

impl SafetensorsCheckpoint {
    /// Open a `.safetensors` file or a directory of shards.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut files = Vec::new();
        if path.is_file() && path.extension().is_some_and(|e| e == "safetensors") {
            files.push(path.clone());
        } else if path.is_dir() {
            for entry in std::fs::read_dir(&path)? {
                let file_path = entry?.path();
                if file_path.extension().is_some_and(|e| e == "safetensors") {
                    files.push(file_path);
                }
            }
        }

        if files.is_empty() {
            return Err(MergeError::ModelLoad(format!(
                "No safetensors files found in {:?}",
                path
            )));
        }

        // Sort for deterministic ordering
        files.sort();

        info!("Memory-mapping {} safetensors files from {:?}", files.len(), path);

        let mut mmaps = Vec::with_capacity(files.len());
        let mut index = HashMap::new();

        for (file_idx, file_path) in files.into_iter().enumerate() {
            debug!("Indexing {:?}", file_path);
            let file = std::fs::File::open(&file_path)?;
            // SAFETY: The file is opened read-only and the map lives as long as
            // this checkpoint.
            #[allow(unsafe_code)]
            let mmap = unsafe { memmap2::Mmap::map(&file)? };

            let tensors = SafeTensors::deserialize(&mmap)?;
            let base = mmap.as_ptr() as usize;
            for (name, view) in tensors.tensors() {
                let data = view.data();
                index.insert(
                    name,
                    TensorLocation {
                        file_idx,
                        offset: data.as_ptr() as usize - base,
                        len: data.len(),
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                    },
                );
            }

            mmaps.push((file_path, mmap));
        }

        info!("Indexed {} tensors", index.len());

        Ok(Self { path, mmaps, index })
    }

    /// Path the checkpoint was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shape of a tensor without decoding it.
    pub fn tensor_shape(&self, name: &str) -> Option<&[usize]> {
        self.index.get(name).map(|loc| loc.shape.as_slice())
    }

    /// Stored precision of a tensor, if it is a supported float type.
    pub fn tensor_precision(&self, name: &str) -> Option<Precision> {
        self.index.get(name).and_then(|loc| precision_of(loc.dtype))
    }
}

impl TensorSource for SafetensorsCheckpoint {
    fn tensor_names(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn load_tensor(&self, name: &str) -> Result<Option<Tensor>> {
        let Some(loc) = self.index.get(name) else {
            return Ok(None);
        };
        let (_, mmap) = &self.mmaps[loc.file_idx];
        let bytes = &mmap[loc.offset..loc.offset + loc.len];
        decode(name, loc.dtype, &loc.shape, bytes).map(Some)
    }
}

fn precision_of(dtype: Dtype) -> Option<Precision> {
    match dtype {
        Dtype::F32 => Some(Precision::F32),
        Dtype::F16 => Some(Precision::F16),
        Dtype::BF16 => Some(Precision::BF16),
        _ => None,
    }
}

fn dtype_of(precision: Precision) -> Dtype {
    match precision {
        Precision::F32 => Dtype::F32,
        Precision::F16 => Dtype::F16,
        Precision::BF16 => Dtype::BF16,
    }
}

fn decode(name: &str, dtype: Dtype, shape: &[usize], bytes: &[u8]) -> Result<Tensor> {
    // Mapped tensor data carries no alignment guarantee, so copy out element-wise.
    let values: Vec<f32> = match dtype {
        Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
        Dtype::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(bytes)
            .into_iter()
            .map(f16::to_f32)
            .collect(),
        Dtype::BF16 => bytemuck::pod_collect_to_vec::<u8, bf16>(bytes)
            .into_iter()
            .map(bf16::to_f32)
            .collect(),
        other => {
            return Err(MergeError::ModelLoad(format!(
                "Unsupported dtype {:?} for tensor {}",
                other, name
            )));
        }
    };
    let precision = precision_of(dtype).unwrap_or_default();
    Tensor::from_shape_vec(shape, values, precision)
}

fn encode(tensor: &Tensor) -> Vec<u8> {
    let values = tensor.data().iter();
    match tensor.precision() {
        Precision::F32 => values.flat_map(|v| v.to_le_bytes()).collect(),
        Precision::F16 => values.flat_map(|&v| f16::from_f32(v).to_le_bytes()).collect(),
        Precision::BF16 => values.flat_map(|&v| bf16::from_f32(v).to_le_bytes()).collect(),
    }
}

/// Writes a merged state to a single safetensors file.
#[derive(Debug, Clone)]
pub struct StateWriter {
    path: PathBuf,
    overwrite: bool,
    precision: Option<Precision>,
}

impl StateWriter {
    /// Write to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            overwrite: false,
            precision: None,
        }
    }

    /// Replace an existing file instead of picking a fresh name.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Cast every tensor to `precision` before writing.
    pub fn cast_to(mut self, precision: Precision) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Path that [`write`](Self::write) will use.
    ///
    /// Without overwrite, an existing `name.ext` becomes `name_1.ext`,
    /// `name_2.ext` and so on.
    pub fn target_path(&self) -> PathBuf {
        if self.overwrite || !self.path.exists() {
            return self.path.clone();
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = self
            .path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (1..)
            .map(|n| self.path.with_file_name(format!("{}_{}{}", stem, n, ext)))
            .find(|candidate| !candidate.exists())
            .unwrap_or_else(|| self.path.clone())
    }

    /// Serialize `state` and return the written path.
    pub fn write<'a, I>(&self, state: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = (&'a String, &'a Tensor)>,
    {
        let target = self.target_path();
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let encoded: Vec<(&str, Vec<usize>, Dtype, Vec<u8>)> = state
            .into_iter()
            .map(|(name, tensor)| {
                let tensor = match self.precision {
                    Some(precision) => tensor.cast(precision),
                    None => tensor.clone(),
                };
                (
                    name.as_str(),
                    tensor.shape().to_vec(),
                    dtype_of(tensor.precision()),
                    encode(&tensor),
                )
            })
            .collect();

        let views = encoded
            .iter()
            .map(|(name, shape, dtype, bytes)| {
                safetensors::tensor::TensorView::new(*dtype, shape.clone(), bytes)
                    .map(|view| (*name, view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        info!("Writing {} tensors to {:?}", views.len(), target);
        safetensors::serialize_to_file(views, &None, &target)?;
        Ok(target)
    }
}
