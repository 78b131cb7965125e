use std::collections::BTreeMap;
use std::path::Path;

use lazymerge::{
    run_recipe, save_state, MergeError, MergeRecipe, Precision, SafetensorsCheckpoint,
    StateWriter, Tensor, TensorSource,
};

const UNET: &str = "model.diffusion_model.input_blocks.0.weight";
const CLIP: &str = "cond_stage_model.proj.weight";

fn write_checkpoint(path: &Path, unet: &[f32], clip: &[f32]) {
    let mut state = BTreeMap::new();
    state.insert(
        UNET.to_string(),
        Tensor::from_shape_vec(&[1, unet.len()], unet.to_vec(), Precision::F32).unwrap(),
    );
    state.insert(CLIP.to_string(), Tensor::from_values(clip));
    StateWriter::new(path).overwrite(true).write(&state).unwrap();
}

fn recipe(dir: &Path, formula: &str) -> MergeRecipe {
    let yaml = format!(
        r#"
checkpoints:
  a: {a}
  b: {b}
  c: {c}
primary: a
precision: float32
targets: [unet]
output: {out}
formula:
{formula}
"#,
        a = dir.join("a.safetensors").display(),
        b = dir.join("b.safetensors").display(),
        c = dir.join("c.safetensors").display(),
        out = dir.join("merged.safetensors").display(),
    );
    MergeRecipe::from_yaml(&yaml).unwrap()
}

fn setup() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(&dir.path().join("a.safetensors"), &[1.0, 2.0, 3.0], &[7.0]);
    write_checkpoint(&dir.path().join("b.safetensors"), &[1.0, 4.0, 3.0], &[8.0]);
    write_checkpoint(&dir.path().join("c.safetensors"), &[1.0, 4.0, 3.0], &[9.0]);
    dir
}

#[test]
fn test_sub_multiply_recipe() {
    let dir = setup();
    let recipe = recipe(
        dir.path(),
        r#"
  op: multiply
  alpha: 0.5
  sources:
    - op: sub
      cache: true
      sources:
        - { op: load, checkpoint: b }
        - { op: load, checkpoint: a }
"#,
    );

    let state = run_recipe(&recipe).unwrap();
    assert_eq!(state.len(), 2);
    assert_eq!(state[UNET].shape(), &[1, 3]);
    assert_eq!(state[UNET].to_vec(), vec![0.0, 1.0, 0.0]);
    // not targeted: copied from the primary checkpoint
    assert_eq!(state[CLIP].to_vec(), vec![7.0]);

    let path = save_state(&recipe, &state, false).unwrap();
    assert_eq!(path, dir.path().join("merged.safetensors"));

    let merged = SafetensorsCheckpoint::open(&path).unwrap();
    let mut names = merged.tensor_names();
    names.sort();
    assert_eq!(names, vec![CLIP.to_string(), UNET.to_string()]);
    let unet = merged.load_tensor(UNET).unwrap().unwrap();
    assert_eq!(unet.to_vec(), vec![0.0, 1.0, 0.0]);

    // a second save does not clobber the first
    let again = save_state(&recipe, &state, false).unwrap();
    assert_eq!(again, dir.path().join("merged_1.safetensors"));
}

#[test]
fn test_train_diff_identity_recipe() {
    let dir = setup();
    // b and c hold identical unet weights
    let recipe = recipe(
        dir.path(),
        r#"
  op: train_diff
  alpha: 1.0
  sources:
    - { op: load, checkpoint: a }
    - { op: load, checkpoint: b }
    - { op: load, checkpoint: c }
"#,
    );

    let state = run_recipe(&recipe).unwrap();
    assert_eq!(state[UNET].to_vec(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_fp16_output() {
    let dir = setup();
    let mut recipe = recipe(
        dir.path(),
        r#"
  op: smooth
  sources:
    - { op: load, checkpoint: a }
"#,
    );
    recipe.fp16 = true;

    let state = run_recipe(&recipe).unwrap();
    let path = save_state(&recipe, &state, true).unwrap();
    let merged = SafetensorsCheckpoint::open(&path).unwrap();
    assert_eq!(merged.tensor_precision(UNET), Some(Precision::F16));
    assert_eq!(merged.tensor_precision(CLIP), Some(Precision::F16));
}

#[test]
fn test_missing_checkpoint_file() {
    let dir = setup();
    let mut recipe = recipe(
        dir.path(),
        r#"
  op: load
  checkpoint: b
"#,
    );
    recipe
        .checkpoints
        .insert("b".to_string(), dir.path().join("nope.safetensors"));

    assert!(run_recipe(&recipe).is_err());
}

#[test]
fn test_shape_mismatch_reports_key() {
    let dir = setup();
    write_checkpoint(&dir.path().join("b.safetensors"), &[1.0, 2.0], &[8.0]);
    let recipe = recipe(
        dir.path(),
        r#"
  op: add
  sources:
    - { op: load, checkpoint: a }
    - { op: load, checkpoint: b }
"#,
    );

    match run_recipe(&recipe).unwrap_err() {
        MergeError::ShapeMismatch { key, .. } => assert_eq!(key, UNET),
        other => panic!("unexpected error: {other}"),
    }
}
