//! lazymerge CLI - run merge recipes over safetensors checkpoints.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use lazymerge::{
    run_recipe, save_state, KeySelector, MergeRecipe, Precision, SafetensorsCheckpoint,
    TensorSource,
};
use tracing::info;

/// Working precision for wide-precision operators.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum PrecisionArg {
    /// IEEE single precision
    Float32,
    /// IEEE half precision
    Float16,
    /// Brain floating point
    Bfloat16,
}

impl From<PrecisionArg> for Precision {
    fn from(arg: PrecisionArg) -> Self {
        match arg {
            PrecisionArg::Float32 => Precision::F32,
            PrecisionArg::Float16 => Precision::F16,
            PrecisionArg::Bfloat16 => Precision::BF16,
        }
    }
}

#[derive(Parser)]
#[command(name = "lazymerge")]
#[command(author, version, about = "Lazy, cached merging of model weight checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a merge recipe and save the merged checkpoint
    Merge {
        /// Path to the merge recipe (YAML)
        #[arg(short, long)]
        recipe: PathBuf,

        /// Output file (overrides the recipe)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Working precision (overrides the recipe)
        #[arg(long, value_enum)]
        precision: Option<PrecisionArg>,

        /// Worker threads (overrides the recipe)
        #[arg(long)]
        threads: Option<usize>,

        /// Save every tensor as float16
        #[arg(long)]
        fp16: bool,

        /// Replace an existing output file
        #[arg(long)]
        overwrite: bool,
    },

    /// List the weight keys of a checkpoint
    Keys {
        /// Safetensors file or shard directory
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Only list keys matching these targets
        #[arg(short, long)]
        target: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Merge {
            recipe,
            output,
            precision,
            threads,
            fp16,
            overwrite,
        } => {
            let mut config = MergeRecipe::from_yaml_file(&recipe)?;
            if let Some(output) = output {
                config.output = Some(output);
            }
            if let Some(precision) = precision {
                config.precision = precision.into();
            }
            if threads.is_some() {
                config.threads = threads;
            }
            config.fp16 |= fp16;
            config.validate()?;

            println!("========================================");
            println!("  lazymerge");
            println!("========================================");
            for (id, path) in &config.checkpoints {
                println!("Checkpoint {}: {}", id, path.display());
            }
            println!("Primary:    {}", config.primary()?);
            println!("Targets:    {}", config.targets.join(", "));
            if !config.exclude.is_empty() {
                println!("Exclude:    {}", config.exclude.join(", "));
            }
            println!("Formula:    {}", config.formula.op);
            println!("Precision:  {}", config.precision);
            println!("========================================\n");

            let state = run_recipe(&config)?;
            let path = save_state(&config, &state, overwrite)?;
            info!("Saved {} tensors", state.len());

            println!("\n========================================");
            println!("  Merge Complete!");
            println!("========================================");
            println!("Tensors: {}", state.len());
            println!("Output:  {}", path.display());
        }

        Commands::Keys { checkpoint, target } => {
            let source = SafetensorsCheckpoint::open(&checkpoint)?;
            let targets = if target.is_empty() {
                vec!["all".to_string()]
            } else {
                target
            };
            let selector = KeySelector::new(&targets)?;

            let mut names = source.tensor_names();
            names.sort();
            let mut shown = 0;
            for name in names.iter().filter(|name| selector.matches(name)) {
                let shape = source.tensor_shape(name).unwrap_or(&[]);
                let precision = source
                    .tensor_precision(name)
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!("{} {:?} {}", name, shape, precision);
                shown += 1;
            }
            println!("\n{} of {} keys", shown, names.len());
        }
    }

    Ok(())
}
