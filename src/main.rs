//! poisonset CLI - Poisoned training-set construction and training orchestration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poisonset::{ArtifactStore, AttackVariant, Config, DatasetId, Phase, PhaseOutcome, Pipeline};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "poisonset")]
#[command(version)]
#[command(about = "Poisoned training-set construction for backdoor attack research")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Construct a single poisoned training set
    Poison {
        #[arg(long)]
        dataset: DatasetId,

        /// Attack variant id (badnet, blend, WaNet, ...)
        #[arg(long = "poison-type")]
        poison_type: AttackVariant,

        #[arg(long = "poison-rate")]
        poison_rate: f64,

        /// Cover rate; defaults to the config value for cover variants
        #[arg(long = "cover-rate")]
        cover_rate: Option<f64>,

        /// Blend strength; defaults to the config value
        #[arg(long)]
        alpha: Option<f64>,

        /// Trigger file name under the triggers directory
        #[arg(long)]
        trigger: Option<String>,

        /// Fraction of the clean set to keep, per class
        #[arg(long = "data-rate", default_value = "1.0")]
        data_rate: f64,

        /// Seed for reduction and poisoning
        #[arg(long)]
        seed: Option<u64>,

        /// Fail instead of reusing an existing poisoned set
        #[arg(long)]
        fail_on_existing: bool,
    },

    /// Run the [batch] section: poison and train every listed variant
    Run {
        /// Keep going after a configuration fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Summarize an existing poisoned set
    Inspect {
        /// Poisoned-set directory
        dir: PathBuf,
    },

    /// List poisoned sets built for a dataset
    List { dataset: DatasetId },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

/// `RUST_LOG` wins; otherwise `--verbose` picks DEBUG over INFO.
fn log_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn setup_logging(verbose: bool) {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(verbose))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {e}");
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config =
        Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_example_config() {
    let example = r#"# poisonset configuration file

[paths]
# Clean sets are read from <data_dir>/<dataset>/train
data_dir = "data"
poison_root = "poisoned_train_set"
triggers_dir = "triggers"
models_dir = "models"

[classes]
target = { cifar10 = 0, gtsrb = 2, stl10 = 0, imagenette = 0 }
source_class = 1
cover_classes = [5, 7]

[attack]
alpha = 0.2
cover_rate = 0.0
seed = 0

[attack.default_triggers.cifar10]
badnet = "badnet_patch_32.png"
blend = "hellokitty_32.png"

[phases]
# clean_set = { program = "python", args = ["create_clean_set.py"] }
trainer = { program = "python", args = ["train_on_poisoned_set.py"] }
# timeout_secs = 86400

[batch]
dataset = "cifar10"
poison_types = ["badnet", "blend", "WaNet", "adaptive_blend"]
poison_rate = 0.003
data_rate = 1.0
num_models = 3

[batch.overrides.WaNet]
cover_rate = 0.006

[batch.overrides.adaptive_blend]
cover_rate = 0.003
alpha = 0.15
"#;
    println!("{example}");
}

fn outcome_label(outcome: Option<&PhaseOutcome>) -> String {
    match outcome {
        Some(PhaseOutcome::Completed) => "completed".to_string(),
        Some(PhaseOutcome::Skipped { reason }) => format!("skipped ({reason})"),
        None => "not run".to_string(),
    }
}

/// Exit cleanly when the failure only means the output was already there.
fn finish(result: poisonset::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_precondition() => {
            warn!("{e}");
            Ok(())
        }
        other => Ok(other?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;

            info!("Configuration is valid");
            info!("  Data dir:     {}", config.paths.data_dir.display());
            info!("  Poison root:  {}", config.paths.poison_root.display());
            info!("  Trainer:      {}", config.phases.trainer.program);
            if let Some(batch) = &config.batch {
                info!(
                    "  Batch:        {} variants on {} x {} models",
                    batch.poison_types.len(),
                    batch.dataset,
                    batch.num_models
                );
            }
            return Ok(());
        }

        Commands::Poison {
            dataset,
            poison_type,
            poison_rate,
            cover_rate,
            alpha,
            trigger,
            data_rate,
            seed,
            fail_on_existing,
        } => {
            let config = load_config(&cli.config)?;

            let mut params = config.params_for(dataset, poison_type, poison_rate);
            if let Some(cover_rate) = cover_rate {
                params.cover_rate = cover_rate;
            }
            if let Some(alpha) = alpha {
                params.alpha = alpha;
            }
            if let Some(seed) = seed {
                params.seed = seed;
            }
            params.trigger = trigger;
            params.data_rate = data_rate;

            let pipeline = Pipeline::new(config).fail_on_existing(fail_on_existing);
            let constructed = match pipeline.construct(&params) {
                Ok(constructed) => constructed,
                Err(e) => return finish(Err(e)),
            };

            println!("\n=== Poisoned Set Complete ===");
            println!("Dataset:     {}", params.dataset);
            println!("Variant:     {}", params.variant);
            println!("Status:      {}", outcome_label(Some(&constructed.outcome)));
            if let Some(manifest) = &constructed.manifest {
                println!("Run id:      {}", manifest.run_id);
                println!("Samples:     {}", manifest.samples);
                println!("Poisoned:    {}", manifest.poison_count);
                if let Some(cover) = manifest.cover_count {
                    println!("Cover:       {cover}");
                }
            }
            println!("Output:      {:?}", constructed.dir);
        }

        Commands::Run { continue_on_error } => {
            let config = load_config(&cli.config)?;
            let batch = config
                .batch
                .clone()
                .context("No [batch] section in configuration")?;

            let pipeline = Pipeline::new(config);
            let report = pipeline.run_batch(&batch, continue_on_error).await;

            println!("\n=== Batch Complete ===");
            for entry in &report.entries {
                match &entry.result {
                    Ok(run) => {
                        println!(
                            "{:<20} poison_set {}, {} models trained, {:.1}s",
                            entry.variant.to_string(),
                            outcome_label(run.outcome(Phase::PoisonConstruct)),
                            run.seeds.len(),
                            run.runtime_secs
                        );
                        println!("{:<20} seeds {:?}", "", run.seeds);
                    }
                    Err(e) => println!("{:<20} FAILED: {e}", entry.variant.to_string()),
                }
            }
            for variant in &report.not_run {
                println!("{:<20} not run", variant.to_string());
            }
            println!("Succeeded:   {}", report.succeeded());
            println!("Failed:      {}", report.failed());
            println!("Runtime:     {:.1}s", report.runtime_secs);

            if !report.is_success() {
                anyhow::bail!(
                    "{} failed, {} not run",
                    report.failed(),
                    report.not_run.len()
                );
            }
        }

        Commands::Inspect { dir } => {
            let artifact = ArtifactStore::load(&dir)
                .with_context(|| format!("Failed to load poisoned set from {dir:?}"))?;

            println!("\n=== Poisoned Set ===");
            if let Some(manifest) = &artifact.manifest {
                println!("Run id:      {}", manifest.run_id);
                println!("Created:     {}", manifest.created_at.to_rfc3339());
                println!("Dataset:     {}", manifest.params.dataset);
                println!("Variant:     {}", manifest.params.variant);
                println!("Poison rate: {}", manifest.params.poison_rate);
            }
            let (_, c, h, w) = artifact.images.dim();
            println!("Samples:     {} ({c}x{h}x{w})", artifact.len());
            println!("Poisoned:    {}", artifact.poison_indices.len());
            if let Some(cover) = &artifact.cover_indices {
                println!("Cover:       {}", cover.len());
            }
            for (name, tensor) in artifact.side.iter() {
                println!("Side data:   {name} {:?}", tensor.shape());
            }
        }

        Commands::List { dataset } => {
            let config = load_config(&cli.config)?;
            let store = ArtifactStore::new(config.paths.poison_root.clone());
            let dirs = store.list(dataset)?;
            if dirs.is_empty() {
                info!(dataset = %dataset, root = %store.root().display(), "No poisoned sets found");
            }
            for dir in dirs {
                println!("{}", dir.display());
            }
        }
    }

    Ok(())
}
