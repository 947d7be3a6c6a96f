//! Run orchestration.
//!
//! Pipeline flow per configuration:
//! CleanPrepare (optional) → PoisonConstruct → TrainRepeat(num_models)
//!
//! Phases run strictly in order and the first failure aborts the rest of the
//! configuration. Configurations in a batch are independent.

use super::external::run_external;
use super::seed::SeedSource;
use crate::models::{
    AttackParams, AttackVariant, BatchConfig, Config, PoisonsetError, Result, RunConfig,
};
use crate::poison::build_generator;
use crate::reduce::StratifiedReducer;
use crate::store::{load_clean_set, ArtifactStore, Manifest};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};

/// Environment variable pointing the trainer at the poisoned set.
pub const POISON_SET_DIR_ENV: &str = "POISON_SET_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    CleanPrepare,
    PoisonConstruct,
    TrainRepeat,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CleanPrepare => "clean_set",
            Self::PoisonConstruct => "poison_set",
            Self::TrainRepeat => "train",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PhaseOutcome {
    Completed,
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub elapsed_secs: f64,
}

/// Result of the poison-construction phase.
#[derive(Debug, Clone)]
pub struct Constructed {
    pub dir: PathBuf,
    pub outcome: PhaseOutcome,
    /// `None` when an existing set was reused
    pub manifest: Option<Manifest>,
}

/// Everything one configuration did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub params: AttackParams,
    pub artifact_dir: PathBuf,
    pub phases: Vec<PhaseRecord>,
    pub seeds: Vec<u32>,
    pub runtime_secs: f64,
}

impl RunReport {
    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }
}

/// One configuration of a batch and how it ended.
#[derive(Debug)]
pub struct BatchEntry {
    pub variant: AttackVariant,
    pub result: Result<RunReport>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
    /// Configurations never started because an earlier one failed
    pub not_run: Vec<AttackVariant>,
    pub runtime_secs: f64,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.result.is_err()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.not_run.is_empty()
    }
}

/// Drives configurations through the three phases.
pub struct Pipeline {
    config: Config,
    store: ArtifactStore,
    seeds: SeedSource,
    fail_on_existing: bool,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        let store = ArtifactStore::new(config.paths.poison_root.clone());
        Self {
            config,
            store,
            seeds: SeedSource::new(),
            fail_on_existing: false,
        }
    }

    /// Treat an existing poisoned set as an error instead of reusing it.
    pub fn fail_on_existing(mut self, fail: bool) -> Self {
        self.fail_on_existing = fail;
        self
    }

    pub fn with_seeds(mut self, seeds: SeedSource) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.phases.timeout_secs.map(Duration::from_secs)
    }

    /// Run the configured clean-set command, if any.
    pub async fn prepare_clean(&self, params: &AttackParams) -> Result<PhaseOutcome> {
        let Some(spec) = &self.config.phases.clean_set else {
            return Ok(PhaseOutcome::Skipped {
                reason: "no clean_set command configured".to_string(),
            });
        };
        let args = vec!["-dataset".to_string(), params.dataset.to_string()];
        let env: [(&str, &Path); 0] = [];
        run_external(Phase::CleanPrepare.as_str(), spec, &args, &env, self.timeout()).await?;
        Ok(PhaseOutcome::Completed)
    }

    /// Build and persist the poisoned set for `params`.
    ///
    /// Configuration problems surface before the clean set is read and
    /// before any directory is created. The directory is only claimed once
    /// the set is fully generated.
    pub fn construct(&self, params: &AttackParams) -> Result<Constructed> {
        params.validate()?;

        let dir = self.store.dir_for(params);
        if dir.exists() {
            return self.existing(dir);
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let generator = build_generator(params, &self.config, &mut rng)?;
        let clean = load_clean_set(&self.config.clean_set_dir(params.dataset), params.dataset)?;

        let set = if params.is_reduced() {
            let reducer = StratifiedReducer::new(params.data_rate)?;
            let (subset, report) = reducer.reduce(&clean, &mut rng)?;
            info!(
                original = report.original_total(),
                kept = report.kept_total(),
                "Poisoning reduced set"
            );
            generator.generate(&subset, &mut rng)?
        } else {
            generator.generate(&clean, &mut rng)?
        };

        let handle = match self.store.create(params) {
            Ok(handle) => handle,
            Err(PoisonsetError::ArtifactExists(dir)) => return self.existing(dir),
            Err(e) => return Err(e),
        };
        // another run may commit the same configuration while this one writes
        let manifest = match self.store.write(&handle, &set) {
            Ok(manifest) => manifest,
            Err(PoisonsetError::ArtifactExists(dir)) => return self.existing(dir),
            Err(e) => return Err(e),
        };

        Ok(Constructed {
            dir: handle.path().to_path_buf(),
            outcome: PhaseOutcome::Completed,
            manifest: Some(manifest),
        })
    }

    /// [`construct`](Self::construct), moved off the async worker when the
    /// runtime can block in place. A current-thread runtime runs it inline.
    fn construct_blocking(&self, params: &AttackParams) -> Result<Constructed> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.construct(params))
            }
            _ => self.construct(params),
        }
    }

    fn existing(&self, dir: PathBuf) -> Result<Constructed> {
        if !ArtifactStore::is_complete(&dir) {
            return Err(PoisonsetError::IncompleteArtifact(dir));
        }
        if self.fail_on_existing {
            return Err(PoisonsetError::ArtifactExists(dir));
        }
        warn!(
            path = %dir.display(),
            "Poisoned set directory already exists, reusing it"
        );
        Ok(Constructed {
            dir,
            outcome: PhaseOutcome::Skipped {
                reason: "poisoned set already exists".to_string(),
            },
            manifest: None,
        })
    }

    /// Trainer arguments for one run.
    pub fn trainer_args(params: &AttackParams, seed: u32) -> Vec<String> {
        let mut args = vec![
            "-dataset".to_string(),
            params.dataset.to_string(),
            "-poison_type".to_string(),
            params.variant.to_string(),
            "-poison_rate".to_string(),
            params.poison_rate.to_string(),
            "-seed".to_string(),
            seed.to_string(),
            "-log".to_string(),
        ];
        if params.variant.uses_cover() {
            args.push("-cover_rate".to_string());
            args.push(params.cover_rate.to_string());
        }
        if params.variant.uses_alpha() {
            args.push("-alpha".to_string());
            args.push(params.alpha.to_string());
        }
        if params.is_reduced() {
            args.push("-data_rate".to_string());
            args.push(params.data_rate.to_string());
        }
        args
    }

    /// Invoke the trainer `num_models` times, each with a fresh seed.
    pub async fn train(&self, run: &RunConfig, dir: &Path) -> Result<Vec<u32>> {
        let spec = &self.config.phases.trainer;
        let env = [(POISON_SET_DIR_ENV, dir)];

        let pb = ProgressBar::new(run.num_models as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }

        let mut seeds = Vec::with_capacity(run.num_models);
        for model in 0..run.num_models {
            let seed = self.seeds.next_seed();
            info!(
                variant = %run.params.variant,
                model = model + 1,
                of = run.num_models,
                seed,
                "Training run"
            );
            pb.set_message(format!("seed {seed}"));
            let args = Self::trainer_args(&run.params, seed);
            if let Err(e) =
                run_external(Phase::TrainRepeat.as_str(), spec, &args, &env, self.timeout()).await
            {
                pb.abandon_with_message(format!("failed at model {}", model + 1));
                return Err(e);
            }
            seeds.push(seed);
            pb.inc(1);
        }
        pb.finish_with_message(format!("{} models trained", seeds.len()));
        Ok(seeds)
    }

    /// Run one configuration through every phase.
    pub async fn run(&self, run: &RunConfig) -> Result<RunReport> {
        let start = Instant::now();
        let params = &run.params;
        info!(
            dataset = %params.dataset,
            variant = %params.variant,
            poison_rate = params.poison_rate,
            num_models = run.num_models,
            "Starting run"
        );
        params.validate()?;

        let mut phases = Vec::with_capacity(3);

        let phase_start = Instant::now();
        let outcome = self.prepare_clean(params).await?;
        phases.push(PhaseRecord {
            phase: Phase::CleanPrepare,
            outcome,
            elapsed_secs: phase_start.elapsed().as_secs_f64(),
        });

        let phase_start = Instant::now();
        let constructed = self.construct_blocking(params)?;
        phases.push(PhaseRecord {
            phase: Phase::PoisonConstruct,
            outcome: constructed.outcome.clone(),
            elapsed_secs: phase_start.elapsed().as_secs_f64(),
        });

        let phase_start = Instant::now();
        let seeds = self.train(run, &constructed.dir).await?;
        phases.push(PhaseRecord {
            phase: Phase::TrainRepeat,
            outcome: PhaseOutcome::Completed,
            elapsed_secs: phase_start.elapsed().as_secs_f64(),
        });

        let report = RunReport {
            params: params.clone(),
            artifact_dir: constructed.dir,
            phases,
            seeds,
            runtime_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            variant = %params.variant,
            dir = %report.artifact_dir.display(),
            runtime = format!("{:.1}s", report.runtime_secs),
            "Run complete"
        );
        Ok(report)
    }

    /// Run every configuration of a batch.
    ///
    /// With `continue_on_error` a failed configuration is recorded and the
    /// next one starts; otherwise the batch stops at the first failure.
    pub async fn run_batch(&self, batch: &BatchConfig, continue_on_error: bool) -> BatchReport {
        let start = Instant::now();
        let runs = batch.expand(&self.config.attack);
        let mut report = BatchReport::default();

        for (position, run) in runs.iter().enumerate() {
            info!(variant = %run.params.variant, "=== Running for poison_type ===");
            let result = self.run(run).await;
            let failed = match &result {
                Ok(_) => false,
                Err(e) => {
                    warn!(variant = %run.params.variant, error = %e, "Run failed");
                    true
                }
            };
            report.entries.push(BatchEntry {
                variant: run.params.variant,
                result,
            });
            if failed && !continue_on_error {
                report.not_run = runs[position + 1..]
                    .iter()
                    .map(|r| r.params.variant)
                    .collect();
                break;
            }
        }

        report.runtime_secs = start.elapsed().as_secs_f64();
        report
    }
}
