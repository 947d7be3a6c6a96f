//! poisonset - Poisoned training-set construction for backdoor research.
//!
//! ## Architecture
//!
//! A configuration (dataset, attack variant, rates) flows through three phases:
//! - **Clean set**: optional external command that materializes the clean data
//! - **Poison set**: reduce, select, poison and persist, all in-process
//! - **Train**: the external trainer, invoked once per model with a fresh seed
//!
//! ## Modules
//!
//! - `models`: configuration, datasets, plans and errors
//! - `reduce`: class-stratified down-sampling
//! - `poison`: one generator per attack variant
//! - `store`: write-once artifact directories
//! - `pipeline`: phase sequencing and batches

pub mod models;
pub mod pipeline;
pub mod poison;
pub mod reduce;
pub mod store;

// Re-exports for convenience
pub use models::{
    AttackParams, AttackVariant, BatchConfig, Config, DatasetId, PoisonsetError, Result,
    RunConfig,
};
pub use pipeline::{BatchReport, Phase, PhaseOutcome, Pipeline, RunReport, SeedSource};
pub use poison::{build_generator, PoisonGenerator, PoisonedSet};
pub use reduce::StratifiedReducer;
pub use store::{ArtifactStore, LoadedArtifact, Manifest};
