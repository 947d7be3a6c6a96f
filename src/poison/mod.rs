//! Poisoned-set construction.
//!
//! - `generator`: the contract every variant implements
//! - `select`: poison / cover index selection
//! - `variants`: one generator per attack family
//! - `factory`: variant dispatch and prerequisite checks
//! - `trigger`, `warp`: pixel-space building blocks

mod factory;
mod generator;
mod select;
mod trigger;
mod variants;
mod warp;

pub use factory::{build_generator, resolve_trigger};
pub use generator::{PoisonGenerator, PoisonedSet, SampleRole, SideArtifacts};
pub use select::{draw, eligible_pool, sample_count, Eligibility, Selection};
pub use trigger::{add_sinusoid, corner_patches, piece_mask, TriggerMark};
pub use variants::{
    CleanLabelGenerator, IdentityGenerator, MarkGenerator, MarkMode, PatchSetGenerator,
    PieceBlendGenerator, ResidualGenerator, SigGenerator, WarpGenerator,
};
pub use warp::{grid_sample, identity_grid, WarpGrids};
