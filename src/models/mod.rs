//! Core data models for poisonset.
//!
//! - Configuration and run parameters
//! - Dataset abstraction
//! - Reduction and poison plans
//! - Error taxonomy

mod config;
mod dataset;
mod error;
mod plan;
mod variant;

pub use config::*;
pub use dataset::*;
pub use error::*;
pub use plan::*;
pub use variant::*;

#[cfg(test)]
pub(crate) use dataset::tests::synthetic;
