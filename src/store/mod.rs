//! On-disk artifacts.
//!
//! Provides:
//! - `ArtifactStore`: write-once poisoned-set directories
//! - clean-set loading
//! - the binary tensor format every image file uses

mod artifact;
mod clean;
mod tensor;

pub use artifact::*;
pub use clean::*;
pub use tensor::*;
