//! Pipeline module - clean set, poisoned set and training phases.

mod external;
mod runner;
mod seed;

pub use external::*;
pub use runner::*;
pub use seed::*;
