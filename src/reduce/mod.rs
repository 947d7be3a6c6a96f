//! Class-stratified down-sampling of labeled datasets.

mod stratified;

pub use stratified::*;
