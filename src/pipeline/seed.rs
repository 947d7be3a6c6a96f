//! Training seeds.
//!
//! Seeds are 32-bit so every trainer can hand them to any RNG. A source is
//! based on the high-resolution clock and the process id once, then walks a
//! counter through a bijective mixer: seeds from one source never repeat
//! within 2^32 draws, and two sources started in the same second still
//! diverge.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct SeedSource {
    base: u32,
    counter: AtomicU32,
}

impl SeedSource {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let folded = (nanos as u64 ^ (nanos >> 64) as u64) ^ u64::from(std::process::id()).rotate_left(32);
        Self::with_base((folded ^ (folded >> 32)) as u32)
    }

    /// Deterministic source, for reproducible batches.
    pub fn with_base(base: u32) -> Self {
        Self {
            base,
            counter: AtomicU32::new(0),
        }
    }

    pub fn next_seed(&self) -> u32 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        fmix32(self.base.wrapping_add(n))
    }
}

impl Default for SeedSource {
    fn default() -> Self {
        Self::new()
    }
}

/// MurmurHash3 finalizer; a bijection on `u32`.
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
