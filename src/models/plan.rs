//! Immutable plans computed once per run: which samples to keep, which to
//! poison, which to hold out as cover.

use super::{PoisonsetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Per-class keep counts for stratified reduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionPlan {
    keep: BTreeMap<u32, usize>,
}

impl ReductionPlan {
    /// Derive keep counts from per-class counts.
    ///
    /// Each class keeps `round(count * rate)`, at least one when `rate > 0`
    /// and the class is non-empty, never more than `count`. A non-positive
    /// rate keeps nothing.
    pub fn from_counts(counts: &BTreeMap<u32, usize>, rate: f64) -> Self {
        let keep = counts
            .iter()
            .map(|(&class, &count)| (class, keep_count(count, rate)))
            .collect();
        Self { keep }
    }

    pub fn keep(&self, class: u32) -> usize {
        self.keep.get(&class).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.keep.values().sum()
    }

    pub fn per_class(&self) -> &BTreeMap<u32, usize> {
        &self.keep
    }
}

fn keep_count(count: usize, rate: f64) -> usize {
    if rate.is_nan() || rate <= 0.0 || count == 0 {
        return 0;
    }
    let rounded = (count as f64 * rate).round_ties_even() as usize;
    rounded.clamp(1, count)
}

/// How poisoned samples are relabeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LabelPolicy {
    /// Label unchanged (clean-label attacks)
    Keep,
    /// Every poisoned sample becomes `target`
    Fixed { target: u32 },
    /// Cyclic relabel `y -> (y + 1) % num_classes`
    AllToAll { num_classes: u32 },
}

impl LabelPolicy {
    pub fn relabel(self, label: u32) -> u32 {
        match self {
            Self::Keep => label,
            Self::Fixed { target } => target,
            Self::AllToAll { num_classes } => (label + 1) % num_classes,
        }
    }
}

/// Selected poison and cover positions.
///
/// Indices are sorted, unique, in `[0, len)` and the two sets are disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisonPlan {
    poison_indices: Vec<usize>,
    cover_indices: Option<Vec<usize>>,
    policy: LabelPolicy,
}

impl PoisonPlan {
    pub fn new(
        len: usize,
        mut poison_indices: Vec<usize>,
        cover_indices: Option<Vec<usize>>,
        policy: LabelPolicy,
    ) -> Result<Self> {
        normalize(&mut poison_indices, len, "poison")?;
        let cover_indices = match cover_indices {
            Some(mut cover) => {
                normalize(&mut cover, len, "cover")?;
                let poison: HashSet<usize> = poison_indices.iter().copied().collect();
                if let Some(&shared) = cover.iter().find(|i| poison.contains(i)) {
                    return Err(PoisonsetError::Internal(format!(
                        "Index {shared} selected as both poison and cover"
                    )));
                }
                Some(cover)
            }
            None => None,
        };
        Ok(Self {
            poison_indices,
            cover_indices,
            policy,
        })
    }

    pub fn poison_indices(&self) -> &[usize] {
        &self.poison_indices
    }

    pub fn cover_indices(&self) -> Option<&[usize]> {
        self.cover_indices.as_deref()
    }

    pub fn policy(&self) -> LabelPolicy {
        self.policy
    }
}

fn normalize(indices: &mut Vec<usize>, len: usize, what: &str) -> Result<()> {
    indices.sort_unstable();
    if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
        return Err(PoisonsetError::Internal(format!(
            "{what} index {bad} out of range (len {len})"
        )));
    }
    if indices.windows(2).any(|w| w[0] == w[1]) {
        return Err(PoisonsetError::Internal(format!(
            "duplicate {what} index"
        )));
    }
    Ok(())
}
