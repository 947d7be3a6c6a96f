//! Poison / cover index selection.
//!
//! Both sets are drawn without replacement from an eligible pool, sized
//! `round(pool_len * rate)`. Cover is drawn after poison from what is left,
//! so the two never overlap.

use crate::models::{LabelPolicy, PoisonPlan, Result};
use rand::seq::index;
use rand::Rng;
use std::collections::HashSet;

/// Which samples may be selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    All,
    ExcludeClass(u32),
    OnlyClass(u32),
    Classes(Vec<u32>),
}

impl Eligibility {
    fn admits(&self, label: u32) -> bool {
        match self {
            Self::All => true,
            Self::ExcludeClass(c) => label != *c,
            Self::OnlyClass(c) => label == *c,
            Self::Classes(cs) => cs.contains(&label),
        }
    }
}

/// Positions whose label satisfies `eligibility`, ascending.
pub fn eligible_pool(labels: &[u32], eligibility: &Eligibility) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, &l)| eligibility.admits(l))
        .map(|(i, _)| i)
        .collect()
}

/// `round(pool_len * rate)` (halves to even), clamped to `[0, pool_len]`.
pub fn sample_count(pool_len: usize, rate: f64) -> usize {
    if rate.is_nan() || rate <= 0.0 {
        return 0;
    }
    ((pool_len as f64 * rate).round_ties_even() as usize).min(pool_len)
}

/// Draw `sample_count(pool.len(), rate)` distinct entries of `pool`, sorted.
pub fn draw<R: Rng + ?Sized>(pool: &[usize], rate: f64, rng: &mut R) -> Vec<usize> {
    let amount = sample_count(pool.len(), rate);
    let mut picked: Vec<usize> = index::sample(rng, pool.len(), amount)
        .into_iter()
        .map(|i| pool[i])
        .collect();
    picked.sort_unstable();
    picked
}

/// Selection rule of a variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub poison: Eligibility,
    pub poison_rate: f64,
    /// Cover pool and rate; `None` for variants without a cover set
    pub cover: Option<(Eligibility, f64)>,
    pub policy: LabelPolicy,
}

impl Selection {
    pub fn new(poison: Eligibility, poison_rate: f64, policy: LabelPolicy) -> Self {
        Self {
            poison,
            poison_rate,
            cover: None,
            policy,
        }
    }

    pub fn with_cover(mut self, pool: Eligibility, rate: f64) -> Self {
        self.cover = Some((pool, rate));
        self
    }

    pub fn plan<R: Rng + ?Sized>(&self, labels: &[u32], rng: &mut R) -> Result<PoisonPlan> {
        let pool = eligible_pool(labels, &self.poison);
        let poison = draw(&pool, self.poison_rate, rng);

        let cover = match &self.cover {
            Some((eligibility, rate)) => {
                let taken: HashSet<usize> = poison.iter().copied().collect();
                let pool: Vec<usize> = eligible_pool(labels, eligibility)
                    .into_iter()
                    .filter(|i| !taken.contains(i))
                    .collect();
                Some(draw(&pool, *rate, rng))
            }
            None => None,
        };

        PoisonPlan::new(labels.len(), poison, cover, self.policy)
    }
}
