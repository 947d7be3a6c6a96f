//! Stratified reducer.
//!
//! Keeps `round(count * rate)` samples of every class (at least one for a
//! non-empty class when `rate > 0`), chosen uniformly at random. The output
//! order is shuffled and carries no meaning.

use crate::models::{Dataset, PoisonsetError, ReductionPlan, Result, Subset};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Per-class counts before and after reduction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionReport {
    pub original: BTreeMap<u32, usize>,
    pub kept: BTreeMap<u32, usize>,
}

impl ReductionReport {
    pub fn original_total(&self) -> usize {
        self.original.values().sum()
    }

    pub fn kept_total(&self) -> usize {
        self.kept.values().sum()
    }
}

/// Down-samples a dataset while preserving class proportions.
#[derive(Debug, Clone, Copy)]
pub struct StratifiedReducer {
    rate: f64,
}

impl StratifiedReducer {
    pub fn new(rate: f64) -> Result<Self> {
        if rate.is_nan() {
            return Err(PoisonsetError::InvalidParameter(
                "data_rate must be a number".to_string(),
            ));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Reduce `dataset` to the configured fraction.
    ///
    /// `rate >= 1` returns every sample in original order. `rate <= 0`
    /// returns an empty subset; every class is dropped.
    pub fn reduce<'a, D, R>(
        &self,
        dataset: &'a D,
        rng: &mut R,
    ) -> Result<(Subset<'a, D>, ReductionReport)>
    where
        D: Dataset + ?Sized,
        R: Rng + ?Sized,
    {
        let labels = dataset.labels().map_err(|e| {
            PoisonsetError::Data(format!("Unable to extract labels from dataset: {e}"))
        })?;
        if labels.is_empty() {
            return Err(PoisonsetError::Data(
                "The dataset is empty or does not contain labels".to_string(),
            ));
        }

        let mut by_class: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, &label) in labels.iter().enumerate() {
            by_class.entry(label).or_default().push(index);
        }
        let original: BTreeMap<u32, usize> =
            by_class.iter().map(|(&c, idx)| (c, idx.len())).collect();

        if self.rate >= 1.0 {
            debug!(samples = labels.len(), "data_rate >= 1, keeping every sample");
            let report = ReductionReport {
                kept: original.clone(),
                original,
            };
            let subset = Subset::new(dataset, (0..labels.len()).collect())?;
            return Ok((subset, report));
        }

        info!(
            rate = format!("{:.1}%", self.rate * 100.0),
            "Reducing dataset"
        );

        let plan = ReductionPlan::from_counts(&original, self.rate);
        let mut reduced = Vec::with_capacity(plan.total());
        let mut kept = BTreeMap::new();

        for (class, mut indices) in by_class {
            let keep = plan.keep(class);
            indices.shuffle(rng);
            indices.truncate(keep);
            debug!(class, original = original[&class], kept = keep, "Class reduced");
            kept.insert(class, indices.len());
            reduced.extend(indices);
        }
        reduced.shuffle(rng);

        let report = ReductionReport { original, kept };
        info!(
            original = report.original_total(),
            kept = report.kept_total(),
            classes = report.original.len(),
            "Dataset reduced"
        );

        let subset = Subset::new(dataset, reduced)?;
        Ok((subset, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{synthetic, TensorDataset};
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn class_counts(labels: &[u32]) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for &l in labels {
            *counts.entry(l).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_reduce_keeps_rounded_share_per_class() {
        let ds = synthetic(&[100, 50, 10], 2);
        let mut rng = StdRng::seed_from_u64(0);
        let (subset, report) = StratifiedReducer::new(0.2)
            .unwrap()
            .reduce(&ds, &mut rng)
            .unwrap();

        let counts = class_counts(&subset.labels().unwrap());
        assert_eq!(counts[&0], 20);
        assert_eq!(counts[&1], 10);
        assert_eq!(counts[&2], 2);
        assert_eq!(report.kept, counts);
        assert_eq!(report.original_total(), 160);

        let unique: HashSet<_> = subset.indices().iter().collect();
        assert_eq!(unique.len(), subset.len());
    }

    #[test]
    fn test_reduce_small_class_keeps_one() {
        let ds = synthetic(&[3, 40], 2);
        let mut rng = StdRng::seed_from_u64(1);
        let (subset, _) = StratifiedReducer::new(0.1)
            .unwrap()
            .reduce(&ds, &mut rng)
            .unwrap();
        let counts = class_counts(&subset.labels().unwrap());
        assert_eq!(counts[&0], 1);
        assert_eq!(counts[&1], 4);
    }

    #[test]
    fn test_full_rate_is_pass_through() {
        let ds = synthetic(&[7, 5, 9], 2);
        let mut rng = StdRng::seed_from_u64(2);
        let (subset, report) = StratifiedReducer::new(1.0)
            .unwrap()
            .reduce(&ds, &mut rng)
            .unwrap();
        assert_eq!(subset.len(), ds.len());
        assert_eq!(report.kept, report.original);
        assert_eq!(
            class_counts(&subset.labels().unwrap()),
            class_counts(&ds.labels().unwrap())
        );
    }

    #[test]
    fn test_zero_rate_drops_everything() {
        let ds = synthetic(&[7, 5], 2);
        let mut rng = StdRng::seed_from_u64(3);
        let (subset, report) = StratifiedReducer::new(0.0)
            .unwrap()
            .reduce(&ds, &mut rng)
            .unwrap();
        assert!(subset.is_empty());
        assert_eq!(report.kept_total(), 0);
        assert_eq!(report.kept.len(), 2);
    }

    #[test]
    fn test_reduce_is_deterministic_for_a_seed() {
        let ds = synthetic(&[30, 30, 30], 2);
        let reducer = StratifiedReducer::new(0.5).unwrap();
        let (a, _) = reducer.reduce(&ds, &mut StdRng::seed_from_u64(9)).unwrap();
        let (b, _) = reducer.reduce(&ds, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a.indices(), b.indices());
    }

    #[test]
    fn test_empty_dataset_is_a_data_error() {
        let ds = TensorDataset::new(Array4::zeros((0, 3, 2, 2)), vec![]).unwrap();
        let err = StratifiedReducer::new(0.5)
            .unwrap()
            .reduce(&ds, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, PoisonsetError::Data(_)));
    }

    #[test]
    fn test_nan_rate_rejected() {
        assert!(StratifiedReducer::new(f64::NAN).is_err());
    }
}
