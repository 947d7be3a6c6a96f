//! The generation contract shared by every attack variant.
//!
//! A variant decides *which* samples to touch ([`PoisonGenerator::plan`]) and
//! *how* to touch one sample ([`PoisonGenerator::apply`]). The provided
//! [`PoisonGenerator::generate`] drives both over a dataset and enforces the
//! output invariants: every sample is kept, shapes are unchanged, values stay
//! in [0, 1], poison and cover sets are disjoint.

use crate::models::{AttackVariant, Dataset, PoisonPlan, PoisonsetError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array3, Array4, ArrayD, Axis};
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use tracing::info;

/// Why a sample is being modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRole {
    /// Trigger applied, label follows the plan's policy
    Poison,
    /// Trigger-like treatment, label kept
    Cover,
}

/// Variant-specific tensors persisted next to the poisoned set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideArtifacts {
    entries: BTreeMap<String, ArrayD<f32>>,
}

impl SideArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.entries.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output of a generator run.
#[derive(Debug, Clone)]
pub struct PoisonedSet {
    pub images: Array4<f32>,
    pub labels: Vec<u32>,
    pub plan: PoisonPlan,
    pub side: SideArtifacts,
}

impl PoisonedSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn poison_indices(&self) -> &[usize] {
        self.plan.poison_indices()
    }

    pub fn cover_indices(&self) -> Option<&[usize]> {
        self.plan.cover_indices()
    }
}

/// One attack variant.
pub trait PoisonGenerator {
    fn variant(&self) -> AttackVariant;

    /// Select poison (and cover) positions given the dataset's labels.
    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan>;

    /// Modify the sample at dataset position `index` in place.
    fn apply(
        &self,
        index: usize,
        image: &mut Array3<f32>,
        role: SampleRole,
        rng: &mut StdRng,
    ) -> Result<()>;

    /// Tensors to persist alongside the set.
    fn side_artifacts(&self) -> SideArtifacts {
        SideArtifacts::new()
    }

    /// Build the full poisoned set.
    fn generate(&self, dataset: &dyn Dataset, rng: &mut StdRng) -> Result<PoisonedSet> {
        let labels = dataset.labels()?;
        let total = labels.len();
        if total == 0 {
            return Err(PoisonsetError::Data(
                "cannot poison an empty dataset".to_string(),
            ));
        }

        let plan = self.plan(&labels, rng)?;
        let mut roles = vec![None; total];
        for &i in plan.poison_indices() {
            roles[i] = Some(SampleRole::Poison);
        }
        for &i in plan.cover_indices().unwrap_or_default() {
            roles[i] = Some(SampleRole::Cover);
        }

        info!(
            variant = %self.variant(),
            samples = total,
            poison = plan.poison_indices().len(),
            cover = plan.cover_indices().map(<[usize]>::len),
            "Generating poisoned set"
        );

        let shape = dataset.image(0)?.dim();
        let mut images = Array4::<f32>::zeros((total, shape.0, shape.1, shape.2));

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }

        for (index, role) in roles.iter().enumerate() {
            let mut image = dataset.image(index)?;
            if image.dim() != shape {
                return Err(PoisonsetError::Data(format!(
                    "sample {index} has shape {:?}, expected {shape:?}",
                    image.dim()
                )));
            }
            if let Some(role) = *role {
                self.apply(index, &mut image, role, rng)?;
                if image.dim() != shape {
                    return Err(PoisonsetError::Internal(format!(
                        "{} changed the shape of sample {index}",
                        self.variant()
                    )));
                }
                image.mapv_inplace(|v| v.clamp(0.0, 1.0));
            }
            images.index_axis_mut(Axis(0), index).assign(&image);
            if index % 1024 == 0 {
                pb.set_position(index as u64);
            }
        }
        pb.finish_and_clear();

        let policy = plan.policy();
        let mut out_labels = labels;
        for &i in plan.poison_indices() {
            out_labels[i] = policy.relabel(out_labels[i]);
        }

        Ok(PoisonedSet {
            images,
            labels: out_labels,
            plan,
            side: self.side_artifacts(),
        })
    }
}
