//! Per-variant generators.
//!
//! Every generator owns a [`Selection`] deciding which samples it touches;
//! the structs below only differ in what they do to one sample.

use super::generator::{PoisonGenerator, SampleRole, SideArtifacts};
use super::select::Selection;
use super::trigger::{add_sinusoid, piece_mask, TriggerMark};
use super::warp::{grid_sample, WarpGrids};
use crate::models::{AttackVariant, LabelPolicy, PoisonPlan, PoisonsetError, Result};
use ndarray::{Array1, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::Rng;

/// Clean baseline: nothing is selected, nothing changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityGenerator;

impl PoisonGenerator for IdentityGenerator {
    fn variant(&self) -> AttackVariant {
        AttackVariant::None
    }

    fn plan(&self, labels: &[u32], _rng: &mut StdRng) -> Result<PoisonPlan> {
        PoisonPlan::new(labels.len(), Vec::new(), None, LabelPolicy::Keep)
    }

    fn apply(&self, _: usize, _: &mut Array3<f32>, _: SampleRole, _: &mut StdRng) -> Result<()> {
        Ok(())
    }
}

/// How a mark is laid onto an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkMode {
    /// Through the trigger mask
    Stamp { alpha: f32 },
    /// Over the whole image
    Blend { alpha: f32 },
}

/// Patch and blend attacks (basic, badnet, badnet_all_to_all, trojan,
/// blend, TaCT, adaptive).
#[derive(Debug, Clone)]
pub struct MarkGenerator {
    variant: AttackVariant,
    selection: Selection,
    trigger: TriggerMark,
    mode: MarkMode,
}

impl MarkGenerator {
    pub fn new(
        variant: AttackVariant,
        selection: Selection,
        trigger: TriggerMark,
        mode: MarkMode,
    ) -> Self {
        Self {
            variant,
            selection,
            trigger,
            mode,
        }
    }
}

impl PoisonGenerator for MarkGenerator {
    fn variant(&self) -> AttackVariant {
        self.variant
    }

    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan> {
        self.selection.plan(labels, rng)
    }

    fn apply(&self, _: usize, image: &mut Array3<f32>, _: SampleRole, _: &mut StdRng) -> Result<()> {
        match self.mode {
            MarkMode::Stamp { alpha } => self.trigger.stamp(image, alpha),
            MarkMode::Blend { alpha } => self.trigger.blend(image, alpha),
        }
        Ok(())
    }
}

/// Blend the mark over a random subset of image tiles, redrawn per sample.
#[derive(Debug, Clone)]
pub struct PieceBlendGenerator {
    selection: Selection,
    trigger: TriggerMark,
    alpha: f32,
    pieces: usize,
    mask_rate: f64,
}

impl PieceBlendGenerator {
    pub const PIECES: usize = 16;
    pub const MASK_RATE: f64 = 0.5;

    pub fn new(selection: Selection, trigger: TriggerMark, alpha: f32) -> Self {
        Self {
            selection,
            trigger,
            alpha,
            pieces: Self::PIECES,
            mask_rate: Self::MASK_RATE,
        }
    }
}

impl PoisonGenerator for PieceBlendGenerator {
    fn variant(&self) -> AttackVariant {
        AttackVariant::AdaptiveBlend
    }

    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan> {
        self.selection.plan(labels, rng)
    }

    fn apply(
        &self,
        _: usize,
        image: &mut Array3<f32>,
        _: SampleRole,
        rng: &mut StdRng,
    ) -> Result<()> {
        let (_, h, w) = image.dim();
        let region = piece_mask(h, w, self.pieces, self.mask_rate, rng);
        self.trigger.blend_where(image, self.alpha, &region);
        Ok(())
    }
}

/// One trigger from a fixed set per sample, each with its own strength
/// (adaptive_patch, adaptive_k_way).
#[derive(Debug, Clone)]
pub struct PatchSetGenerator {
    variant: AttackVariant,
    selection: Selection,
    triggers: Vec<(TriggerMark, f32)>,
}

impl PatchSetGenerator {
    pub fn new(
        variant: AttackVariant,
        selection: Selection,
        triggers: Vec<(TriggerMark, f32)>,
    ) -> Result<Self> {
        if triggers.is_empty() {
            return Err(PoisonsetError::InvalidParameter(format!(
                "{variant} needs at least one trigger"
            )));
        }
        Ok(Self {
            variant,
            selection,
            triggers,
        })
    }
}

impl PoisonGenerator for PatchSetGenerator {
    fn variant(&self) -> AttackVariant {
        self.variant
    }

    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan> {
        self.selection.plan(labels, rng)
    }

    fn apply(
        &self,
        _: usize,
        image: &mut Array3<f32>,
        _: SampleRole,
        rng: &mut StdRng,
    ) -> Result<()> {
        let (trigger, alpha) = &self.triggers[rng.gen_range(0..self.triggers.len())];
        trigger.stamp(image, *alpha);
        Ok(())
    }
}

/// Horizontal sinusoid added to target-class samples, labels untouched.
#[derive(Debug, Clone)]
pub struct SigGenerator {
    selection: Selection,
    delta: f32,
    frequency: f32,
}

impl SigGenerator {
    pub const DELTA: f32 = 30.0 / 255.0;
    pub const FREQUENCY: f32 = 6.0;

    pub fn new(selection: Selection) -> Self {
        Self {
            selection,
            delta: Self::DELTA,
            frequency: Self::FREQUENCY,
        }
    }
}

impl PoisonGenerator for SigGenerator {
    fn variant(&self) -> AttackVariant {
        AttackVariant::Sig
    }

    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan> {
        self.selection.plan(labels, rng)
    }

    fn apply(&self, _: usize, image: &mut Array3<f32>, _: SampleRole, _: &mut StdRng) -> Result<()> {
        add_sinusoid(image, self.delta, self.frequency);
        Ok(())
    }
}

/// Replaces selected samples with precomputed adversarial versions, then
/// stamps the mark.
#[derive(Debug, Clone)]
pub struct CleanLabelGenerator {
    selection: Selection,
    adversarial: Array4<f32>,
    trigger: TriggerMark,
}

impl CleanLabelGenerator {
    pub fn new(selection: Selection, adversarial: Array4<f32>, trigger: TriggerMark) -> Self {
        Self {
            selection,
            adversarial,
            trigger,
        }
    }
}

impl PoisonGenerator for CleanLabelGenerator {
    fn variant(&self) -> AttackVariant {
        AttackVariant::CleanLabel
    }

    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan> {
        let available = self.adversarial.len_of(Axis(0));
        if available != labels.len() {
            return Err(PoisonsetError::Data(format!(
                "{available} adversarial images for a dataset of {} samples",
                labels.len()
            )));
        }
        self.selection.plan(labels, rng)
    }

    fn apply(
        &self,
        index: usize,
        image: &mut Array3<f32>,
        _: SampleRole,
        _: &mut StdRng,
    ) -> Result<()> {
        let replacement = self.adversarial.index_axis(Axis(0), index);
        if replacement.dim() != image.dim() {
            return Err(PoisonsetError::Data(format!(
                "adversarial image {index} is {:?}, dataset images are {:?}",
                replacement.dim(),
                image.dim()
            )));
        }
        image.assign(&replacement);
        self.trigger.stamp(image, 1.0);
        Ok(())
    }
}

/// Smooth spatial warp. Cover samples get an extra per-sample jitter so the
/// fixed field alone stays the trigger.
#[derive(Debug, Clone)]
pub struct WarpGenerator {
    selection: Selection,
    grids: WarpGrids,
    field: Array3<f32>,
}

impl WarpGenerator {
    pub const STRENGTH: f32 = 0.5;
    pub const CONTROL_POINTS: usize = 4;
    pub const GRID_RESCALE: f32 = 1.0;

    pub fn new(selection: Selection, grids: WarpGrids) -> Self {
        let field = grids.field(Self::STRENGTH, Self::GRID_RESCALE);
        Self {
            selection,
            grids,
            field,
        }
    }
}

impl PoisonGenerator for WarpGenerator {
    fn variant(&self) -> AttackVariant {
        AttackVariant::WaNet
    }

    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan> {
        self.selection.plan(labels, rng)
    }

    fn apply(
        &self,
        _: usize,
        image: &mut Array3<f32>,
        role: SampleRole,
        rng: &mut StdRng,
    ) -> Result<()> {
        let (_, h, w) = image.dim();
        if self.field.dim() != (h, w, 2) {
            return Err(PoisonsetError::Internal(format!(
                "warp field is {:?}, image is {h}x{w}",
                self.field.dim()
            )));
        }
        let warped = match role {
            SampleRole::Poison => grid_sample(image, &self.field),
            SampleRole::Cover => {
                let scale = h.max(1) as f32;
                let jittered = self
                    .field
                    .mapv(|v| (v + (rng.gen::<f32>() * 2.0 - 1.0) / scale).clamp(-1.0, 1.0));
                grid_sample(image, &jittered)
            }
        };
        *image = warped;
        Ok(())
    }

    fn side_artifacts(&self) -> SideArtifacts {
        let mut side = SideArtifacts::new();
        side.insert("identity_grid", self.grids.identity().clone().into_dyn());
        side.insert("noise_grid", self.grids.noise().clone().into_dyn());
        side
    }
}

/// Additive perturbation produced by a pretrained trigger generator.
#[derive(Debug, Clone)]
pub struct ResidualGenerator {
    variant: AttackVariant,
    selection: Selection,
    residual: Array3<f32>,
    secret: Option<Array1<f32>>,
}

impl ResidualGenerator {
    pub const SECRET_BITS: usize = 20;

    pub fn new(variant: AttackVariant, selection: Selection, residual: Array3<f32>) -> Self {
        Self {
            variant,
            selection,
            residual,
            secret: None,
        }
    }

    /// Attach a random bit string persisted as side data `secret`.
    pub fn with_secret<R: Rng + ?Sized>(mut self, bits: usize, rng: &mut R) -> Self {
        let secret = Array1::from_shape_fn(bits, |_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 });
        self.secret = Some(secret);
        self
    }

    pub fn secret(&self) -> Option<&Array1<f32>> {
        self.secret.as_ref()
    }
}

impl PoisonGenerator for ResidualGenerator {
    fn variant(&self) -> AttackVariant {
        self.variant
    }

    fn plan(&self, labels: &[u32], rng: &mut StdRng) -> Result<PoisonPlan> {
        self.selection.plan(labels, rng)
    }

    fn apply(&self, _: usize, image: &mut Array3<f32>, _: SampleRole, _: &mut StdRng) -> Result<()> {
        if self.residual.dim() != image.dim() {
            return Err(PoisonsetError::Data(format!(
                "generator residual is {:?}, image is {:?}",
                self.residual.dim(),
                image.dim()
            )));
        }
        *image += &self.residual;
        Ok(())
    }

    fn side_artifacts(&self) -> SideArtifacts {
        let mut side = SideArtifacts::new();
        if let Some(secret) = &self.secret {
            side.insert("secret", secret.clone().into_dyn());
        }
        side
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{synthetic, Dataset};
    use crate::poison::select::Eligibility;
    use ndarray::Array2;
    use rand::SeedableRng;

    fn patch(size: usize) -> TriggerMark {
        let mut mark = Array3::<f32>::zeros((3, size, size));
        mark[[0, size - 1, size - 1]] = 1.0;
        mark[[1, size - 1, size - 1]] = 1.0;
        mark[[2, size - 1, size - 1]] = 1.0;
        TriggerMark::new("dot", mark, None).unwrap()
    }

    fn dirty(rate: f64) -> Selection {
        Selection::new(Eligibility::ExcludeClass(0), rate, LabelPolicy::Fixed { target: 0 })
    }

    #[test]
    fn test_badnet_relabels_and_stamps() {
        let ds = synthetic(&[20, 20, 20], 4);
        let generator = MarkGenerator::new(
            AttackVariant::Badnet,
            dirty(0.5),
            patch(4),
            MarkMode::Stamp { alpha: 1.0 },
        );
        let set = generator.generate(&ds, &mut StdRng::seed_from_u64(0)).unwrap();

        assert_eq!(set.len(), ds.len());
        assert_eq!(set.images.len_of(Axis(0)), ds.len());
        assert_eq!(set.poison_indices().len(), 20);
        for &i in set.poison_indices() {
            assert_eq!(set.labels[i], 0);
            assert_eq!(set.images[[i, 0, 3, 3]], 1.0);
            assert_ne!(ds.label(i).unwrap(), 0);
        }
        // untouched samples are byte-identical
        let clean = (0..ds.len()).find(|i| !set.poison_indices().contains(i)).unwrap();
        assert_eq!(set.images.index_axis(Axis(0), clean), ds.image(clean).unwrap());
        assert_eq!(set.labels[clean], ds.label(clean).unwrap());
    }

    #[test]
    fn test_all_to_all_shifts_labels() {
        let ds = synthetic(&[10, 10, 10], 4);
        let selection =
            Selection::new(Eligibility::All, 1.0, LabelPolicy::AllToAll { num_classes: 3 });
        let generator = MarkGenerator::new(
            AttackVariant::BadnetAllToAll,
            selection,
            patch(4),
            MarkMode::Stamp { alpha: 1.0 },
        );
        let set = generator.generate(&ds, &mut StdRng::seed_from_u64(1)).unwrap();
        for i in 0..ds.len() {
            assert_eq!(set.labels[i], (ds.label(i).unwrap() + 1) % 3);
        }
    }

    #[test]
    fn test_sig_keeps_labels_and_value_range() {
        let ds = synthetic(&[10, 10], 8);
        let selection = Selection::new(Eligibility::OnlyClass(0), 0.5, LabelPolicy::Keep);
        let set = SigGenerator::new(selection)
            .generate(&ds, &mut StdRng::seed_from_u64(2))
            .unwrap();
        assert_eq!(set.labels, ds.labels().unwrap());
        assert_eq!(set.poison_indices().len(), 5);
        assert!(set.poison_indices().iter().all(|&i| ds.label(i).unwrap() == 0));
        assert!(set.images.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_warp_cover_and_side_data() {
        let ds = synthetic(&[30, 30], 8);
        let mut rng = StdRng::seed_from_u64(3);
        let grids = WarpGrids::random(8, WarpGenerator::CONTROL_POINTS, &mut rng);
        let selection = dirty(0.2).with_cover(Eligibility::All, 0.1);
        let set = WarpGenerator::new(selection, grids)
            .generate(&ds, &mut rng)
            .unwrap();

        assert_eq!(set.poison_indices().len(), 6);
        let cover = set.cover_indices().unwrap();
        assert_eq!(cover.len(), 5);
        assert!(cover.iter().all(|i| !set.poison_indices().contains(i)));
        for &i in cover {
            assert_eq!(set.labels[i], ds.label(i).unwrap());
        }
        assert_eq!(set.side.get("identity_grid").unwrap().shape(), &[1, 8, 8, 2]);
        assert_eq!(set.side.get("noise_grid").unwrap().shape(), &[1, 8, 8, 2]);
    }

    #[test]
    fn test_clean_label_requires_matching_count() {
        let ds = synthetic(&[4, 4], 4);
        let selection = Selection::new(Eligibility::OnlyClass(0), 1.0, LabelPolicy::Keep);
        let short = Array4::<f32>::zeros((5, 3, 4, 4));
        let generator = CleanLabelGenerator::new(selection.clone(), short, patch(4));
        let err = generator
            .generate(&ds, &mut StdRng::seed_from_u64(4))
            .unwrap_err();
        assert!(matches!(err, PoisonsetError::Data(_)));

        let adversarial = Array4::<f32>::from_elem((8, 3, 4, 4), 0.5);
        let set = CleanLabelGenerator::new(selection, adversarial, patch(4))
            .generate(&ds, &mut StdRng::seed_from_u64(4))
            .unwrap();
        for &i in set.poison_indices() {
            assert_eq!(set.images[[i, 0, 0, 0]], 0.5);
            assert_eq!(set.images[[i, 0, 3, 3]], 1.0);
        }
    }

    #[test]
    fn test_residual_secret_is_side_data() {
        let ds = synthetic(&[6, 6], 4);
        let mut rng = StdRng::seed_from_u64(5);
        let generator = ResidualGenerator::new(
            AttackVariant::Issba,
            dirty(1.0),
            Array3::from_elem((3, 4, 4), 0.01),
        )
        .with_secret(ResidualGenerator::SECRET_BITS, &mut rng);
        let set = generator.generate(&ds, &mut rng).unwrap();

        let secret = set.side.get("secret").unwrap();
        assert_eq!(secret.len(), 20);
        assert!(secret.iter().all(|&b| b == 0.0 || b == 1.0));
        assert_eq!(set.poison_indices().len(), 6);
    }

    #[test]
    fn test_patch_set_and_piece_blend_preserve_shape() {
        let ds = synthetic(&[10, 10], 8);
        let mut rng = StdRng::seed_from_u64(6);
        let triggers = vec![(patch(8), 1.0), (patch(8), 0.5)];
        let set = PatchSetGenerator::new(
            AttackVariant::AdaptivePatch,
            dirty(0.5).with_cover(Eligibility::All, 0.5),
            triggers,
        )
        .unwrap()
        .generate(&ds, &mut rng)
        .unwrap();
        assert_eq!(set.images.dim(), (20, 3, 8, 8));

        let full = TriggerMark::new("full", Array3::ones((3, 8, 8)), Some(Array2::ones((8, 8))))
            .unwrap();
        let set = PieceBlendGenerator::new(dirty(1.0).with_cover(Eligibility::All, 1.0), full, 1.0)
            .generate(&ds, &mut rng)
            .unwrap();
        let i = set.poison_indices()[0];
        let blended = set.images.index_axis(Axis(0), i).iter().filter(|&&v| v == 1.0).count();
        // half of the 16 tiles, 3 channels of 2x2 pixels each
        assert!(blended >= 96);
        assert_eq!(set.cover_indices().unwrap().len(), 10);
    }

    #[test]
    fn test_identity_changes_nothing() {
        let ds = synthetic(&[3, 3], 4);
        let set = IdentityGenerator
            .generate(&ds, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert!(set.poison_indices().is_empty());
        assert_eq!(set.labels, ds.labels().unwrap());
        assert_eq!(&set.images, ds.images());
    }
}
