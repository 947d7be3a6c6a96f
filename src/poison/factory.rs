//! Variant dispatch.
//!
//! [`build_generator`] is the only place that maps an [`AttackVariant`] to an
//! implementation. Every prerequisite (trigger files, checkpoints, adversarial
//! images) is loaded here, so a missing asset fails before any sample is
//! processed or any directory is created.

use super::generator::PoisonGenerator;
use super::select::{Eligibility, Selection};
use super::trigger::{corner_patches, TriggerMark};
use super::variants::{
    CleanLabelGenerator, IdentityGenerator, MarkGenerator, MarkMode, PatchSetGenerator,
    PieceBlendGenerator, ResidualGenerator, SigGenerator, WarpGenerator,
};
use super::warp::WarpGrids;
use crate::models::{
    AttackParams, AttackVariant, Config, DatasetId, LabelPolicy, PoisonsetError, Result,
};
use crate::store::load_tensor;
use ndarray::{Array3, Array4, Ix3, Ix4};
use rand::rngs::StdRng;
use std::path::Path;
use tracing::{debug, info};

/// Patch locations used by adaptive_k_way.
const K_WAY: usize = 4;

const DYNAMIC_REMEDY: &str = "download the pretrained generator from \
     https://github.com/VinAIResearch/input-aware-backdoor-attack-release";

/// Build the generator for `params`, loading every asset it depends on.
pub fn build_generator(
    params: &AttackParams,
    config: &Config,
    rng: &mut StdRng,
) -> Result<Box<dyn PoisonGenerator>> {
    params.validate()?;

    let dataset = params.dataset;
    let variant = params.variant;
    let target = config.target_class(dataset)?;
    if target as usize >= dataset.num_classes() {
        return Err(PoisonsetError::InvalidParameter(format!(
            "target class {target} out of range for {dataset}"
        )));
    }

    info!(
        dataset = %dataset,
        variant = %variant,
        target_class = target,
        poison_rate = params.poison_rate,
        "Building poison generator"
    );

    let shape = dataset.image_shape();
    let rate = params.poison_rate;
    let alpha = params.alpha as f32;
    let dirty = || {
        Selection::new(
            Eligibility::ExcludeClass(target),
            rate,
            LabelPolicy::Fixed { target },
        )
    };
    let clean_label = || Selection::new(Eligibility::OnlyClass(target), rate, LabelPolicy::Keep);

    let generator: Box<dyn PoisonGenerator> = match variant {
        AttackVariant::None => Box::new(IdentityGenerator),

        AttackVariant::Basic => Box::new(MarkGenerator::new(
            variant,
            dirty(),
            required_trigger(params, config)?,
            MarkMode::Stamp { alpha },
        )),

        AttackVariant::Badnet | AttackVariant::Trojan => Box::new(MarkGenerator::new(
            variant,
            dirty(),
            required_trigger(params, config)?,
            MarkMode::Stamp { alpha: 1.0 },
        )),

        AttackVariant::BadnetAllToAll => Box::new(MarkGenerator::new(
            variant,
            Selection::new(
                Eligibility::All,
                rate,
                LabelPolicy::AllToAll {
                    num_classes: dataset.num_classes() as u32,
                },
            ),
            required_trigger(params, config)?,
            MarkMode::Stamp { alpha: 1.0 },
        )),

        AttackVariant::Blend => Box::new(MarkGenerator::new(
            variant,
            dirty(),
            required_trigger(params, config)?,
            MarkMode::Blend { alpha },
        )),

        AttackVariant::Tact => {
            let selection = Selection::new(
                Eligibility::OnlyClass(config.classes.source_class),
                rate,
                LabelPolicy::Fixed { target },
            )
            .with_cover(
                Eligibility::Classes(config.classes.cover_classes.clone()),
                params.cover_rate,
            );
            Box::new(MarkGenerator::new(
                variant,
                selection,
                required_trigger(params, config)?,
                MarkMode::Stamp { alpha: 1.0 },
            ))
        }

        AttackVariant::Sig => Box::new(SigGenerator::new(clean_label())),

        AttackVariant::WaNet => {
            let grids = WarpGrids::random(dataset.img_size(), WarpGenerator::CONTROL_POINTS, rng);
            Box::new(WarpGenerator::new(
                dirty().with_cover(Eligibility::All, params.cover_rate),
                grids,
            ))
        }

        AttackVariant::Adaptive => Box::new(MarkGenerator::new(
            variant,
            dirty().with_cover(Eligibility::All, params.cover_rate),
            required_trigger(params, config)?,
            MarkMode::Stamp { alpha },
        )),

        AttackVariant::AdaptiveBlend => Box::new(PieceBlendGenerator::new(
            dirty().with_cover(Eligibility::All, params.cover_rate),
            required_trigger(params, config)?,
            alpha,
        )),

        AttackVariant::AdaptivePatch => {
            let triggers = config
                .adaptive_patch_triggers(dataset)
                .into_iter()
                .map(|t| {
                    TriggerMark::load(&config.paths.triggers_dir, &t.trigger, shape)
                        .map(|mark| (mark, t.alpha as f32))
                })
                .collect::<Result<Vec<_>>>()?;
            Box::new(PatchSetGenerator::new(
                variant,
                dirty().with_cover(Eligibility::All, params.cover_rate),
                triggers,
            )?)
        }

        AttackVariant::AdaptiveKWay => {
            let triggers = corner_patches(shape, K_WAY)?
                .into_iter()
                .map(|mark| (mark, 1.0))
                .collect();
            Box::new(PatchSetGenerator::new(
                variant,
                dirty().with_cover(Eligibility::All, params.cover_rate),
                triggers,
            )?)
        }

        AttackVariant::CleanLabel => {
            let adversarial = load_adversarial(&config.clean_label_images(dataset), dataset)?;
            Box::new(CleanLabelGenerator::new(
                clean_label(),
                adversarial,
                required_trigger(params, config)?,
            ))
        }

        AttackVariant::Dynamic => {
            let residual = load_residual(config, variant, dataset, DYNAMIC_REMEDY)?;
            Box::new(ResidualGenerator::new(variant, dirty(), residual))
        }

        AttackVariant::Issba => {
            let residual = load_residual(
                config,
                variant,
                dataset,
                "place the pretrained ISSBA encoder under the models directory",
            )?;
            Box::new(
                ResidualGenerator::new(variant, dirty(), residual)
                    .with_secret(ResidualGenerator::SECRET_BITS, rng),
            )
        }
    };

    Ok(generator)
}

/// Trigger named by the run, or the configured default. `"none"` means no
/// trigger.
pub fn resolve_trigger(params: &AttackParams, config: &Config) -> Option<String> {
    params
        .trigger
        .clone()
        .or_else(|| config.default_trigger(params.dataset, params.variant))
        .filter(|name| name != "none")
}

fn required_trigger(params: &AttackParams, config: &Config) -> Result<TriggerMark> {
    let name = resolve_trigger(params, config).ok_or_else(|| {
        PoisonsetError::InvalidParameter(format!("{} needs a trigger", params.variant))
    })?;
    TriggerMark::load(
        &config.paths.triggers_dir,
        &name,
        params.dataset.image_shape(),
    )
}

fn load_adversarial(path: &Path, dataset: DatasetId) -> Result<Array4<f32>> {
    if !path.exists() {
        return Err(PoisonsetError::missing(
            "clean-label adversarial images",
            path,
            format!("Run 'data/{dataset}/clean_label/setup.sh' first"),
        ));
    }
    debug!(path = %path.display(), "Loading adversarial images");
    let images = load_tensor(path)?
        .into_dimensionality::<Ix4>()
        .map_err(|_| PoisonsetError::Codec(format!("{} is not N×C×H×W", path.display())))?;
    let (_, c, h, w) = images.dim();
    if (c, h, w) != dataset.image_shape() {
        return Err(PoisonsetError::InvalidParameter(format!(
            "adversarial images are {c}x{h}x{w}, {dataset} images are {:?}",
            dataset.image_shape()
        )));
    }
    Ok(images)
}

fn load_residual(
    config: &Config,
    variant: AttackVariant,
    dataset: DatasetId,
    remedy: &str,
) -> Result<Array3<f32>> {
    let path = config.checkpoint_path(variant, dataset).ok_or_else(|| {
        PoisonsetError::Internal(format!("{variant} has no checkpoint location"))
    })?;
    if !path.exists() {
        return Err(PoisonsetError::missing(
            format!("{variant} pretrained checkpoint"),
            &path,
            remedy,
        ));
    }
    debug!(path = %path.display(), "Loading generator checkpoint");
    let residual = load_tensor(&path)?
        .into_dimensionality::<Ix3>()
        .map_err(|_| PoisonsetError::Codec(format!("{} is not C×H×W", path.display())))?;
    if residual.dim() != dataset.image_shape() {
        return Err(PoisonsetError::InvalidParameter(format!(
            "checkpoint residual is {:?}, {dataset} images are {:?}",
            residual.dim(),
            dataset.image_shape()
        )));
    }
    Ok(residual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dataset, ErrorKind, TensorDataset};
    use crate::store::save_tensor;
    use ndarray::Axis;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Config rooted in a temp dir with every default trigger for cifar10
    /// present.
    fn fixture() -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.triggers_dir = dir.path().join("triggers");
        config.paths.models_dir = dir.path().join("models");
        config.paths.data_dir = dir.path().join("data");
        std::fs::create_dir_all(&config.paths.triggers_dir).unwrap();
        std::fs::create_dir_all(&config.paths.models_dir).unwrap();

        let mut mark = Array3::<f32>::zeros((3, 32, 32));
        mark.slice_mut(ndarray::s![.., 28.., 28..]).fill(1.0);
        let names: HashSet<String> = AttackVariant::ALL
            .into_iter()
            .filter_map(|v| config.default_trigger(DatasetId::Cifar10, v))
            .chain(
                config
                    .adaptive_patch_triggers(DatasetId::Cifar10)
                    .into_iter()
                    .map(|t| t.trigger),
            )
            .collect();
        for name in names {
            save_tensor(
                &config.paths.triggers_dir.join(name),
                mark.clone().into_dyn().view(),
            )
            .unwrap();
        }
        (dir, config)
    }

    fn cifar_like(n_per_class: usize) -> TensorDataset {
        let n = n_per_class * 10;
        let labels = (0..n).map(|i| (i % 10) as u32).collect();
        TensorDataset::new(Array4::from_elem((n, 3, 32, 32), 0.3), labels).unwrap()
    }

    /// Generator checkpoints and adversarial images for a cifar10 set of
    /// `len` samples.
    fn write_prerequisites(config: &Config, len: usize) {
        let residual = Array3::<f32>::from_elem((3, 32, 32), 0.05).into_dyn();
        for variant in [AttackVariant::Dynamic, AttackVariant::Issba] {
            let path = config.checkpoint_path(variant, DatasetId::Cifar10).unwrap();
            save_tensor(&path, residual.view()).unwrap();
        }
        let adversarial = Array4::<f32>::from_elem((len, 3, 32, 32), 0.6).into_dyn();
        let adv_path = config.clean_label_images(DatasetId::Cifar10);
        std::fs::create_dir_all(adv_path.parent().unwrap()).unwrap();
        save_tensor(&adv_path, adversarial.view()).unwrap();
    }

    #[test]
    fn test_every_variant_keeps_all_samples() {
        let (_dir, config) = fixture();
        let ds = cifar_like(4);

        write_prerequisites(&config, ds.len());

        for variant in AttackVariant::ALL {
            let mut params = config.params_for(DatasetId::Cifar10, variant, 0.25);
            params.cover_rate = if variant.uses_cover() { 0.1 } else { 0.0 };
            let mut rng = StdRng::seed_from_u64(42);
            let generator = build_generator(&params, &config, &mut rng)
                .unwrap_or_else(|e| panic!("{variant}: {e}"));
            let set = generator.generate(&ds, &mut rng).unwrap();

            assert_eq!(set.len(), ds.len(), "{variant}");
            assert_eq!(set.images.len_of(Axis(0)), ds.len(), "{variant}");
            assert!(set.poison_indices().iter().all(|&i| i < ds.len()));
            if let Some(cover) = set.cover_indices() {
                assert!(variant.uses_cover(), "{variant}");
                assert!(cover.iter().all(|i| !set.poison_indices().contains(i)));
            }
            assert!(set.images.iter().all(|v| (0.0..=1.0).contains(v)), "{variant}");
        }
    }

    #[test]
    fn test_every_variant_is_deterministic_for_a_seed() {
        let (_dir, config) = fixture();
        // varied pixels so warps and blends actually move values
        let n = 40;
        let images = Array4::from_shape_fn((n, 3, 32, 32), |(i, c, h, w)| {
            ((i * 7 + c * 13 + h * 3 + w) % 17) as f32 / 16.0
        });
        let labels = (0..n).map(|i| (i % 10) as u32).collect();
        let ds = TensorDataset::new(images, labels).unwrap();
        write_prerequisites(&config, n);

        let run = |params: &AttackParams| {
            let mut rng = StdRng::seed_from_u64(params.seed);
            let generator = build_generator(params, &config, &mut rng).unwrap();
            generator.generate(&ds, &mut rng).unwrap()
        };

        for variant in AttackVariant::ALL {
            let mut params = config.params_for(DatasetId::Cifar10, variant, 0.3);
            params.cover_rate = if variant.uses_cover() { 0.2 } else { 0.0 };
            params.seed = 11;

            let first = run(&params);
            let second = run(&params);
            assert_eq!(first.images, second.images, "{variant}");
            assert_eq!(first.labels, second.labels, "{variant}");
            assert_eq!(first.poison_indices(), second.poison_indices(), "{variant}");
            assert_eq!(first.cover_indices(), second.cover_indices(), "{variant}");
            let names: Vec<&str> = first.side.names().collect();
            assert_eq!(names, second.side.names().collect::<Vec<_>>(), "{variant}");
            for name in names {
                assert_eq!(first.side.get(name), second.side.get(name), "{variant}: {name}");
            }
        }
    }

    #[test]
    fn test_adaptive_k_way_spreads_patches_and_keeps_cover_labels() {
        let (_dir, config) = fixture();
        let ds = cifar_like(10);
        let mut params = config.params_for(DatasetId::Cifar10, AttackVariant::AdaptiveKWay, 0.2);
        params.cover_rate = 0.1;
        let mut rng = StdRng::seed_from_u64(5);
        let set = build_generator(&params, &config, &mut rng)
            .unwrap()
            .generate(&ds, &mut rng)
            .unwrap();

        assert_eq!(set.poison_indices().len(), 18);
        let cover = set.cover_indices().unwrap();
        assert_eq!(cover.len(), 8);
        assert!(cover.iter().all(|&i| set.labels[i] == ds.label(i).unwrap()));
        assert!(set.poison_indices().iter().all(|&i| set.labels[i] == 0));

        // every touched sample carries exactly one 4x4 patch
        for &i in set.poison_indices().iter().chain(cover) {
            let changed = set
                .images
                .index_axis(Axis(0), i)
                .iter()
                .filter(|&&v| v != 0.3)
                .count();
            assert_eq!(changed, 3 * 16, "sample {i}");
        }
    }

    #[test]
    fn test_dirty_label_pool_excludes_target() {
        let (_dir, config) = fixture();
        let ds = cifar_like(10);
        let params = config.params_for(DatasetId::Cifar10, AttackVariant::Badnet, 0.1);
        let mut rng = StdRng::seed_from_u64(0);
        let set = build_generator(&params, &config, &mut rng)
            .unwrap()
            .generate(&ds, &mut rng)
            .unwrap();
        // 90 non-target samples
        assert_eq!(set.poison_indices().len(), 9);
        assert!(set.poison_indices().iter().all(|&i| ds.label(i).unwrap() != 0));
        assert!(set.poison_indices().iter().all(|&i| set.labels[i] == 0));
    }

    #[test]
    fn test_missing_checkpoint_names_remedy() {
        let (_dir, config) = fixture();
        let params = config.params_for(DatasetId::Cifar10, AttackVariant::Dynamic, 0.1);
        let err = build_generator(&params, &config, &mut StdRng::seed_from_u64(0))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let msg = err.to_string();
        assert!(msg.contains("all2one_cifar10_ckpt.pth.tar"));
        assert!(msg.contains("input-aware-backdoor-attack-release"));
    }

    #[test]
    fn test_missing_adversarial_images_names_setup_script() {
        let (_dir, config) = fixture();
        let params = config.params_for(DatasetId::Cifar10, AttackVariant::CleanLabel, 0.1);
        let err = build_generator(&params, &config, &mut StdRng::seed_from_u64(0))
            .err()
            .unwrap();
        assert!(err.to_string().contains("setup.sh"));
    }

    #[test]
    fn test_unsupported_pair_rejected() {
        let (_dir, config) = fixture();
        let params = config.params_for(DatasetId::Stl10, AttackVariant::Issba, 0.1);
        let err = build_generator(&params, &config, &mut StdRng::seed_from_u64(0))
            .err()
            .unwrap();
        assert!(matches!(err, PoisonsetError::UnsupportedCombination { .. }));
    }

    #[test]
    fn test_trigger_size_mismatch_is_configuration_error() {
        let (_dir, config) = fixture();
        let params = config.params_for(DatasetId::Gtsrb, AttackVariant::Blend, 0.1);
        // gtsrb shares the 32px triggers, stl10 images are 96px
        assert!(build_generator(&params, &config, &mut StdRng::seed_from_u64(0)).is_ok());

        let mut params = config.params_for(DatasetId::Stl10, AttackVariant::Blend, 0.1);
        params.trigger = Some("hellokitty_32.png".to_string());
        let err = build_generator(&params, &config, &mut StdRng::seed_from_u64(0))
            .err()
            .unwrap();
        assert!(matches!(err, PoisonsetError::InvalidParameter(_)));
    }

    #[test]
    fn test_resolve_trigger_none_means_no_trigger() {
        let config = Config::default();
        let mut params = config.params_for(DatasetId::Cifar10, AttackVariant::Badnet, 0.1);
        assert_eq!(
            resolve_trigger(&params, &config).as_deref(),
            Some("badnet_patch_32.png")
        );
        params.trigger = Some("none".to_string());
        assert_eq!(resolve_trigger(&params, &config), None);
    }
}
