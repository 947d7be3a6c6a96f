//! Configuration models for poisonset.
//!
//! Everything that used to be ambient (class tables, trigger names, asset
//! paths, external commands) is loaded once from a TOML file and passed by
//! reference into the components that need it.

use super::{AttackParams, AttackVariant, DatasetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for poisonset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Target / source / cover class tables
    #[serde(default)]
    pub classes: ClassConfig,

    /// Attack defaults and per-dataset trigger assets
    #[serde(default)]
    pub attack: AttackConfig,

    /// External phase commands
    #[serde(default)]
    pub phases: PhasesConfig,

    /// Batch of runs driven by `poisonset run`
    #[serde(default)]
    pub batch: Option<BatchConfig>,
}

/// Directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Clean sets live at `<data_dir>/<dataset>/train`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Poisoned sets live at `<poison_root>/<dataset>/<run>`
    #[serde(default = "default_poison_root")]
    pub poison_root: PathBuf,

    /// Trigger marks and masks
    #[serde(default = "default_triggers_dir")]
    pub triggers_dir: PathBuf,

    /// Pretrained generator checkpoints
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_poison_root() -> PathBuf {
    PathBuf::from("poisoned_train_set")
}

fn default_triggers_dir() -> PathBuf {
    PathBuf::from("triggers")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            poison_root: default_poison_root(),
            triggers_dir: default_triggers_dir(),
            models_dir: default_models_dir(),
        }
    }
}

/// Class tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Target class per dataset id
    #[serde(default = "default_targets")]
    pub target: BTreeMap<String, u32>,

    /// Source class for source-restricted attacks (TaCT)
    #[serde(default = "default_source_class")]
    pub source_class: u32,

    /// Classes whose samples are eligible as cover for TaCT
    #[serde(default = "default_cover_classes")]
    pub cover_classes: Vec<u32>,
}

fn default_targets() -> BTreeMap<String, u32> {
    [("cifar10", 0), ("gtsrb", 2), ("stl10", 0), ("imagenette", 0)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn default_source_class() -> u32 {
    1
}

fn default_cover_classes() -> Vec<u32> {
    vec![5, 7]
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            target: default_targets(),
            source_class: default_source_class(),
            cover_classes: default_cover_classes(),
        }
    }
}

/// One trigger of the adaptive-patch trigger set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchTrigger {
    pub trigger: String,
    pub alpha: f64,
}

/// Attack defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Blend strength used when a run does not set one
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Cover rate used when a cover variant does not set one
    #[serde(default)]
    pub cover_rate: f64,

    /// Random seed for reduction and poisoning
    #[serde(default)]
    pub seed: u64,

    /// Trigger file per dataset, per variant (`default_triggers.cifar10.blend = "..."`)
    #[serde(default)]
    pub default_triggers: BTreeMap<String, BTreeMap<String, String>>,

    /// Trigger set for adaptive_patch, per dataset
    #[serde(default)]
    pub adaptive_patch: BTreeMap<String, Vec<PatchTrigger>>,

    /// Precomputed adversarial images for clean_label, per dataset
    #[serde(default)]
    pub clean_label: BTreeMap<String, PathBuf>,
}

fn default_alpha() -> f64 {
    0.2
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            cover_rate: 0.0,
            seed: 0,
            default_triggers: BTreeMap::new(),
            adaptive_patch: BTreeMap::new(),
            clean_label: BTreeMap::new(),
        }
    }
}

/// External command (program plus fixed leading arguments).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// External phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Clean-set preparation; skipped when absent
    #[serde(default)]
    pub clean_set: Option<CommandSpec>,

    /// Training run, invoked once per model
    #[serde(default = "default_trainer")]
    pub trainer: CommandSpec,

    /// Per-invocation timeout; none means wait indefinitely
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_trainer() -> CommandSpec {
    CommandSpec {
        program: "python".to_string(),
        args: vec!["train_on_poisoned_set.py".to_string()],
    }
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            clean_set: None,
            trainer: default_trainer(),
            timeout_secs: None,
        }
    }
}

/// Per-variant overrides inside a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantOverride {
    #[serde(default)]
    pub cover_rate: Option<f64>,
    #[serde(default)]
    pub alpha: Option<f64>,
}

/// Batch of runs sharing a dataset and poison rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub dataset: DatasetId,

    /// Variants to run, in order
    pub poison_types: Vec<AttackVariant>,

    pub poison_rate: f64,

    #[serde(default = "default_data_rate")]
    pub data_rate: f64,

    /// Training runs per variant
    #[serde(default = "default_num_models")]
    pub num_models: usize,

    /// Overrides keyed by variant id (`[batch.overrides.WaNet]`)
    #[serde(default)]
    pub overrides: BTreeMap<String, VariantOverride>,
}

fn default_data_rate() -> f64 {
    1.0
}

fn default_num_models() -> usize {
    1
}

/// One configuration of the pipeline: a poisoned set plus how many models
/// to train on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub params: AttackParams,
    pub num_models: usize,
}

impl BatchConfig {
    /// Expand into one run per variant.
    ///
    /// Cover rates are only carried by variants that sample a cover set;
    /// alpha only by variants that blend.
    pub fn expand(&self, attack: &AttackConfig) -> Vec<RunConfig> {
        self.poison_types
            .iter()
            .map(|&variant| {
                let overrides = self
                    .overrides
                    .get(variant.as_str())
                    .cloned()
                    .unwrap_or_default();
                let mut params = AttackParams::new(self.dataset, variant, self.poison_rate);
                params.data_rate = self.data_rate;
                params.seed = attack.seed;
                if variant.uses_cover() {
                    params.cover_rate = overrides.cover_rate.unwrap_or(attack.cover_rate);
                }
                if variant.uses_alpha() {
                    params.alpha = overrides.alpha.unwrap_or(attack.alpha);
                }
                RunConfig {
                    params,
                    num_models: self.num_models,
                }
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.expand_paths();
        Ok(config)
    }

    /// Expand `${VAR}` references in every configured path.
    fn expand_paths(&mut self) {
        let paths = &mut self.paths;
        for path in [
            &mut paths.data_dir,
            &mut paths.poison_root,
            &mut paths.triggers_dir,
            &mut paths.models_dir,
        ] {
            *path = expand_path(path);
        }
        for path in self.attack.clean_label.values_mut() {
            *path = expand_path(path);
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, &target) in &self.classes.target {
            let dataset: DatasetId = name
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("unknown dataset '{name}' in [classes.target]")))?;
            if target as usize >= dataset.num_classes() {
                return Err(ConfigError::Invalid(format!(
                    "target class {target} out of range for {dataset} ({} classes)",
                    dataset.num_classes()
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.attack.alpha) {
            return Err(ConfigError::Invalid(format!(
                "attack.alpha must be within [0, 1], got {}",
                self.attack.alpha
            )));
        }

        if let Some(batch) = &self.batch {
            if batch.num_models == 0 {
                return Err(ConfigError::Invalid("batch.num_models must be at least 1".to_string()));
            }
            if batch.poison_types.is_empty() {
                return Err(ConfigError::Invalid("batch.poison_types is empty".to_string()));
            }
            for key in batch.overrides.keys() {
                if key.parse::<AttackVariant>().is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "unknown variant '{key}' in [batch.overrides]"
                    )));
                }
            }
            for run in batch.expand(&self.attack) {
                run.params
                    .validate()
                    .map_err(|e| ConfigError::Invalid(format!("{}: {e}", run.params.variant)))?;
            }
        }

        Ok(())
    }

    /// Target class for a dataset.
    pub fn target_class(&self, dataset: DatasetId) -> Result<u32, ConfigError> {
        self.classes
            .target
            .get(dataset.as_str())
            .copied()
            .ok_or_else(|| ConfigError::Invalid(format!("no target class configured for {dataset}")))
    }

    /// Trigger file used when a run does not name one.
    ///
    /// Returns `None` for variants that take no trigger.
    pub fn default_trigger(&self, dataset: DatasetId, variant: AttackVariant) -> Option<String> {
        if let Some(name) = self
            .attack
            .default_triggers
            .get(dataset.as_str())
            .and_then(|per_variant| per_variant.get(variant.as_str()))
        {
            return Some(name.clone());
        }

        let size = dataset.img_size();
        let stem = match variant {
            AttackVariant::Basic => "basic_patch",
            AttackVariant::Badnet | AttackVariant::BadnetAllToAll => "badnet_patch",
            AttackVariant::CleanLabel => "badnet_patch4",
            AttackVariant::Trojan | AttackVariant::Tact => "trojan_square",
            AttackVariant::Blend | AttackVariant::Adaptive | AttackVariant::AdaptiveBlend => {
                "hellokitty"
            }
            _ => return None,
        };
        Some(format!("{stem}_{size}.png"))
    }

    /// Trigger set for adaptive_patch.
    pub fn adaptive_patch_triggers(&self, dataset: DatasetId) -> Vec<PatchTrigger> {
        if let Some(set) = self.attack.adaptive_patch.get(dataset.as_str()) {
            return set.clone();
        }
        let size = dataset.img_size();
        [
            ("phoenix_corner", 0.5),
            ("firefox_corner", 0.2),
            ("badnet_patch4", 0.5),
            ("trojan_square", 0.3),
        ]
        .into_iter()
        .map(|(stem, alpha)| PatchTrigger {
            trigger: format!("{stem}_{size}.png"),
            alpha,
        })
        .collect()
    }

    /// Precomputed adversarial images for clean_label.
    pub fn clean_label_images(&self, dataset: DatasetId) -> PathBuf {
        self.attack
            .clean_label
            .get(dataset.as_str())
            .cloned()
            .unwrap_or_else(|| {
                self.paths
                    .data_dir
                    .join(dataset.as_str())
                    .join("clean_label")
                    .join("fully_poisoned_training_datasets")
                    .join("two_600")
            })
    }

    /// Pretrained checkpoint a variant depends on, if any.
    pub fn checkpoint_path(&self, variant: AttackVariant, dataset: DatasetId) -> Option<PathBuf> {
        let file = match variant {
            AttackVariant::Dynamic => format!("all2one_{dataset}_ckpt.pth.tar"),
            AttackVariant::Issba => format!("ISSBA_{dataset}.pth"),
            _ => return None,
        };
        Some(self.paths.models_dir.join(file))
    }

    /// Directory holding the clean training set of a dataset.
    pub fn clean_set_dir(&self, dataset: DatasetId) -> PathBuf {
        self.paths.data_dir.join(dataset.as_str()).join("train")
    }

    /// Fill in a run's attack parameters from the attack defaults.
    pub fn params_for(
        &self,
        dataset: DatasetId,
        variant: AttackVariant,
        poison_rate: f64,
    ) -> AttackParams {
        let mut params = AttackParams::new(dataset, variant, poison_rate);
        params.seed = self.attack.seed;
        if variant.uses_alpha() {
            params.alpha = self.attack.alpha;
        }
        if variant.uses_cover() {
            params.cover_rate = self.attack.cover_rate;
        }
        params
    }
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[paths]
data_dir = "/srv/data"

[classes]
source_class = 3

[classes.target]
cifar10 = 4

[attack]
alpha = 0.15
seed = 7

[attack.default_triggers.cifar10]
blend = "random_32.png"

[phases]
timeout_secs = 600

[phases.trainer]
program = "python3"
args = ["train.py", "-fast"]

[batch]
dataset = "cifar10"
poison_types = ["badnet", "WaNet", "blend"]
poison_rate = 0.01
num_models = 3

[batch.overrides.WaNet]
cover_rate = 0.05

[batch.overrides.badnet]
cover_rate = 0.5
"#;

    fn write_config(content: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_config() {
        let (_dir, path) = write_config(SAMPLE);
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.paths.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.paths.poison_root, PathBuf::from("poisoned_train_set"));
        assert_eq!(config.classes.source_class, 3);
        assert_eq!(config.target_class(DatasetId::Cifar10).unwrap(), 4);
        // A partial target table replaces the default one
        assert!(config.target_class(DatasetId::Gtsrb).is_err());
        assert_eq!(config.phases.trainer.program, "python3");
        assert_eq!(config.phases.timeout_secs, Some(600));
        config.validate().unwrap();
    }

    #[test]
    fn test_batch_expand_applies_overrides_only_where_meaningful() {
        let (_dir, path) = write_config(SAMPLE);
        let config = Config::from_file(&path).unwrap();
        let runs = config.batch.as_ref().unwrap().expand(&config.attack);

        assert_eq!(runs.len(), 3);
        let badnet = &runs[0].params;
        assert_eq!(badnet.variant, AttackVariant::Badnet);
        assert_eq!(badnet.cover_rate, 0.0);
        assert_eq!(badnet.alpha, 0.0);
        assert_eq!(badnet.seed, 7);

        let wanet = &runs[1].params;
        assert_eq!(wanet.cover_rate, 0.05);

        let blend = &runs[2].params;
        assert_eq!(blend.alpha, 0.15);
        assert!(runs.iter().all(|r| r.num_models == 3));
    }

    #[test]
    fn test_default_triggers() {
        let (_dir, path) = write_config(SAMPLE);
        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.default_trigger(DatasetId::Cifar10, AttackVariant::Blend).as_deref(),
            Some("random_32.png")
        );
        assert_eq!(
            config.default_trigger(DatasetId::Stl10, AttackVariant::Badnet).as_deref(),
            Some("badnet_patch_96.png")
        );
        assert_eq!(config.default_trigger(DatasetId::Cifar10, AttackVariant::Sig), None);
    }

    #[test]
    fn test_validate_rejects_bad_target_and_batch() {
        let mut config = Config::default();
        config.classes.target.insert("cifar10".to_string(), 10);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batch = Some(BatchConfig {
            dataset: DatasetId::Stl10,
            poison_types: vec![AttackVariant::Dynamic],
            poison_rate: 0.1,
            data_rate: 1.0,
            num_models: 1,
            overrides: BTreeMap::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_paths() {
        let config = Config::default();
        assert_eq!(
            config.checkpoint_path(AttackVariant::Dynamic, DatasetId::Cifar10),
            Some(PathBuf::from("models/all2one_cifar10_ckpt.pth.tar"))
        );
        assert_eq!(
            config.checkpoint_path(AttackVariant::Issba, DatasetId::Gtsrb),
            Some(PathBuf::from("models/ISSBA_gtsrb.pth"))
        );
        assert_eq!(config.checkpoint_path(AttackVariant::Badnet, DatasetId::Gtsrb), None);
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown_placeholders() {
        assert_eq!(
            expand_env_vars("${POISONSET_SURELY_UNSET_VAR}/x"),
            "${POISONSET_SURELY_UNSET_VAR}/x"
        );
    }
}
