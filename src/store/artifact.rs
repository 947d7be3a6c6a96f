//! Poisoned-set directories.
//!
//! One directory per configuration, named from the attack parameters alone.
//! A set is written into a hidden staging sibling and renamed into place
//! once complete, so the configuration directory either does not exist or
//! holds a finished set. Two runs racing on the same configuration cannot
//! both commit: renaming onto a non-empty directory fails.

use super::tensor::{load_tensor, save_tensor};
use crate::models::{AttackParams, DatasetId, PoisonsetError, Result};
use crate::poison::{PoisonedSet, SideArtifacts};
use chrono::{DateTime, Utc};
use ndarray::{Array4, Ix4};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const IMGS_FILE: &str = "imgs";
pub const LABELS_FILE: &str = "labels";
pub const POISON_INDICES_FILE: &str = "poison_indices";
pub const COVER_INDICES_FILE: &str = "cover_indices";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Side-data names probed when a directory has no manifest.
const KNOWN_SIDE_FILES: [&str; 3] = ["identity_grid", "noise_grid", "secret"];

/// File names side data may not take.
const RESERVED_FILES: [&str; 5] = [
    IMGS_FILE,
    LABELS_FILE,
    POISON_INDICES_FILE,
    COVER_INDICES_FILE,
    MANIFEST_FILE,
];

/// Summary written next to the artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub params: AttackParams,
    pub samples: usize,
    pub poison_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_count: Option<usize>,
    /// Side-data file names
    #[serde(default)]
    pub side: Vec<String>,
    /// Every file written, manifest excluded
    pub files: Vec<String>,
}

/// A claimed configuration: the final directory plus the staging
/// directory the set is written into. Dropping an uncommitted handle
/// removes the staging directory.
#[derive(Debug)]
pub struct ArtifactDir {
    path: PathBuf,
    staging: PathBuf,
    params: AttackParams,
}

impl ArtifactDir {
    /// Final location of the set.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn params(&self) -> &AttackParams {
        &self.params
    }
}

impl Drop for ArtifactDir {
    fn drop(&mut self) {
        if self.staging.exists() {
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                warn!(path = %self.staging.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

/// Everything read back from an artifact directory.
#[derive(Debug, Clone)]
pub struct LoadedArtifact {
    pub path: PathBuf,
    pub images: Array4<f32>,
    pub labels: Vec<u32>,
    pub poison_indices: Vec<usize>,
    pub cover_indices: Option<Vec<usize>>,
    pub side: SideArtifacts,
    pub manifest: Option<Manifest>,
}

impl LoadedArtifact {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Root of all poisoned sets (`<root>/<dataset>/<run>`).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a configuration.
    ///
    /// `<root>/<dataset>/<variant>_<poison_rate>` followed by `_alpha=`,
    /// `_cover=` and `_data=` components for the parameters the variant
    /// actually uses. Rates are printed with three decimals.
    pub fn dir_for(&self, params: &AttackParams) -> PathBuf {
        let mut name = format!("{}_{:.3}", params.variant, params.poison_rate);
        if params.variant.uses_alpha() {
            name.push_str(&format!("_alpha={:.3}", params.alpha));
        }
        if params.variant.uses_cover() {
            name.push_str(&format!("_cover={:.3}", params.cover_rate));
        }
        if params.is_reduced() {
            name.push_str(&format!("_data={:.3}", params.data_rate));
        }
        self.root.join(params.dataset.as_str()).join(name)
    }

    pub fn exists(&self, params: &AttackParams) -> bool {
        self.dir_for(params).exists()
    }

    /// Claim the directory for `params`.
    ///
    /// Fails with [`PoisonsetError::ArtifactExists`] without touching the
    /// existing directory. Nothing appears at the final path until
    /// [`write`](Self::write) commits.
    pub fn create(&self, params: &AttackParams) -> Result<ArtifactDir> {
        let path = self.dir_for(params);
        if path.exists() {
            return Err(PoisonsetError::ArtifactExists(path));
        }
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(PoisonsetError::Internal(format!(
                "artifact path {} has no parent",
                path.display()
            )));
        };
        fs::create_dir_all(parent)
            .map_err(|e| PoisonsetError::io(format!("creating {}", parent.display()), e))?;

        let staging = parent.join(format!(
            ".{}.{}.partial",
            name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));
        fs::create_dir(&staging)
            .map_err(|e| PoisonsetError::io(format!("creating {}", staging.display()), e))?;
        debug!(path = %path.display(), staging = %staging.display(), "Claimed artifact directory");
        Ok(ArtifactDir {
            path,
            staging,
            params: params.clone(),
        })
    }

    /// Persist a poisoned set and commit it to its final directory.
    ///
    /// Each file is written to a temp name and renamed, the manifest last;
    /// then the whole staging directory is renamed into place. If another
    /// run committed the same configuration first the result is
    /// [`PoisonsetError::ArtifactExists`] and its set is left untouched.
    pub fn write(&self, dir: &ArtifactDir, set: &PoisonedSet) -> Result<Manifest> {
        for name in set.side.names() {
            check_side_name(name)?;
        }
        let manifest = Self::write_files(&dir.staging, dir.params(), set)?;

        if let Err(e) = fs::rename(&dir.staging, &dir.path) {
            if dir.path.exists() {
                return Err(PoisonsetError::ArtifactExists(dir.path.clone()));
            }
            return Err(PoisonsetError::io(
                format!("committing {}", dir.path.display()),
                e,
            ));
        }

        info!(path = %dir.path.display(), run_id = %manifest.run_id, "Poisoned set written");
        Ok(manifest)
    }

    fn write_files(path: &Path, params: &AttackParams, set: &PoisonedSet) -> Result<Manifest> {
        let mut files = Vec::new();

        save_tensor(&path.join(IMGS_FILE), set.images.view().into_dyn())?;
        files.push(IMGS_FILE.to_string());
        info!(samples = set.len(), "Saved images");

        write_json(&path.join(LABELS_FILE), &set.labels)?;
        files.push(LABELS_FILE.to_string());

        write_json(&path.join(POISON_INDICES_FILE), &set.poison_indices())?;
        files.push(POISON_INDICES_FILE.to_string());
        info!(count = set.poison_indices().len(), "Saved poison indices");

        if let Some(cover) = set.cover_indices() {
            write_json(&path.join(COVER_INDICES_FILE), &cover)?;
            files.push(COVER_INDICES_FILE.to_string());
            info!(count = cover.len(), "Saved cover indices");
        }

        let mut side = Vec::new();
        for (name, tensor) in set.side.iter() {
            save_tensor(&path.join(name), tensor.view())?;
            debug!(name, shape = ?tensor.shape(), "Saved side data");
            side.push(name.to_string());
            files.push(name.to_string());
        }

        let manifest = Manifest {
            run_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            params: params.clone(),
            samples: set.len(),
            poison_count: set.poison_indices().len(),
            cover_count: set.cover_indices().map(<[usize]>::len),
            side,
            files,
        };
        write_json(&path.join(MANIFEST_FILE), &manifest)?;
        Ok(manifest)
    }

    /// True when `dir` holds a finished set: a manifest, or at least the
    /// images, labels and poison indices.
    pub fn is_complete(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).is_file()
            || [IMGS_FILE, LABELS_FILE, POISON_INDICES_FILE]
                .iter()
                .all(|name| dir.join(name).is_file())
    }

    /// Read an artifact directory back and check its internal consistency.
    pub fn load(dir: &Path) -> Result<LoadedArtifact> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest: Option<Manifest> = if manifest_path.exists() {
            Some(read_json(&manifest_path)?)
        } else {
            None
        };

        let images = load_tensor(&dir.join(IMGS_FILE))?
            .into_dimensionality::<Ix4>()
            .map_err(|_| PoisonsetError::Codec(format!("{}/imgs is not N×C×H×W", dir.display())))?;
        let labels: Vec<u32> = read_json(&dir.join(LABELS_FILE))?;
        let poison_indices: Vec<usize> = read_json(&dir.join(POISON_INDICES_FILE))?;
        let cover_path = dir.join(COVER_INDICES_FILE);
        let cover_indices: Option<Vec<usize>> = if cover_path.exists() {
            Some(read_json(&cover_path)?)
        } else {
            None
        };

        let samples = labels.len();
        if images.len_of(ndarray::Axis(0)) != samples {
            return Err(PoisonsetError::Codec(format!(
                "{}: {} images but {samples} labels",
                dir.display(),
                images.len_of(ndarray::Axis(0))
            )));
        }
        let out_of_range = poison_indices
            .iter()
            .chain(cover_indices.iter().flatten())
            .find(|&&i| i >= samples);
        if let Some(bad) = out_of_range {
            return Err(PoisonsetError::Codec(format!(
                "{}: index {bad} out of range (len {samples})",
                dir.display()
            )));
        }

        let side_names: Vec<String> = match &manifest {
            Some(m) => m.side.clone(),
            None => KNOWN_SIDE_FILES
                .iter()
                .filter(|name| dir.join(name).exists())
                .map(|name| name.to_string())
                .collect(),
        };
        let mut side = SideArtifacts::new();
        for name in side_names {
            let tensor = load_tensor(&dir.join(&name))?;
            side.insert(name, tensor);
        }

        Ok(LoadedArtifact {
            path: dir.to_path_buf(),
            images,
            labels,
            poison_indices,
            cover_indices,
            side,
            manifest,
        })
    }

    /// Existing artifact directories for a dataset, sorted.
    pub fn list(&self, dataset: DatasetId) -> Result<Vec<PathBuf>> {
        let base = self.root.join(dataset.as_str());
        let pattern = format!(
            "{}/*",
            glob::Pattern::escape(&base.to_string_lossy())
        );
        let mut dirs: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| PoisonsetError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|name| !name.to_string_lossy().starts_with('.'))
            })
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)
            .map_err(|e| PoisonsetError::io(format!("creating {}", temp_path.display()), e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)
            .map_err(|e| PoisonsetError::Internal(format!("Serializing {}: {e}", path.display())))?;
        writer
            .flush()
            .map_err(|e| PoisonsetError::io(format!("flushing {}", temp_path.display()), e))?;
    }
    fs::rename(&temp_path, path)
        .map_err(|e| PoisonsetError::io(format!("renaming {}", path.display()), e))
}

/// Side data lands next to the core files; its name must be a plain file
/// name that cannot shadow them.
fn check_side_name(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(".tmp")
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|f| f == name);
    if !plain || RESERVED_FILES.contains(&name) {
        return Err(PoisonsetError::InvalidParameter(format!(
            "side data name '{name}' is not allowed"
        )));
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| PoisonsetError::io(format!("opening {}", path.display()), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PoisonsetError::Codec(format!("{}: {e}", path.display())))
}
